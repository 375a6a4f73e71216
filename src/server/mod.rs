//! Process wiring of the discovery daemon.
//!
//! Startup order matters: the global view is imported before the lease is
//! acquired so lookups are answered from a warm cache, and the registry only
//! accepts requests once LocalCache was rebuilt from an inherited lease.


use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic_health::server::health_reporter;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::proto::discovery::discovery_server::DiscoveryServer;
use crate::utils::async_task::drain_tasks;
use crate::utils::async_task::spawn_task;
use crate::DiscoveryConfig;
use crate::Error;
use crate::EtcdClient;
use crate::LeaseManager;
use crate::RegistryServicer;
use crate::RemoteStore;
use crate::Result;
use crate::ServiceCaches;
use crate::ServiceKeyspace;
use crate::Synchronizer;
use crate::WatchEventHandler;
use crate::WatchManager;

pub struct DiscoveryNode<R: RemoteStore> {
    config: DiscoveryConfig,
    remote: Arc<R>,
    caches: Arc<ServiceCaches>,
    lease: Arc<LeaseManager<R>>,
    registry: Arc<RegistryServicer<R>>,
    keyspace: ServiceKeyspace,
    resync: Arc<Notify>,

    /// Stops the background tasks; cancelled with the caller's token too
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<R: RemoteStore> std::fmt::Debug for DiscoveryNode<R> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DiscoveryNode")
            .field("node", &self.config.discovery.node_service_name)
            .field("namespace", &self.keyspace.namespace())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl DiscoveryNode<EtcdClient> {
    /// Node backed by the etcd endpoint of `config.remote`. The connection is
    /// established lazily.
    pub fn connect(
        config: DiscoveryConfig,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let remote = EtcdClient::connect_lazy(&config.remote)?;
        Self::new(config, Arc::new(remote), shutdown)
    }
}

impl<R: RemoteStore> DiscoveryNode<R> {
    pub fn new(
        config: DiscoveryConfig,
        remote: Arc<R>,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        let caches = Arc::new(ServiceCaches::open(&config.storage)?);
        let keyspace = ServiceKeyspace::new(&config.discovery.namespace);
        let lease = Arc::new(LeaseManager::new(remote.clone(), &config));
        let registry = RegistryServicer::new(caches.clone(), remote.clone(), lease.clone(), keyspace.clone());

        Ok(Self {
            config,
            remote,
            caches,
            lease,
            registry,
            keyspace,
            resync: Arc::new(Notify::new()),
            shutdown: shutdown.child_token(),
            tasks: Vec::new(),
        })
    }

    pub fn registry(&self) -> Arc<RegistryServicer<R>> {
        self.registry.clone()
    }

    pub fn caches(&self) -> Arc<ServiceCaches> {
        self.caches.clone()
    }

    pub fn lease_id(&self) -> Option<i64> {
        self.lease.lease_id()
    }

    fn synchronizer(&self) -> Synchronizer<R> {
        Synchronizer::new(
            self.remote.clone(),
            self.caches.clone(),
            self.lease.clone(),
            self.keyspace.clone(),
            self.config.discovery.sync_interval(),
            self.resync.clone(),
        )
    }

    /// Brings the node up and marks the registry ready:
    /// 1. import the remote namespace into GlobalCache
    /// 2. inherit or create the node lease
    /// 3. rebuild LocalCache from the inherited keys
    /// 4. spawn the watch, keep-alive and synchronizer loops
    pub async fn start(&mut self) -> Result<()> {
        let synchronizer = self.synchronizer();
        match synchronizer.import_global().await {
            Ok(Some(summary)) => info!(%summary, "Initial global import finished"),
            Ok(None) => {}
            Err(e) => warn!("initial global import failed: {}", e),
        }

        let inherited = tokio::select! {
            _ = self.shutdown.cancelled() => {
                return Err(Error::Fatal("shutdown requested before a lease was acquired".into()));
            }
            inherited = self.lease.start() => inherited?,
        };
        self.registry.restore(inherited).await?;

        let handler: Arc<dyn WatchEventHandler> = self.registry.clone();
        let watch = WatchManager::new(
            self.remote.clone(),
            self.keyspace.prefix(),
            handler,
            self.config.remote.reconnect,
            self.resync.clone(),
        );
        spawn_task("watch", watch.run(self.shutdown.clone()), &mut self.tasks);
        spawn_task(
            "lease keep-alive",
            self.lease.clone().run(self.shutdown.clone()),
            &mut self.tasks,
        );
        spawn_task(
            "synchronizer",
            synchronizer.run(self.shutdown.clone()),
            &mut self.tasks,
        );

        self.registry.set_ready(true);
        info!(
            node = %self.config.discovery.node_service_name,
            lease_id = ?self.lease.lease_id(),
            "Discovery node started"
        );
        Ok(())
    }

    /// Serves the registry on `listener` until shutdown, then stops the node.
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<()> {
        let (mut health_reporter, health_service) = health_reporter();
        health_reporter
            .set_serving::<DiscoveryServer<RegistryServicer<R>>>()
            .await;

        let mut service = DiscoveryServer::from_arc(self.registry.clone());
        if self.config.server.enable_compression {
            service = service
                .accept_compressed(CompressionEncoding::Gzip)
                .send_compressed(CompressionEncoding::Gzip);
        }

        let addr = listener
            .local_addr()
            .map_err(|e| Error::Server(format!("listener has no local address: {e}")))?;
        info!(%addr, "Registry listening");

        let shutdown = self.shutdown.clone();
        let served = tonic::transport::Server::builder()
            .add_service(health_service)
            .add_service(service)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await;
                warn!("Stopping registry server. {}", addr);
            })
            .await;

        health_reporter
            .set_not_serving::<DiscoveryServer<RegistryServicer<R>>>()
            .await;
        self.stop().await?;
        served.map_err(|e| Error::Server(e.to_string()))
    }

    /// Binds `server.bind_address`, starts the node and serves until the
    /// shutdown token is cancelled.
    pub async fn run(mut self) -> Result<()> {
        let addr: SocketAddr = self.config.server.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Server(format!("failed to bind {addr}: {e}")))?;

        if let Err(e) = self.start().await {
            self.stop().await?;
            return Err(e);
        }
        self.serve(listener).await
    }

    /// Stops every background task within the configured grace period and
    /// flushes the caches. Registrations are kept: a restarted node with the
    /// same name inherits them through its lease.
    pub async fn stop(mut self) -> Result<()> {
        self.registry.set_ready(false);
        self.registry.shutdown();
        self.shutdown.cancel();

        let grace = Duration::from_millis(self.config.server.shutdown_grace_ms);
        if drain_tasks(std::mem::take(&mut self.tasks), grace).await {
            debug!("background tasks drained");
        }
        self.caches.flush().await?;
        info!("Discovery node stopped");
        Ok(())
    }
}
