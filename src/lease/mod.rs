//! Node identity lease.
//!
//! Every remote write this node makes is bound to one lease. The lease id is
//! also stored, unbound, under `<lease_namespace>/<node_service_name>` so a
//! restarted daemon can find and adopt it before it expires, together with
//! the keys still bound to it.
//!
//! ```text
//! NoLease --inherit--> Active
//! NoLease --grant----> Active
//! Active  --ttl 0 / renewal failure--> grant replacement --> Active
//! Active  --Unavailable--> wait channel_ready --> Active
//! ```


use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::BackoffPolicy;
use crate::DiscoveryConfig;
use crate::LeaseKeepAlive;
use crate::RemoteError;
use crate::RemoteStore;
use crate::Result;

/// Sentinel for "no lease granted yet".
const NO_LEASE: i64 = 0;

pub struct LeaseManager<R: RemoteStore> {
    remote: Arc<R>,
    ttl: i64,
    keep_alive_interval: Duration,
    pointer_key: Vec<u8>,
    retry: BackoffPolicy,

    lease_id: AtomicI64,
    changes: watch::Sender<i64>,
}

impl<R: RemoteStore> std::fmt::Debug for LeaseManager<R> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("lease_id", &self.lease_id())
            .field("pointer_key", &String::from_utf8_lossy(&self.pointer_key))
            .finish()
    }
}

impl<R: RemoteStore> LeaseManager<R> {
    pub fn new(
        remote: Arc<R>,
        config: &DiscoveryConfig,
    ) -> Self {
        let (changes, _) = watch::channel(NO_LEASE);
        Self {
            remote,
            ttl: config.lease.ttl_secs,
            keep_alive_interval: config.lease.keep_alive_interval(),
            pointer_key: config.lease_pointer_key().into_bytes(),
            retry: config.remote.reconnect,
            lease_id: AtomicI64::new(NO_LEASE),
            changes,
        }
    }

    /// Current lease id; `None` until [`LeaseManager::start`] succeeded.
    pub fn lease_id(&self) -> Option<i64> {
        match self.lease_id.load(Ordering::Acquire) {
            NO_LEASE => None,
            id => Some(id),
        }
    }

    /// Yields every lease id this manager adopts or creates.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.changes.subscribe()
    }

    /// Inherits the lease named by the pointer key, or creates a new one.
    ///
    /// Returns the key/value pairs still bound to an inherited lease (empty
    /// for a new lease). Waits out remote unavailability; any other error is
    /// returned.
    pub async fn start(&self) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        loop {
            match self.bootstrap().await {
                Ok(inherited) => return Ok(inherited),
                Err(e) if e.is_unavailable() => {
                    warn!("remote store unavailable while acquiring lease: {}", e);
                    self.remote.channel_ready().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn bootstrap(&self) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        if let Some((lease_id, keys)) = self.try_inherit().await? {
            let inherited = self.remote.get_many(keys).await?;
            self.adopt(lease_id);
            info!(lease_id, keys = inherited.len(), "Inherited lease");
            return Ok(inherited);
        }

        let lease_id = self.create_lease().await?;
        info!(lease_id, "Created lease");
        Ok(HashMap::new())
    }

    /// Live lease referenced by the pointer key, with the keys bound to it.
    async fn try_inherit(&self) -> Result<Option<(i64, Vec<Vec<u8>>)>> {
        let Some(value) = self.remote.get(&self.pointer_key).await? else {
            debug!("no lease pointer found");
            return Ok(None);
        };

        let lease_id = match std::str::from_utf8(&value).ok().and_then(|v| v.trim().parse::<i64>().ok()) {
            Some(id) if id != NO_LEASE => id,
            _ => {
                warn!(value = %String::from_utf8_lossy(&value), "ignoring malformed lease pointer");
                return Ok(None);
            }
        };

        let status = self.remote.lease_time_to_live(lease_id).await?;
        if !status.is_alive() {
            info!(lease_id, "previous lease expired");
            return Ok(None);
        }
        Ok(Some((lease_id, status.keys)))
    }

    /// Grants a lease, points the pointer key at it (unbound) and publishes it.
    async fn create_lease(&self) -> Result<i64> {
        let lease_id = self.remote.grant_lease(self.ttl).await?;
        self.remote
            .put(&self.pointer_key, lease_id.to_string().as_bytes(), None)
            .await?;
        self.adopt(lease_id);
        Ok(lease_id)
    }

    fn adopt(
        &self,
        lease_id: i64,
    ) {
        self.lease_id.store(lease_id, Ordering::Release);
        self.changes.send_replace(lease_id);
    }

    /// Keep-alive loop. Runs until `shutdown` is cancelled and never fails:
    /// a dead lease is replaced, an unreachable store is waited for.
    pub async fn run(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.keep_alive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stream: Option<LeaseKeepAlive> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.keep_alive(&mut stream).await {
                Ok(ttl) if ttl > 0 => {
                    trace!(lease_id = ?self.lease_id(), ttl, "Keep-alive OK");
                }
                Ok(_) => {
                    warn!(lease_id = ?self.lease_id(), "Lease expired, creating a replacement");
                    stream = None;
                    self.replace(&shutdown).await;
                }
                Err(e) if e.is_unavailable() || is_stream_closed(&e) => {
                    warn!(lease_id = ?self.lease_id(), "Keep-alive interrupted: {}", e);
                    stream = None;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.remote.channel_ready() => {}
                    }
                }
                Err(e) => {
                    error!(lease_id = ?self.lease_id(), "Keep-alive failed: {}", e);
                    stream = None;
                    self.replace(&shutdown).await;
                }
            }
        }

        debug!("lease keep-alive loop stopped");
        Ok(())
    }

    /// One renewal. Returns the ttl reported by the store, 0 when the lease
    /// is gone.
    async fn keep_alive(
        &self,
        stream: &mut Option<LeaseKeepAlive>,
    ) -> Result<i64> {
        let Some(lease_id) = self.lease_id() else {
            return Ok(0);
        };

        match stream.as_mut() {
            Some(keep_alive) => keep_alive.send(lease_id).await?,
            None => *stream = Some(self.remote.open_lease_keep_alive(lease_id).await?),
        }
        let keep_alive = stream
            .as_mut()
            .ok_or(RemoteError::StreamClosed("lease keep-alive"))?;

        match timeout(self.keep_alive_interval, keep_alive.message()).await {
            Ok(response) => Ok(response?.ttl),
            Err(_) => Err(RemoteError::Unavailable("keep-alive response timed out".into()).into()),
        }
    }

    /// Creates a replacement lease, retrying until it succeeds or shutdown.
    async fn replace(
        &self,
        shutdown: &CancellationToken,
    ) {
        let mut attempt = 0u32;
        loop {
            match self.create_lease().await {
                Ok(lease_id) => {
                    info!(lease_id, "Recreated lease");
                    return;
                }
                Err(e) if e.is_unavailable() => {
                    warn!("remote store unavailable while recreating lease: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = self.remote.channel_ready() => {}
                    }
                }
                Err(e) => {
                    error!(attempt, "failed to recreate lease: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(self.retry.delay(attempt)) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}

fn is_stream_closed(e: &crate::Error) -> bool {
    matches!(e, crate::Error::Remote(RemoteError::StreamClosed(_)))
}
