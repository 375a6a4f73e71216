//! Registration state machine of the services hosted by this node.
//!
//! ```text
//! Unregistered --register--> Registered --unregister / ttl expiry--> Unregistered
//!                            Registered --register / keep_alive--> Registered
//! ```
//!
//! LocalCache mutations are serialized by one mutex, released before the
//! matching remote write is forwarded. The row lock of the service is held
//! across both steps, so the remote writes for one service land in the order
//! of their local mutations. Each registered row owns exactly one expiry
//! timer; touching the row aborts the old timer and schedules a new one under
//! a fresh generation, and a timer only acts if its generation is still the
//! current one.

mod grpc_service;


use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tonic::async_trait;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::CacheChange;
use crate::CacheRow;
use crate::LeaseManager;
use crate::RemoteStore;
use crate::Result;
use crate::Service;
use crate::ServiceCaches;
use crate::ServiceId;
use crate::ServiceKeyspace;
use crate::Upsert;
use crate::WatchEvent;
use crate::WatchEventHandler;

struct ExpiryTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct RegistryServicer<R: RemoteStore> {
    caches: Arc<ServiceCaches>,
    remote: Arc<R>,
    lease: Arc<LeaseManager<R>>,
    keyspace: ServiceKeyspace,

    timers: DashMap<ServiceId, ExpiryTimer>,
    generation: AtomicU64,
    /// Serializes LocalCache mutations
    mutations: Mutex<()>,
    ready: AtomicBool,
    me: Weak<Self>,
}

impl<R: RemoteStore> std::fmt::Debug for RegistryServicer<R> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RegistryServicer")
            .field("namespace", &self.keyspace.namespace())
            .field("timers", &self.timers.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl<R: RemoteStore> RegistryServicer<R> {
    pub fn new(
        caches: Arc<ServiceCaches>,
        remote: Arc<R>,
        lease: Arc<LeaseManager<R>>,
        keyspace: ServiceKeyspace,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            caches,
            remote,
            lease,
            keyspace,
            timers: DashMap::new(),
            generation: AtomicU64::new(0),
            mutations: Mutex::new(()),
            ready: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(
        &self,
        ready: bool,
    ) {
        self.ready.store(ready, Ordering::Release);
    }

    /// Rebuilds LocalCache from the key/value pairs bound to an inherited
    /// lease and schedules their expiry from the stored ttl. Rows left over
    /// from a previous run are dropped first. Returns the number of rows
    /// restored.
    pub async fn restore(
        &self,
        inherited: HashMap<Vec<u8>, Vec<u8>>,
    ) -> Result<usize> {
        let _guard = self.mutations.lock().await;
        self.caches.local().clear()?;

        let mut restored = 0;
        for (key, value) in inherited {
            let Some(row) = self.keyspace.decode(&key, &value) else {
                continue;
            };
            self.caches.local().upsert(&row)?;
            self.schedule_expiry(row.id.clone(), row.ttl);
            restored += 1;
        }
        info!(restored, "Local cache rebuilt from inherited lease");
        Ok(restored)
    }

    /// Writes the row to LocalCache, (re)arms its expiry timer and forwards a
    /// changed row to the remote store. A failed forward is only logged.
    pub async fn register(
        &self,
        service: &Service,
    ) -> Result<Upsert> {
        let row = service.to_row();
        let _row_lock = self.caches.lock_row(&row.id).await;
        let outcome = {
            let _guard = self.mutations.lock().await;
            let outcome = self.caches.local().upsert(&row)?;
            self.schedule_expiry(row.id.clone(), row.ttl);
            outcome
        };

        if outcome.changed() {
            info!(service = %row.id, ?outcome, "Service registered");
            self.forward_put(&row).await;
        } else {
            debug!(service = %row.id, "Service re-registered unchanged");
        }
        Ok(outcome)
    }

    /// Idempotent: an absent row is not an error. Only a failed local delete
    /// is reported.
    pub async fn unregister(
        &self,
        id: &ServiceId,
    ) -> Result<()> {
        let _row_lock = self.caches.lock_row(id).await;
        let removed = {
            let _guard = self.mutations.lock().await;
            let removed = self.caches.local().remove(id)?;
            self.cancel_expiry(id);
            removed
        };

        if removed.is_some() {
            info!(service = %id, "Service unregistered");
            self.forward_delete(id).await;
        }
        Ok(())
    }

    /// Re-arms the expiry timer with the stored ttl. `false` when the row is
    /// unknown and the caller has to register again.
    pub async fn keep_alive(
        &self,
        id: &ServiceId,
    ) -> Result<bool> {
        let _guard = self.mutations.lock().await;
        match self.caches.local().find(id)? {
            Some(row) => {
                self.schedule_expiry(row.id, row.ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Node-local view: GlobalCache overlaid by LocalCache, filtered by the
    /// non-empty criteria. The flag tells whether the row is hosted here.
    pub fn list_services(
        &self,
        instance: Option<&str>,
        service_type: Option<&str>,
    ) -> Result<Vec<(CacheRow, bool)>> {
        let mut view: BTreeMap<ServiceId, (CacheRow, bool)> = BTreeMap::new();
        for row in self.caches.global().all()? {
            view.insert(row.id.clone(), (row, false));
        }
        for row in self.caches.local().all()? {
            view.insert(row.id.clone(), (row, true));
        }

        Ok(view
            .into_values()
            .filter(|(row, _)| instance.map_or(true, |i| row.id.instance == i))
            .filter(|(row, _)| service_type.map_or(true, |t| row.id.service_type == t))
            .collect())
    }

    /// Aborts every pending expiry timer.
    pub fn shutdown(&self) {
        let ids: Vec<ServiceId> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel_expiry(&id);
        }
    }

    #[cfg(test)]
    pub(crate) fn has_timer(
        &self,
        id: &ServiceId,
    ) -> bool {
        self.timers.contains_key(id)
    }

    /// Must be called with the mutation lock held.
    fn schedule_expiry(
        &self,
        id: ServiceId,
        ttl: u32,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let me = self.me.clone();
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            sleep(Duration::from_secs(ttl as u64)).await;
            if let Some(servicer) = me.upgrade() {
                servicer.expire(&timer_id, generation).await;
            }
        });

        if let Some(previous) = self.timers.insert(id, ExpiryTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel_expiry(
        &self,
        id: &ServiceId,
    ) {
        if let Some((_, timer)) = self.timers.remove(id) {
            timer.handle.abort();
        }
    }

    /// Timer callback: unregisters the row unless the timer was replaced.
    async fn expire(
        &self,
        id: &ServiceId,
        generation: u64,
    ) {
        let _row_lock = self.caches.lock_row(id).await;
        let removed = {
            let _guard = self.mutations.lock().await;
            if self
                .timers
                .remove_if(id, |_, timer| timer.generation == generation)
                .is_none()
            {
                debug!(service = %id, "stale expiry ignored");
                return;
            }
            self.caches.local().remove(id)
        };

        match removed {
            Ok(Some(_)) => {
                info!(service = %id, "Service expired");
                self.forward_delete(id).await;
            }
            Ok(None) => {}
            Err(e) => error!(service = %id, "Failed to delete expired service: {}", e),
        }
    }

    async fn forward_put(
        &self,
        row: &CacheRow,
    ) {
        let Some(lease_id) = self.lease.lease_id() else {
            warn!(service = %row.id, "no lease yet, remote write deferred to synchronization");
            return;
        };
        let result = match self.keyspace.encode(row) {
            Ok((key, value)) => self.remote.put(&key, &value, Some(lease_id)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log_forward_failure(&row.id, "put", &e);
        }
    }

    async fn forward_delete(
        &self,
        id: &ServiceId,
    ) {
        if let Err(e) = self.remote.delete(&self.keyspace.key(id)).await {
            log_forward_failure(id, "delete", &e);
        }
    }
}

fn log_forward_failure(
    id: &ServiceId,
    op: &str,
    e: &crate::Error,
) {
    if e.is_unavailable() {
        warn!(service = %id, op, "remote store unavailable, write not forwarded: {}", e);
    } else {
        error!(service = %id, op, "remote write failed: {}", e);
    }
}

/// Watch callback: mirrors remote changes into GlobalCache.
#[async_trait]
impl<R: RemoteStore> WatchEventHandler for RegistryServicer<R> {
    async fn handle_events(
        &self,
        events: Vec<WatchEvent>,
    ) {
        let changes: Vec<CacheChange> = events
            .into_iter()
            .filter_map(|event| match event {
                WatchEvent::Put { key, value, .. } => self.keyspace.decode(&key, &value).map(CacheChange::Put),
                WatchEvent::Delete { key, .. } => self.keyspace.parse_key(&key).map(CacheChange::Delete),
            })
            .collect();
        if changes.is_empty() {
            return;
        }

        match self.caches.global().apply(changes) {
            Ok(summary) if !summary.is_noop() => info!(%summary, "Global cache updated"),
            Ok(_) => {}
            Err(e) => error!("Failed to apply watch events: {}", e),
        }
    }
}
