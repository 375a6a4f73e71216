//! Periodic two-phase reconciliation.
//!
//! Phase A makes GlobalCache an exact copy of the remote namespace. Phase B
//! re-publishes every LocalCache row the GlobalCache does not agree with,
//! under the current lease. Phase A is authoritative and destructive, Phase B
//! is corrective only: it never deletes rows owned by other nodes.


use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::CacheRow;
use crate::LeaseManager;
use crate::ReconcileSummary;
use crate::RemoteStore;
use crate::Result;
use crate::ServiceCaches;
use crate::ServiceKeyspace;

/// Outcome of one synchronization cycle. `None` marks a skipped phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub imported: Option<ReconcileSummary>,
    pub republished: Option<usize>,
}

impl fmt::Display for SyncReport {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.imported {
            Some(summary) => write!(f, "global: {summary}")?,
            None => write!(f, "global: skipped")?,
        }
        match self.republished {
            Some(count) => write!(f, ", republished: {count}"),
            None => write!(f, ", republished: skipped"),
        }
    }
}

pub struct Synchronizer<R: RemoteStore> {
    remote: Arc<R>,
    caches: Arc<ServiceCaches>,
    lease: Arc<LeaseManager<R>>,
    keyspace: ServiceKeyspace,
    interval: Duration,
    resync: Arc<Notify>,
}

impl<R: RemoteStore> Synchronizer<R> {
    pub fn new(
        remote: Arc<R>,
        caches: Arc<ServiceCaches>,
        lease: Arc<LeaseManager<R>>,
        keyspace: ServiceKeyspace,
        interval: Duration,
        resync: Arc<Notify>,
    ) -> Self {
        Self {
            remote,
            caches,
            lease,
            keyspace,
            interval,
            resync,
        }
    }

    /// Remote → GlobalCache. Returns `None` when the remote store cannot be
    /// read: nothing is reconciled from a partial view.
    pub async fn import_global(&self) -> Result<Option<ReconcileSummary>> {
        let kvs = match self.remote.get_prefix(&self.keyspace.prefix()).await {
            Ok(kvs) => kvs,
            Err(e) if e.is_unavailable() => {
                warn!("remote store unavailable, skipping global import: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let target: Vec<CacheRow> = kvs
            .iter()
            .filter_map(|kv| self.keyspace.decode(&kv.key, &kv.value))
            .collect();
        debug!(fetched = kvs.len(), decoded = target.len(), "remote namespace scanned");

        let summary = self.caches.global().reconcile(target)?;
        Ok(Some(summary))
    }

    /// LocalCache → remote, for rows GlobalCache is missing or disagrees
    /// with. Returns how many rows were written, `None` when skipped.
    pub async fn republish_local(&self) -> Result<Option<usize>> {
        let Some(lease_id) = self.lease.lease_id() else {
            debug!("no lease yet, skipping local republish");
            return Ok(None);
        };

        let global = self.caches.global();
        let mut stale = Vec::new();
        for row in self.caches.local().all()? {
            if global.find(&row.id)?.as_ref() != Some(&row) {
                stale.push(row.id);
            }
        }
        if stale.is_empty() {
            return Ok(Some(0));
        }

        // taken in key order, held until the batch is written
        stale.sort();
        let mut row_locks = Vec::with_capacity(stale.len());
        for id in &stale {
            row_locks.push(self.caches.lock_row(id).await);
        }
        let mut kvs = Vec::with_capacity(stale.len());
        for id in &stale {
            match self.caches.local().find(id)? {
                Some(row) => {
                    debug!(service = %row.id, "queueing local row for republish");
                    kvs.push(self.keyspace.encode(&row)?);
                }
                None => debug!(service = %id, "row removed before republish"),
            }
        }

        let count = kvs.len();
        if count == 0 {
            return Ok(Some(0));
        }
        let written = self.remote.put_many(kvs, Some(lease_id)).await;
        drop(row_locks);
        match written {
            Ok(()) => Ok(Some(count)),
            Err(e) if e.is_unavailable() => {
                warn!("remote store unavailable, skipping local republish: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Phase A then Phase B. A failing phase is logged and does not stop the
    /// other one.
    pub async fn sync_once(&self) -> SyncReport {
        let imported = self.import_global().await.unwrap_or_else(|e| {
            error!("global import failed: {}", e);
            None
        });
        let republished = self.republish_local().await.unwrap_or_else(|e| {
            error!("local republish failed: {}", e);
            None
        });
        SyncReport {
            imported,
            republished,
        }
    }

    /// Runs a cycle immediately, then every interval, and additionally
    /// whenever the lease changes or a resync is requested.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lease_changes = self.lease.subscribe();
        lease_changes.borrow_and_update();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                Ok(()) = lease_changes.changed() => {
                    info!(lease_id = *lease_changes.borrow_and_update(), "Lease changed, synchronizing");
                }
                _ = self.resync.notified() => {
                    info!("Resync requested");
                }
            }

            let report = self.sync_once().await;
            info!(%report, "Synchronization finished");
        }

        debug!("synchronizer stopped");
        Ok(())
    }
}
