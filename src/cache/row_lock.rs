use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::ServiceId;

/// Async per-row locks over the LocalCache key space.
///
/// A row's guard is held from the LocalCache mutation until the remote write
/// mirroring it has returned, so remote writes for one service reach the
/// store in the order the local mutations happened. Entries exist only while
/// somebody holds or waits for them.
#[derive(Debug, Default)]
pub(crate) struct RowLocks {
    rows: DashMap<ServiceId, Arc<Mutex<()>>>,
}

impl RowLocks {
    pub(crate) async fn lock(
        &self,
        id: &ServiceId,
    ) -> RowGuard<'_> {
        let row = self.rows.entry(id.clone()).or_default().clone();
        let guard = row.lock_owned().await;
        RowGuard {
            locks: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }
}

pub(crate) struct RowGuard<'a> {
    locks: &'a RowLocks,
    id: ServiceId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RowGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // waiters hold a clone; only the map's reference left means idle
        self.locks
            .rows
            .remove_if(&self.id, |_, row| Arc::strong_count(row) == 1);
    }
}
