//! LocalCache and GlobalCache.
//!
//! Both caches are sled trees in one database, keyed by the bincode encoding
//! of [`ServiceId`] and holding bincode-encoded [`CacheRow`]s. Every mutation
//! runs inside a sled transaction that re-reads the row it is about to touch,
//! so a reconciliation computed from a stale snapshot never overwrites a row
//! changed in the meantime.

mod row_lock;

pub(crate) use row_lock::*;

#[cfg(test)]
mod cache_test;

use std::collections::BTreeMap;
use std::fmt;

use sled::transaction::ConflictableTransactionError;
use sled::transaction::TransactionalTree;
use tracing::debug;
use tracing::info;

use crate::CacheRow;
use crate::Result;
use crate::ServiceId;
use crate::StorageConfig;
use crate::StorageError;

const LOCAL_TREE: &str = "local_services";
const GLOBAL_TREE: &str = "global_services";

/// Outcome of writing one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// Stored row already equal
    Unchanged,
    Added,
    Updated,
}

impl Upsert {
    pub fn changed(self) -> bool {
        self != Upsert::Unchanged
    }
}

/// A change delivered to the global cache by a watch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheChange {
    Put(CacheRow),
    Delete(ServiceId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Rows left alone because they changed after the snapshot was taken
    pub skipped: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.deleted == 0
    }
}

impl fmt::Display for ReconcileSummary {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "added={} updated={} deleted={} skipped={}",
            self.added, self.updated, self.deleted, self.skipped
        )
    }
}

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<StorageError>>;

fn abort(e: bincode::Error) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(StorageError::Bincode(e))
}

fn read_row(
    tx: &TransactionalTree,
    key: &[u8],
) -> TxResult<Option<CacheRow>> {
    match tx.get(key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(abort)?)),
        None => Ok(None),
    }
}

/// Row pre-encoded outside the transaction closure, which sled may retry.
struct EncodedRow {
    key: Vec<u8>,
    value: Vec<u8>,
    row: CacheRow,
}

impl EncodedRow {
    fn new(row: CacheRow) -> Result<Self> {
        Ok(Self {
            key: row.id.cache_key()?,
            value: bincode::serialize(&row)?,
            row,
        })
    }
}

/// One service table.
#[derive(Clone)]
pub struct ServiceCache {
    name: &'static str,
    tree: sled::Tree,
}

impl fmt::Debug for ServiceCache {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ServiceCache")
            .field("name", &self.name)
            .field("len", &self.tree.len())
            .finish()
    }
}

impl ServiceCache {
    fn new(
        name: &'static str,
        tree: sled::Tree,
    ) -> Self {
        Self { name, tree }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn find(
        &self,
        id: &ServiceId,
    ) -> Result<Option<CacheRow>> {
        match self.tree.get(id.cache_key()?)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn all(&self) -> Result<Vec<CacheRow>> {
        let mut rows = Vec::with_capacity(self.tree.len());
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Writes `row` unless an equal row is already stored.
    pub fn upsert(
        &self,
        row: &CacheRow,
    ) -> Result<Upsert> {
        let encoded = EncodedRow::new(row.clone())?;
        let outcome = self.tree.transaction(|tx| {
            let outcome = match read_row(tx, &encoded.key)? {
                Some(current) if current == encoded.row => return Ok(Upsert::Unchanged),
                Some(_) => Upsert::Updated,
                None => Upsert::Added,
            };
            tx.insert(encoded.key.as_slice(), encoded.value.as_slice())?;
            Ok(outcome)
        })?;
        Ok(outcome)
    }

    /// Deletes the row for `id`, returning it when it existed.
    pub fn remove(
        &self,
        id: &ServiceId,
    ) -> Result<Option<CacheRow>> {
        let key = id.cache_key()?;
        let removed: Option<CacheRow> = self.tree.transaction(|tx| match tx.remove(key.as_slice())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(abort)?)),
            None => Ok(None),
        })?;
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        Ok(())
    }

    /// Makes the table equal to `target`.
    ///
    /// The diff is computed against a snapshot; the commit re-reads every row
    /// it touches and leaves alone those that no longer match the snapshot.
    pub fn reconcile(
        &self,
        target: Vec<CacheRow>,
    ) -> Result<ReconcileSummary> {
        self.reconcile_from(self.all()?, target)
    }

    pub(crate) fn reconcile_from(
        &self,
        snapshot: Vec<CacheRow>,
        target: Vec<CacheRow>,
    ) -> Result<ReconcileSummary> {
        let snapshot: BTreeMap<ServiceId, CacheRow> =
            snapshot.into_iter().map(|row| (row.id.clone(), row)).collect();
        let target: BTreeMap<ServiceId, CacheRow> =
            target.into_iter().map(|row| (row.id.clone(), row)).collect();

        // (row to write, snapshot value it was diffed against)
        let mut upserts = Vec::new();
        for (id, row) in &target {
            let seen = snapshot.get(id);
            if seen != Some(row) {
                upserts.push((EncodedRow::new(row.clone())?, seen.cloned()));
            }
        }
        let mut deletes = Vec::new();
        for (id, row) in &snapshot {
            if !target.contains_key(id) {
                deletes.push((id.cache_key()?, row.clone()));
            }
        }
        if upserts.is_empty() && deletes.is_empty() {
            return Ok(ReconcileSummary::default());
        }

        let summary = self.tree.transaction(|tx| {
            let mut summary = ReconcileSummary::default();
            for (encoded, seen) in &upserts {
                let current = read_row(tx, &encoded.key)?;
                if current != *seen {
                    summary.skipped += 1;
                    continue;
                }
                tx.insert(encoded.key.as_slice(), encoded.value.as_slice())?;
                if current.is_some() {
                    summary.updated += 1;
                } else {
                    summary.added += 1;
                }
            }
            for (key, seen) in &deletes {
                if read_row(tx, key)?.as_ref() != Some(seen) {
                    summary.skipped += 1;
                    continue;
                }
                tx.remove(key.as_slice())?;
                summary.deleted += 1;
            }
            Ok(summary)
        })?;

        debug!(cache = self.name, %summary, "reconciled");
        Ok(summary)
    }

    /// Applies watch changes in one transaction. Replays are harmless: a put
    /// of an equal row and a delete of an absent row change nothing.
    pub fn apply(
        &self,
        changes: Vec<CacheChange>,
    ) -> Result<ReconcileSummary> {
        enum Encoded {
            Put(EncodedRow),
            Delete(Vec<u8>),
        }
        let encoded = changes
            .into_iter()
            .map(|change| match change {
                CacheChange::Put(row) => EncodedRow::new(row).map(Encoded::Put),
                CacheChange::Delete(id) => id.cache_key().map(Encoded::Delete),
            })
            .collect::<Result<Vec<_>>>()?;

        let summary = self.tree.transaction(|tx| {
            let mut summary = ReconcileSummary::default();
            for change in &encoded {
                match change {
                    Encoded::Put(put) => match read_row(tx, &put.key)? {
                        Some(current) if current == put.row => summary.skipped += 1,
                        current => {
                            tx.insert(put.key.as_slice(), put.value.as_slice())?;
                            if current.is_some() {
                                summary.updated += 1;
                            } else {
                                summary.added += 1;
                            }
                        }
                    },
                    Encoded::Delete(key) => {
                        if tx.remove(key.as_slice())?.is_some() {
                            summary.deleted += 1;
                        } else {
                            summary.skipped += 1;
                        }
                    }
                }
            }
            Ok(summary)
        })?;
        Ok(summary)
    }
}

/// The sled database holding both caches.
#[derive(Debug)]
pub struct ServiceCaches {
    db: sled::Db,
    local: ServiceCache,
    global: ServiceCache,
    rows: RowLocks,
}

impl ServiceCaches {
    /// Opens the configured database, or a temporary one when no path is set.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let db = match &config.db_path {
            Some(path) => {
                debug!("opening cache database at {:?}", path);
                sled::Config::default()
                    .path(path)
                    .flush_every_ms(Some(100))
                    .mode(sled::Mode::LowSpace)
                    .open()
                    .map_err(|e| {
                        tracing::warn!("Try to open DB at this location: {:?} and failed: {:?}", path, e);
                        StorageError::Db(e)
                    })?
            }
            None => sled::Config::new().temporary(true).open()?,
        };
        Self::from_db(db)
    }

    pub fn temporary() -> Result<Self> {
        Self::open(&StorageConfig::default())
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let local = ServiceCache::new(LOCAL_TREE, db.open_tree(LOCAL_TREE)?);
        let global = ServiceCache::new(GLOBAL_TREE, db.open_tree(GLOBAL_TREE)?);
        info!(
            local = local.len(),
            global = global.len(),
            "service caches opened"
        );
        Ok(Self {
            db,
            local,
            global,
            rows: RowLocks::default(),
        })
    }

    /// Services hosted by this node.
    pub fn local(&self) -> &ServiceCache {
        &self.local
    }

    /// Mirror of the cluster-wide registration set.
    pub fn global(&self) -> &ServiceCache {
        &self.global
    }

    /// Locks one LocalCache row together with the remote write mirroring it.
    pub(crate) async fn lock_row(
        &self,
        id: &ServiceId,
    ) -> RowGuard<'_> {
        self.rows.lock(id).await
    }

    #[cfg(test)]
    pub(crate) fn locked_rows(&self) -> usize {
        self.rows.len()
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}
