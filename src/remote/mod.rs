//! Client side of the remote coordination store.
//!
//! [`RemoteStore`] is the seam between the reconciliation engine and the
//! store: key get/put/delete, range scans, bounded transactions, leases and
//! watch streams. [`EtcdClient`] implements it over etcd's v3 gRPC API.
//!
//! Every call fails with [`RemoteError::Unavailable`] while the transport is
//! down; callers wait on [`RemoteStore::channel_ready`] before retrying.

mod etcd_client;
pub use etcd_client::*;


use std::collections::HashMap;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tonic::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::RemoteError;
use crate::Result;

/// A key/value pair as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub mod_revision: i64,
    /// 0 when the key is not bound to a lease
    pub lease: i64,
}

/// One change delivered by a watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        mod_revision: i64,
    },
    Delete {
        key: Vec<u8>,
        mod_revision: i64,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => key,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            WatchEvent::Put { mod_revision, .. } | WatchEvent::Delete { mod_revision, .. } => {
                *mod_revision
            }
        }
    }
}

/// Result of a lease introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatus {
    pub id: i64,
    /// Remaining seconds; `<= 0` means the lease is gone
    pub ttl: i64,
    /// Keys currently bound to the lease
    pub keys: Vec<Vec<u8>>,
}

impl LeaseStatus {
    pub fn is_alive(&self) -> bool {
        self.ttl > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub id: i64,
    /// Renewed ttl; 0 when the lease no longer exists
    pub ttl: i64,
}

/// One sub-operation of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Get {
        key: Vec<u8>,
    },
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<i64>,
    },
    Delete {
        key: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    Get(Option<KeyValue>),
    Put,
    Delete { deleted: i64 },
}

/// One watch response: the store revision it was sent at and the events it
/// carries. The creation acknowledgement arrives as a batch without events,
/// which pins the revision the watch started from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBatch {
    pub revision: i64,
    pub events: Vec<WatchEvent>,
}

impl WatchBatch {
    /// First revision not covered by this batch.
    pub fn next_revision(&self) -> i64 {
        self.events
            .iter()
            .map(WatchEvent::revision)
            .fold(self.revision, i64::max)
            + 1
    }
}

/// Stream of event batches. Ends, or yields an error, when the watch is lost.
pub type WatchStream = BoxStream<'static, Result<WatchBatch>>;

/// Client half of a bidirectional lease keep-alive stream.
pub struct LeaseKeepAlive {
    requests: mpsc::Sender<i64>,
    responses: BoxStream<'static, Result<KeepAliveResponse>>,
}

impl LeaseKeepAlive {
    pub fn new(
        requests: mpsc::Sender<i64>,
        responses: BoxStream<'static, Result<KeepAliveResponse>>,
    ) -> Self {
        Self {
            requests,
            responses,
        }
    }

    /// Queues a keep-alive for `lease_id`.
    pub async fn send(
        &mut self,
        lease_id: i64,
    ) -> Result<()> {
        self.requests
            .send(lease_id)
            .await
            .map_err(|_| RemoteError::StreamClosed("lease keep-alive").into())
    }

    /// Waits for the next keep-alive response.
    pub async fn message(&mut self) -> Result<KeepAliveResponse> {
        match self.responses.next().await {
            Some(response) => response,
            None => Err(RemoteError::StreamClosed("lease keep-alive").into()),
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>>;

    /// All keys in `[key, range_end)`.
    async fn get_range(
        &self,
        key: &[u8],
        range_end: &[u8],
    ) -> Result<Vec<KeyValue>>;

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        lease: Option<i64>,
    ) -> Result<()>;

    async fn delete(
        &self,
        key: &[u8],
    ) -> Result<()>;

    /// Executes `ops` atomically. The store rejects transactions with more
    /// than [`RemoteStore::max_txn_ops`] operations.
    async fn txn(
        &self,
        ops: Vec<TxnOp>,
    ) -> Result<Vec<TxnOpResponse>>;

    async fn grant_lease(
        &self,
        ttl: i64,
    ) -> Result<i64>;

    /// Remaining ttl of a lease together with the keys bound to it.
    async fn lease_time_to_live(
        &self,
        lease_id: i64,
    ) -> Result<LeaseStatus>;

    /// Opens a keep-alive stream and sends the first keep-alive for `lease_id`.
    async fn open_lease_keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<LeaseKeepAlive>;

    /// Watches `[key, range_end)`. `start_revision` of 0 starts at the
    /// current revision; a positive value replays history from that revision.
    async fn open_watch(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        start_revision: i64,
    ) -> Result<WatchStream>;

    /// Resolves once the transport is usable again.
    async fn channel_ready(&self);

    fn max_txn_ops(&self) -> usize;

    /// All keys starting with `prefix`.
    async fn get_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Vec<KeyValue>> {
        self.get_range(prefix, &prefix_range_end(prefix)).await
    }

    /// Reads `keys` in transactions of at most `max_txn_ops` operations.
    /// Missing keys are absent from the result.
    async fn get_many(
        &self,
        keys: Vec<Vec<u8>>,
    ) -> Result<HashMap<Vec<u8>, Vec<u8>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for ops in batched(keys.into_iter().map(|key| TxnOp::Get { key }), self.max_txn_ops()) {
            for response in self.txn(ops).await? {
                if let TxnOpResponse::Get(Some(kv)) = response {
                    found.insert(kv.key, kv.value);
                }
            }
        }
        Ok(found)
    }

    /// Writes `kvs` under `lease` in transactions of at most `max_txn_ops`
    /// operations. Batches already committed stay committed when a later one
    /// fails.
    async fn put_many(
        &self,
        kvs: Vec<(Vec<u8>, Vec<u8>)>,
        lease: Option<i64>,
    ) -> Result<()> {
        let ops = kvs
            .into_iter()
            .map(|(key, value)| TxnOp::Put { key, value, lease });
        for batch in batched(ops, self.max_txn_ops()) {
            self.txn(batch).await?;
        }
        Ok(())
    }
}

/// Exclusive upper bound of the range holding every key with `prefix`.
///
/// The last byte that is not `0xff` is incremented and everything after it is
/// dropped. A prefix made only of `0xff` bytes (or empty) has no upper bound,
/// which etcd spells as `"\0"`.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    vec![0]
}

/// Splits `items` into chunks of at most `max` elements.
pub(crate) fn batched<T>(
    items: impl IntoIterator<Item = T>,
    max: usize,
) -> Vec<Vec<T>> {
    let max = max.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::with_capacity(max);
    for item in items {
        current.push(item);
        if current.len() == max {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(max)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
