//! In-memory [`RemoteStore`] with etcd semantics: revisions, leases that
//! expire and take their bound keys with them, watch fan-out with history
//! replay, bounded transactions, and a switch that takes the store offline.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::async_trait;

use crate::KeepAliveResponse;
use crate::KeyValue;
use crate::LeaseKeepAlive;
use crate::LeaseStatus;
use crate::RemoteError;
use crate::RemoteStore;
use crate::Result;
use crate::TxnOp;
use crate::TxnOpResponse;
use crate::WatchBatch;
use crate::WatchEvent;
use crate::WatchStream;

struct MemLease {
    granted_ttl: i64,
    expires_at: Instant,
}

struct Watcher {
    key: Vec<u8>,
    range_end: Vec<u8>,
    tx: mpsc::UnboundedSender<Result<WatchBatch>>,
}

#[derive(Default)]
struct State {
    revision: i64,
    kvs: BTreeMap<Vec<u8>, KeyValue>,
    leases: HashMap<i64, MemLease>,
    next_lease_id: i64,
    history: Vec<WatchEvent>,
    watchers: Vec<Watcher>,
    keep_alive_streams: Vec<mpsc::UnboundedSender<Result<KeepAliveResponse>>>,
    txn_sizes: Vec<usize>,
    keep_alives: usize,
}

fn in_range(
    key: &[u8],
    start: &[u8],
    end: &[u8],
) -> bool {
    if end.is_empty() {
        return key == start;
    }
    key >= start && (end == [0] || key < end)
}

impl State {
    fn expire_leases(&mut self) {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(
        &mut self,
        id: i64,
    ) {
        if self.leases.remove(&id).is_none() {
            return;
        }
        let bound: Vec<Vec<u8>> = self
            .kvs
            .values()
            .filter(|kv| kv.lease == id)
            .map(|kv| kv.key.clone())
            .collect();
        if bound.is_empty() {
            return;
        }
        self.revision += 1;
        let events = bound
            .into_iter()
            .filter_map(|key| self.delete_at(&key, self.revision))
            .collect();
        self.publish(events);
    }

    fn put_at(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<i64>,
        revision: i64,
    ) -> WatchEvent {
        self.kvs.insert(
            key.clone(),
            KeyValue {
                key: key.clone(),
                value: value.clone(),
                mod_revision: revision,
                lease: lease.unwrap_or_default(),
            },
        );
        WatchEvent::Put {
            key,
            value,
            mod_revision: revision,
        }
    }

    fn delete_at(
        &mut self,
        key: &[u8],
        revision: i64,
    ) -> Option<WatchEvent> {
        self.kvs.remove(key).map(|_| WatchEvent::Delete {
            key: key.to_vec(),
            mod_revision: revision,
        })
    }

    fn check_lease(
        &self,
        lease: Option<i64>,
    ) -> Result<()> {
        match lease {
            Some(id) if id != 0 && !self.leases.contains_key(&id) => {
                Err(tonic::Status::not_found("etcdserver: requested lease not found").into())
            }
            _ => Ok(()),
        }
    }

    fn publish(
        &mut self,
        events: Vec<WatchEvent>,
    ) {
        if events.is_empty() {
            return;
        }
        self.history.extend(events.iter().cloned());
        let revision = self.revision;
        self.watchers.retain(|watcher| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|e| in_range(e.key(), &watcher.key, &watcher.range_end))
                .cloned()
                .collect();
            batch.is_empty()
                || watcher
                    .tx
                    .send(Ok(WatchBatch {
                        revision,
                        events: batch,
                    }))
                    .is_ok()
        });
    }
}

#[derive(Clone)]
pub(crate) struct MemoryRemoteStore {
    state: Arc<Mutex<State>>,
    available: Arc<watch::Sender<bool>>,
    puts_paused: Arc<watch::Sender<bool>>,
    max_txn_ops: usize,
}

impl MemoryRemoteStore {
    pub(crate) fn new() -> Self {
        Self::with_max_txn_ops(128)
    }

    pub(crate) fn with_max_txn_ops(max_txn_ops: usize) -> Self {
        let (available, _) = watch::channel(true);
        let (puts_paused, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(State {
                next_lease_id: 7_000,
                ..Default::default()
            })),
            available: Arc::new(available),
            puts_paused: Arc::new(puts_paused),
            max_txn_ops,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.expire_leases();
        state
    }

    fn check_available(&self) -> Result<()> {
        if *self.available.borrow() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("memory store offline".into()).into())
        }
    }

    /// Takes the store offline (every call fails, open streams error out) or
    /// brings it back.
    pub(crate) fn set_available(
        &self,
        available: bool,
    ) {
        if !available {
            let mut state = self.lock();
            for watcher in state.watchers.drain(..) {
                let _ = watcher
                    .tx
                    .send(Err(RemoteError::Unavailable("memory store offline".into()).into()));
            }
            for stream in state.keep_alive_streams.drain(..) {
                let _ = stream.send(Err(RemoteError::Unavailable("memory store offline".into()).into()));
            }
        }
        self.available.send_replace(available);
    }

    /// Holds every put, plain or inside a transaction, until resumed.
    /// Deletes and reads pass through.
    pub(crate) fn pause_puts(
        &self,
        paused: bool,
    ) {
        self.puts_paused.send_replace(paused);
    }

    async fn puts_resumed(&self) {
        let mut paused = self.puts_paused.subscribe();
        let _ = paused.wait_for(|paused| !*paused).await;
    }

    /// Writes without availability checks, for test setup.
    pub(crate) fn seed(
        &self,
        key: &[u8],
        value: &[u8],
        lease: Option<i64>,
    ) {
        let mut state = self.lock();
        state.revision += 1;
        let revision = state.revision;
        let event = state.put_at(key.to_vec(), value.to_vec(), lease, revision);
        state.publish(vec![event]);
    }

    pub(crate) fn seed_lease(
        &self,
        ttl: i64,
    ) -> i64 {
        let mut state = self.lock();
        state.next_lease_id += 1;
        let id = state.next_lease_id;
        state.leases.insert(
            id,
            MemLease {
                granted_ttl: ttl,
                expires_at: Instant::now() + Duration::from_secs(ttl as u64),
            },
        );
        id
    }

    /// Drops a lease and every key bound to it, as an expiry would.
    pub(crate) fn revoke_lease(
        &self,
        id: i64,
    ) {
        self.lock().drop_lease(id);
    }

    pub(crate) fn is_lease_alive(
        &self,
        id: i64,
    ) -> bool {
        self.lock().leases.contains_key(&id)
    }

    pub(crate) fn value(
        &self,
        key: &[u8],
    ) -> Option<Vec<u8>> {
        self.lock().kvs.get(key).map(|kv| kv.value.clone())
    }

    pub(crate) fn lease_of(
        &self,
        key: &[u8],
    ) -> Option<i64> {
        self.lock().kvs.get(key).map(|kv| kv.lease)
    }

    pub(crate) fn keys(&self) -> Vec<Vec<u8>> {
        self.lock().kvs.keys().cloned().collect()
    }

    pub(crate) fn txn_sizes(&self) -> Vec<usize> {
        self.lock().txn_sizes.clone()
    }

    pub(crate) fn keep_alive_count(&self) -> usize {
        self.lock().keep_alives
    }

    pub(crate) fn watcher_count(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }

    pub(crate) fn revision(&self) -> i64 {
        self.lock().revision
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        Ok(self.lock().kvs.get(key).map(|kv| kv.value.clone()))
    }

    async fn get_range(
        &self,
        key: &[u8],
        range_end: &[u8],
    ) -> Result<Vec<KeyValue>> {
        self.check_available()?;
        Ok(self
            .lock()
            .kvs
            .values()
            .filter(|kv| in_range(&kv.key, key, range_end))
            .cloned()
            .collect())
    }

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        lease: Option<i64>,
    ) -> Result<()> {
        self.check_available()?;
        self.puts_resumed().await;
        let mut state = self.lock();
        state.check_lease(lease)?;
        state.revision += 1;
        let revision = state.revision;
        let event = state.put_at(key.to_vec(), value.to_vec(), lease, revision);
        state.publish(vec![event]);
        Ok(())
    }

    async fn delete(
        &self,
        key: &[u8],
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        if state.kvs.contains_key(key) {
            state.revision += 1;
            let revision = state.revision;
            let events = state.delete_at(key, revision).into_iter().collect();
            state.publish(events);
        }
        Ok(())
    }

    async fn txn(
        &self,
        ops: Vec<TxnOp>,
    ) -> Result<Vec<TxnOpResponse>> {
        self.check_available()?;
        if ops.len() > self.max_txn_ops {
            return Err(tonic::Status::invalid_argument(
                "etcdserver: too many operations in txn request",
            )
            .into());
        }
        if ops.iter().any(|op| matches!(op, TxnOp::Put { .. })) {
            self.puts_resumed().await;
        }

        let mut state = self.lock();
        state.txn_sizes.push(ops.len());
        for op in &ops {
            if let TxnOp::Put { lease, .. } = op {
                state.check_lease(*lease)?;
            }
        }

        let revision = state.revision + 1;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Get { key } => responses.push(TxnOpResponse::Get(state.kvs.get(&key).cloned())),
                TxnOp::Put { key, value, lease } => {
                    events.push(state.put_at(key, value, lease, revision));
                    responses.push(TxnOpResponse::Put);
                }
                TxnOp::Delete { key } => {
                    let deleted = state.delete_at(&key, revision);
                    responses.push(TxnOpResponse::Delete {
                        deleted: deleted.is_some() as i64,
                    });
                    events.extend(deleted);
                }
            }
        }
        if !events.is_empty() {
            state.revision = revision;
        }
        state.publish(events);
        Ok(responses)
    }

    async fn grant_lease(
        &self,
        ttl: i64,
    ) -> Result<i64> {
        self.check_available()?;
        Ok(self.seed_lease(ttl))
    }

    async fn lease_time_to_live(
        &self,
        lease_id: i64,
    ) -> Result<LeaseStatus> {
        self.check_available()?;
        let state = self.lock();
        Ok(match state.leases.get(&lease_id) {
            Some(lease) => LeaseStatus {
                id: lease_id,
                ttl: lease
                    .expires_at
                    .saturating_duration_since(Instant::now())
                    .as_secs()
                    .max(1) as i64,
                keys: state
                    .kvs
                    .values()
                    .filter(|kv| kv.lease == lease_id)
                    .map(|kv| kv.key.clone())
                    .collect(),
            },
            None => LeaseStatus {
                id: lease_id,
                ttl: -1,
                keys: Vec::new(),
            },
        })
    }

    async fn open_lease_keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<LeaseKeepAlive> {
        self.check_available()?;
        let (requests_tx, mut requests_rx) = mpsc::channel::<i64>(4);
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        self.lock().keep_alive_streams.push(responses_tx.clone());

        let store = self.clone();
        tokio::spawn(async move {
            while let Some(id) = requests_rx.recv().await {
                if store.check_available().is_err() {
                    break;
                }
                let ttl = {
                    let mut state = store.lock();
                    state.keep_alives += 1;
                    match state.leases.get_mut(&id) {
                        Some(lease) => {
                            lease.expires_at =
                                Instant::now() + Duration::from_secs(lease.granted_ttl as u64);
                            lease.granted_ttl
                        }
                        None => 0,
                    }
                };
                if responses_tx.send(Ok(KeepAliveResponse { id, ttl })).is_err() {
                    break;
                }
            }
        });

        requests_tx
            .send(lease_id)
            .await
            .map_err(|_| RemoteError::StreamClosed("lease keep-alive"))?;
        Ok(LeaseKeepAlive::new(
            requests_tx,
            UnboundedReceiverStream::new(responses_rx).boxed(),
        ))
    }

    async fn open_watch(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        start_revision: i64,
    ) -> Result<WatchStream> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let revision = state.revision;
        // creation acknowledgement
        let _ = tx.send(Ok(WatchBatch {
            revision,
            events: Vec::new(),
        }));
        if start_revision > 0 {
            let replay: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|e| e.revision() >= start_revision && in_range(e.key(), &key, &range_end))
                .cloned()
                .collect();
            if !replay.is_empty() {
                let _ = tx.send(Ok(WatchBatch {
                    revision,
                    events: replay,
                }));
            }
        }
        state.watchers.push(Watcher { key, range_end, tx });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn channel_ready(&self) {
        let mut available = self.available.subscribe();
        let _ = available.wait_for(|up| *up).await;
    }

    fn max_txn_ops(&self) -> usize {
        self.max_txn_ops
    }
}
