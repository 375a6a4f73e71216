//! [`RemoteStore`] over etcd's v3 gRPC API.
//!
//! The channel is created lazily and reconnects on its own; a call made while
//! etcd is unreachable fails with `Unavailable`, which maps to
//! [`RemoteError::Unavailable`].

use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tonic::async_trait;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::Request;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::KeepAliveResponse;
use super::KeyValue;
use super::LeaseKeepAlive;
use super::LeaseStatus;
use super::RemoteStore;
use super::TxnOp;
use super::TxnOpResponse;
use super::WatchBatch;
use super::WatchEvent;
use super::WatchStream;
use crate::proto::etcdserverpb::kv_client::KvClient;
use crate::proto::etcdserverpb::lease_client::LeaseClient;
use crate::proto::etcdserverpb::request_op;
use crate::proto::etcdserverpb::response_op;
use crate::proto::etcdserverpb::watch_client::WatchClient;
use crate::proto::etcdserverpb::watch_request::RequestUnion;
use crate::proto::etcdserverpb::DeleteRangeRequest;
use crate::proto::etcdserverpb::LeaseGrantRequest;
use crate::proto::etcdserverpb::LeaseKeepAliveRequest;
use crate::proto::etcdserverpb::LeaseTimeToLiveRequest;
use crate::proto::etcdserverpb::PutRequest;
use crate::proto::etcdserverpb::RangeRequest;
use crate::proto::etcdserverpb::RequestOp;
use crate::proto::etcdserverpb::TxnRequest;
use crate::proto::etcdserverpb::WatchCreateRequest;
use crate::proto::etcdserverpb::WatchRequest;
use crate::proto::etcdserverpb::WatchResponse;
use crate::proto::mvccpb;
use crate::proto::mvccpb::event::EventType;
use crate::BackoffPolicy;
use crate::Error;
use crate::RemoteConfig;
use crate::RemoteError;
use crate::Result;

#[derive(Clone)]
pub struct EtcdClient {
    endpoint: Endpoint,
    channel: Channel,
    request_timeout: Duration,
    max_txn_ops: usize,
    reconnect: BackoffPolicy,
}

impl std::fmt::Debug for EtcdClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("EtcdClient")
            .field("endpoint", &self.endpoint.uri())
            .field("max_txn_ops", &self.max_txn_ops)
            .finish()
    }
}

impl EtcdClient {
    /// Creates a client without waiting for the connection to be established.
    pub fn connect_lazy(config: &RemoteConfig) -> Result<Self> {
        let endpoint = Endpoint::from_shared(config.endpoint())
            .map_err(|e| RemoteError::InvalidEndpoint(format!("{}: {}", config.endpoint(), e)))?
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .tcp_nodelay(true)
            .http2_keep_alive_interval(Duration::from_secs(10))
            .keep_alive_while_idle(true);
        let channel = endpoint.connect_lazy();

        info!("remote store client configured (endpoint: {})", endpoint.uri());
        Ok(Self {
            endpoint,
            channel,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_txn_ops: config.max_txn_ops,
            reconnect: config.reconnect,
        })
    }

    /// Unary request with the configured deadline. Streams are never given a
    /// deadline.
    fn unary<T>(
        &self,
        message: T,
    ) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(self.request_timeout);
        request
    }

    fn kv(&self) -> KvClient<Channel> {
        KvClient::new(self.channel.clone())
    }

    fn lease(&self) -> LeaseClient<Channel> {
        LeaseClient::new(self.channel.clone())
    }
}

#[async_trait]
impl RemoteStore for EtcdClient {
    async fn get(
        &self,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let response = self
            .kv()
            .range(self.unary(RangeRequest {
                key: key.to_vec(),
                ..Default::default()
            }))
            .await?
            .into_inner();
        Ok(response.kvs.into_iter().next().map(|kv| kv.value))
    }

    async fn get_range(
        &self,
        key: &[u8],
        range_end: &[u8],
    ) -> Result<Vec<KeyValue>> {
        let response = self
            .kv()
            .range(self.unary(RangeRequest {
                key: key.to_vec(),
                range_end: range_end.to_vec(),
                ..Default::default()
            }))
            .await?
            .into_inner();
        debug!(count = response.count, "range scan");
        Ok(response.kvs.into_iter().map(from_proto_kv).collect())
    }

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        lease: Option<i64>,
    ) -> Result<()> {
        self.kv()
            .put(self.unary(PutRequest {
                key: key.to_vec(),
                value: value.to_vec(),
                lease: lease.unwrap_or_default(),
                ..Default::default()
            }))
            .await?;
        Ok(())
    }

    async fn delete(
        &self,
        key: &[u8],
    ) -> Result<()> {
        self.kv()
            .delete_range(self.unary(DeleteRangeRequest {
                key: key.to_vec(),
                ..Default::default()
            }))
            .await?;
        Ok(())
    }

    async fn txn(
        &self,
        ops: Vec<TxnOp>,
    ) -> Result<Vec<TxnOpResponse>> {
        let success = ops.into_iter().map(to_request_op).collect();
        let response = self
            .kv()
            .txn(self.unary(TxnRequest {
                success,
                failure: Vec::new(),
            }))
            .await?
            .into_inner();

        Ok(response
            .responses
            .into_iter()
            .filter_map(|op| op.response)
            .map(|op| match op {
                response_op::Response::ResponseRange(range) => {
                    TxnOpResponse::Get(range.kvs.into_iter().next().map(from_proto_kv))
                }
                response_op::Response::ResponsePut(_) => TxnOpResponse::Put,
                response_op::Response::ResponseDeleteRange(delete) => TxnOpResponse::Delete {
                    deleted: delete.deleted,
                },
            })
            .collect())
    }

    async fn grant_lease(
        &self,
        ttl: i64,
    ) -> Result<i64> {
        let response = self
            .lease()
            .lease_grant(self.unary(LeaseGrantRequest { ttl, id: 0 }))
            .await?
            .into_inner();
        if !response.error.is_empty() {
            return Err(Error::Remote(RemoteError::Status(Box::new(tonic::Status::internal(
                response.error,
            )))));
        }
        Ok(response.id)
    }

    async fn lease_time_to_live(
        &self,
        lease_id: i64,
    ) -> Result<LeaseStatus> {
        let response = self
            .lease()
            .lease_time_to_live(self.unary(LeaseTimeToLiveRequest {
                id: lease_id,
                keys: true,
            }))
            .await?
            .into_inner();
        Ok(LeaseStatus {
            id: response.id,
            ttl: response.ttl,
            keys: response.keys,
        })
    }

    async fn open_lease_keep_alive(
        &self,
        lease_id: i64,
    ) -> Result<LeaseKeepAlive> {
        let (requests_tx, requests_rx) = mpsc::channel::<i64>(4);
        // etcd only answers once the first request arrives
        requests_tx
            .send(lease_id)
            .await
            .map_err(|_| RemoteError::StreamClosed("lease keep-alive"))?;

        let outbound = ReceiverStream::new(requests_rx).map(|id| LeaseKeepAliveRequest { id });
        let inbound = self.lease().lease_keep_alive(outbound).await?.into_inner();
        let responses = inbound
            .map(|response| {
                response
                    .map(|r| KeepAliveResponse { id: r.id, ttl: r.ttl })
                    .map_err(Error::from)
            })
            .boxed();

        Ok(LeaseKeepAlive::new(requests_tx, responses))
    }

    async fn open_watch(
        &self,
        key: Vec<u8>,
        range_end: Vec<u8>,
        start_revision: i64,
    ) -> Result<WatchStream> {
        let (requests_tx, requests_rx) = mpsc::channel::<WatchRequest>(1);
        requests_tx
            .send(WatchRequest {
                request_union: Some(RequestUnion::CreateRequest(WatchCreateRequest {
                    key,
                    range_end,
                    start_revision,
                    ..Default::default()
                })),
            })
            .await
            .map_err(|_| RemoteError::StreamClosed("watch"))?;

        let inbound = WatchClient::new(self.channel.clone())
            .watch(ReceiverStream::new(requests_rx))
            .await?
            .into_inner();

        // The request sender travels with the stream: dropping it would close
        // the client half and end the watch.
        let stream = futures::stream::unfold(
            (inbound, requests_tx),
            |(mut inbound, requests_tx)| async move {
                loop {
                    match inbound.message().await {
                        Ok(Some(response)) => match watch_batch(response) {
                            Some(item) => return Some((item, (inbound, requests_tx))),
                            None => continue,
                        },
                        Ok(None) => return None,
                        Err(status) => return Some((Err(status.into()), (inbound, requests_tx))),
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn channel_ready(&self) {
        let mut attempt = 0u32;
        loop {
            match self.endpoint.connect().await {
                Ok(_) => {
                    info!("remote store reachable (endpoint: {})", self.endpoint.uri());
                    return;
                }
                Err(e) => {
                    let delay = self.reconnect.delay(attempt);
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                    debug!(attempt, "remote store still unreachable: {}", e);
                    sleep(delay + Duration::from_millis(jitter)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    fn max_txn_ops(&self) -> usize {
        self.max_txn_ops
    }
}

fn to_request_op(op: TxnOp) -> RequestOp {
    let request = match op {
        TxnOp::Get { key } => request_op::Request::RequestRange(RangeRequest {
            key,
            ..Default::default()
        }),
        TxnOp::Put { key, value, lease } => request_op::Request::RequestPut(PutRequest {
            key,
            value,
            lease: lease.unwrap_or_default(),
            ..Default::default()
        }),
        TxnOp::Delete { key } => request_op::Request::RequestDeleteRange(DeleteRangeRequest {
            key,
            ..Default::default()
        }),
    };
    RequestOp {
        request: Some(request),
    }
}

fn from_proto_kv(kv: mvccpb::KeyValue) -> KeyValue {
    KeyValue {
        key: kv.key,
        value: kv.value,
        mod_revision: kv.mod_revision,
        lease: kv.lease,
    }
}

/// Converts one watch response. The creation acknowledgement and progress
/// notifications become batches without events; `None` for responses that
/// carry neither events nor a revision.
pub(super) fn watch_batch(response: WatchResponse) -> Option<Result<WatchBatch>> {
    if response.canceled {
        return Some(Err(RemoteError::WatchCanceled {
            reason: response.cancel_reason,
            compact_revision: response.compact_revision,
        }
        .into()));
    }
    let revision = response.header.as_ref().map_or(0, |header| header.revision);
    if response.events.is_empty() && revision == 0 {
        return None;
    }

    let events = response
        .events
        .into_iter()
        .filter_map(|event| {
            let kind = match EventType::try_from(event.r#type) {
                Ok(kind) => kind,
                Err(_) => {
                    warn!("Ignoring unknown event type ({})", event.r#type);
                    return None;
                }
            };
            let kv = event.kv?;
            Some(match kind {
                EventType::Put => WatchEvent::Put {
                    key: kv.key,
                    value: kv.value,
                    mod_revision: kv.mod_revision,
                },
                EventType::Delete => WatchEvent::Delete {
                    key: kv.key,
                    mod_revision: kv.mod_revision,
                },
            })
        })
        .collect();
    Some(Ok(WatchBatch { revision, events }))
}
