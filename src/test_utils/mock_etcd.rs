//! Minimal etcd gRPC server for exercising [`crate::EtcdClient`] over a real
//! transport. KV keeps a sorted map, leases never expire, and watches replay a
//! canned list of responses.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::async_trait;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tonic::Streaming;
use tracing::debug;

use crate::proto::etcdserverpb::kv_server::Kv;
use crate::proto::etcdserverpb::kv_server::KvServer;
use crate::proto::etcdserverpb::lease_server::Lease;
use crate::proto::etcdserverpb::lease_server::LeaseServer;
use crate::proto::etcdserverpb::request_op;
use crate::proto::etcdserverpb::response_op;
use crate::proto::etcdserverpb::watch_server::Watch;
use crate::proto::etcdserverpb::watch_server::WatchServer;
use crate::proto::etcdserverpb::DeleteRangeRequest;
use crate::proto::etcdserverpb::DeleteRangeResponse;
use crate::proto::etcdserverpb::LeaseGrantRequest;
use crate::proto::etcdserverpb::LeaseGrantResponse;
use crate::proto::etcdserverpb::LeaseKeepAliveRequest;
use crate::proto::etcdserverpb::LeaseKeepAliveResponse;
use crate::proto::etcdserverpb::LeaseTimeToLiveRequest;
use crate::proto::etcdserverpb::LeaseTimeToLiveResponse;
use crate::proto::etcdserverpb::PutRequest;
use crate::proto::etcdserverpb::PutResponse;
use crate::proto::etcdserverpb::RangeRequest;
use crate::proto::etcdserverpb::RangeResponse;
use crate::proto::etcdserverpb::ResponseHeader;
use crate::proto::etcdserverpb::ResponseOp;
use crate::proto::etcdserverpb::TxnRequest;
use crate::proto::etcdserverpb::TxnResponse;
use crate::proto::etcdserverpb::WatchRequest;
use crate::proto::etcdserverpb::WatchResponse;
use crate::proto::mvccpb::KeyValue;

#[derive(Default)]
struct MockEtcdState {
    revision: i64,
    kvs: BTreeMap<Vec<u8>, KeyValue>,
    leases: BTreeMap<i64, i64>,
    next_lease_id: i64,
    txn_sizes: Vec<usize>,
}

impl MockEtcdState {
    fn range(
        &self,
        request: &RangeRequest,
    ) -> RangeResponse {
        let kvs: Vec<KeyValue> = self
            .kvs
            .values()
            .filter(|kv| {
                if request.range_end.is_empty() {
                    kv.key == request.key
                } else {
                    kv.key >= request.key && (request.range_end == [0] || kv.key < request.range_end)
                }
            })
            .cloned()
            .collect();
        RangeResponse {
            count: kvs.len() as i64,
            kvs,
            ..Default::default()
        }
    }

    fn put(
        &mut self,
        request: PutRequest,
        revision: i64,
    ) -> Result<PutResponse, Status> {
        if request.lease != 0 && !self.leases.contains_key(&request.lease) {
            return Err(Status::not_found("etcdserver: requested lease not found"));
        }
        self.kvs.insert(
            request.key.clone(),
            KeyValue {
                key: request.key,
                value: request.value,
                mod_revision: revision,
                lease: request.lease,
                ..Default::default()
            },
        );
        Ok(PutResponse::default())
    }

    fn delete(
        &mut self,
        request: &DeleteRangeRequest,
    ) -> DeleteRangeResponse {
        DeleteRangeResponse {
            deleted: self.kvs.remove(&request.key).is_some() as i64,
            ..Default::default()
        }
    }
}

/// Server half of the mock. Cloned handles share the same state.
#[derive(Clone, Default)]
pub(crate) struct MockEtcd {
    state: Arc<Mutex<MockEtcdState>>,
    watch_responses: Arc<Vec<WatchResponse>>,
}

impl MockEtcd {
    pub(crate) fn with_watch_responses(responses: Vec<WatchResponse>) -> Self {
        Self {
            watch_responses: Arc::new(responses),
            ..Default::default()
        }
    }

    pub(crate) fn txn_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().txn_sizes.clone()
    }

    pub(crate) fn lease_of(
        &self,
        key: &[u8],
    ) -> Option<i64> {
        self.state.lock().unwrap().kvs.get(key).map(|kv| kv.lease)
    }

    /// Serves KV, Lease and Watch on an ephemeral port until `shutdown` fires.
    pub(crate) async fn serve(
        self,
        shutdown: oneshot::Receiver<()>,
    ) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        debug!("starting mock etcd on {addr}");

        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(KvServer::new(self.clone()))
                .add_service(LeaseServer::new(self.clone()))
                .add_service(WatchServer::new(self))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::TcpListenerStream::new(listener),
                    async {
                        shutdown.await.ok();
                    },
                )
                .await
                .unwrap();
        });
        addr
    }
}

#[async_trait]
impl Kv for MockEtcd {
    async fn range(
        &self,
        request: Request<RangeRequest>,
    ) -> Result<Response<RangeResponse>, Status> {
        let state = self.state.lock().unwrap();
        Ok(Response::new(state.range(request.get_ref())))
    }

    async fn put(
        &self,
        request: Request<PutRequest>,
    ) -> Result<Response<PutResponse>, Status> {
        let mut state = self.state.lock().unwrap();
        let revision = state.revision + 1;
        let response = state.put(request.into_inner(), revision)?;
        state.revision = revision;
        Ok(Response::new(response))
    }

    async fn delete_range(
        &self,
        request: Request<DeleteRangeRequest>,
    ) -> Result<Response<DeleteRangeResponse>, Status> {
        let mut state = self.state.lock().unwrap();
        Ok(Response::new(state.delete(request.get_ref())))
    }

    async fn txn(
        &self,
        request: Request<TxnRequest>,
    ) -> Result<Response<TxnResponse>, Status> {
        let request = request.into_inner();
        let mut state = self.state.lock().unwrap();
        state.txn_sizes.push(request.success.len());
        let revision = state.revision + 1;

        let mut responses = Vec::with_capacity(request.success.len());
        for op in request.success {
            let response = match op.request {
                Some(request_op::Request::RequestRange(range)) => {
                    response_op::Response::ResponseRange(state.range(&range))
                }
                Some(request_op::Request::RequestPut(put)) => {
                    response_op::Response::ResponsePut(state.put(put, revision)?)
                }
                Some(request_op::Request::RequestDeleteRange(delete)) => {
                    response_op::Response::ResponseDeleteRange(state.delete(&delete))
                }
                None => return Err(Status::invalid_argument("empty request op")),
            };
            responses.push(ResponseOp {
                response: Some(response),
            });
        }
        state.revision = revision;

        Ok(Response::new(TxnResponse {
            succeeded: true,
            responses,
            ..Default::default()
        }))
    }
}

#[async_trait]
impl Lease for MockEtcd {
    async fn lease_grant(
        &self,
        request: Request<LeaseGrantRequest>,
    ) -> Result<Response<LeaseGrantResponse>, Status> {
        let ttl = request.into_inner().ttl;
        let mut state = self.state.lock().unwrap();
        state.next_lease_id += 1;
        let id = state.next_lease_id;
        state.leases.insert(id, ttl);
        Ok(Response::new(LeaseGrantResponse {
            id,
            ttl,
            ..Default::default()
        }))
    }

    type LeaseKeepAliveStream = BoxStream<'static, Result<LeaseKeepAliveResponse, Status>>;

    async fn lease_keep_alive(
        &self,
        request: Request<Streaming<LeaseKeepAliveRequest>>,
    ) -> Result<Response<Self::LeaseKeepAliveStream>, Status> {
        let state = self.state.clone();
        let keep_alive = move |request: Result<LeaseKeepAliveRequest, Status>| -> Result<LeaseKeepAliveResponse, Status> {
            let id = request?.id;
            let ttl = state.lock().unwrap().leases.get(&id).copied().unwrap_or(0);
            Ok(LeaseKeepAliveResponse {
                id,
                ttl,
                ..Default::default()
            })
        };
        let responses = request.into_inner().map(keep_alive);
        Ok(Response::new(responses.boxed()))
    }

    async fn lease_time_to_live(
        &self,
        request: Request<LeaseTimeToLiveRequest>,
    ) -> Result<Response<LeaseTimeToLiveResponse>, Status> {
        let id = request.into_inner().id;
        let state = self.state.lock().unwrap();
        let (ttl, keys) = match state.leases.get(&id) {
            Some(ttl) => (
                *ttl,
                state
                    .kvs
                    .values()
                    .filter(|kv| kv.lease == id)
                    .map(|kv| kv.key.clone())
                    .collect(),
            ),
            None => (-1, Vec::new()),
        };
        Ok(Response::new(LeaseTimeToLiveResponse {
            id,
            ttl,
            granted_ttl: ttl.max(0),
            keys,
            ..Default::default()
        }))
    }
}

#[async_trait]
impl Watch for MockEtcd {
    type WatchStream = BoxStream<'static, Result<WatchResponse, Status>>;

    async fn watch(
        &self,
        request: Request<Streaming<WatchRequest>>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let mut inbound = request.into_inner();
        // wait for the create request before replaying
        inbound.message().await?;

        let created = WatchResponse {
            header: Some(ResponseHeader {
                revision: self.state.lock().unwrap().revision,
                ..Default::default()
            }),
            created: true,
            ..Default::default()
        };
        let replay: Vec<Result<WatchResponse, Status>> = std::iter::once(created)
            .chain(self.watch_responses.iter().cloned())
            .map(Ok)
            .collect();
        // keep the inbound half open so the stream is not torn down early
        let stream = futures::stream::iter(replay).chain(futures::stream::unfold(inbound, |mut inbound| async move {
            match inbound.message().await {
                Ok(Some(_)) => Some((Err(Status::unimplemented("watch cancel")), inbound)),
                _ => None,
            }
        }));
        Ok(Response::new(stream.boxed()))
    }
}
