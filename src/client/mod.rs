//! Client of the registry gRPC service.
//!
//! # Basic Usage
//! ```no_run
//! use std::collections::BTreeMap;
//! use discoveryd::{DiscoveryClient, Service, ServiceId};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let client = DiscoveryClient::builder("http://127.0.0.1:50051")
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let id = ServiceId::new("node-1", "http", "api");
//!     let service = Service::new(id.clone(), "10.0.0.1", 8080, 30, BTreeMap::new()).unwrap();
//!     assert!(client.register_service(&service).await.unwrap());
//!     assert!(client.keep_alive(&id).await.unwrap());
//!
//!     for listed in client.list_services(None, Some("http")).await.unwrap() {
//!         println!("{} local={}", listed.service.id(), listed.local);
//!     }
//! }
//! ```

mod builder;
mod config;

pub use builder::*;
pub use config::*;


use tonic::codec::CompressionEncoding;
use tonic::transport::Channel;
use tracing::debug;
use tracing::warn;

use crate::proto::discovery;
use crate::proto::discovery::discovery_client::DiscoveryClient as DiscoveryRpcClient;
use crate::Result;
use crate::Service;
use crate::ServiceId;

/// One entry of [`DiscoveryClient::list_services`].
#[derive(Debug, Clone, PartialEq)]
pub struct ListedService {
    pub service: Service,
    /// Hosted by the daemon that answered
    pub local: bool,
}

/// Registers, refreshes and looks up services through a local daemon.
///
/// Cheap to clone; clones share the underlying channel.
#[derive(Clone)]
pub struct DiscoveryClient {
    inner: DiscoveryRpcClient<Channel>,
}

impl DiscoveryClient {
    pub fn builder(endpoint: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(endpoint)
    }

    pub fn new(
        channel: Channel,
        config: &ClientConfig,
    ) -> Self {
        let mut inner = DiscoveryRpcClient::new(channel);
        if config.enable_compression {
            inner = inner
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip);
        }
        Self { inner }
    }

    /// Registers or updates `service`. `false` means the daemon could not
    /// store it locally.
    pub async fn register_service(
        &self,
        service: &Service,
    ) -> Result<bool> {
        let response = self
            .inner
            .clone()
            .register_service(discovery::RegisterServiceRequest::from(service))
            .await?;
        debug!(service = %service.id(), "[:DiscoveryClient:register] {:?}", response.get_ref());
        Ok(response.into_inner().ok)
    }

    pub async fn unregister_service(
        &self,
        id: &ServiceId,
    ) -> Result<bool> {
        let response = self
            .inner
            .clone()
            .unregister_service(discovery::UnregisterServiceRequest {
                service_id: Some(id.into()),
            })
            .await?;
        Ok(response.into_inner().ok)
    }

    /// `false` when the daemon no longer knows the service; register again.
    pub async fn keep_alive(
        &self,
        id: &ServiceId,
    ) -> Result<bool> {
        let response = self
            .inner
            .clone()
            .keep_alive(discovery::KeepAliveRequest {
                service_id: Some(id.into()),
            })
            .await?;
        Ok(response.into_inner().ok)
    }

    /// Services known to the daemon, optionally filtered by instance and
    /// service type. Entries the client cannot decode are skipped.
    pub async fn list_services(
        &self,
        instance: Option<&str>,
        service_type: Option<&str>,
    ) -> Result<Vec<ListedService>> {
        let response = self
            .inner
            .clone()
            .list_services(discovery::ListServicesRequest {
                instance: instance.unwrap_or_default().to_string(),
                service_type: service_type.unwrap_or_default().to_string(),
            })
            .await?;

        Ok(response
            .into_inner()
            .services
            .into_iter()
            .filter_map(|info| {
                let local = info.local;
                match Service::try_from(info) {
                    Ok(service) => Some(ListedService { service, local }),
                    Err(e) => {
                        warn!("skipping malformed service entry: {}", e);
                        None
                    }
                }
            })
            .collect())
    }
}
