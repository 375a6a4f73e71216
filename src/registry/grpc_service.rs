//! Registry gRPC surface. Requests are validated here; malformed ones are
//! answered with `INVALID_ARGUMENT`, everything else with an `ok` flag.

use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::error;
use tracing::warn;

use super::RegistryServicer;
use crate::proto::discovery::discovery_server::Discovery;
use crate::proto::discovery::KeepAliveRequest;
use crate::proto::discovery::KeepAliveResponse;
use crate::proto::discovery::ListServicesRequest;
use crate::proto::discovery::ListServicesResponse;
use crate::proto::discovery::RegisterServiceRequest;
use crate::proto::discovery::RegisterServiceResponse;
use crate::proto::discovery::UnregisterServiceRequest;
use crate::proto::discovery::UnregisterServiceResponse;
use crate::proto::service_info;
use crate::RemoteStore;
use crate::Service;
use crate::ServiceId;

impl<R: RemoteStore> RegistryServicer<R> {
    fn ensure_ready(
        &self,
        rpc: &str,
    ) -> std::result::Result<(), Status> {
        if !self.is_ready() {
            warn!("[rpc|{}] registry is not ready!", rpc);
            return Err(Status::unavailable("Service is not ready"));
        }
        Ok(())
    }
}

fn invalid(e: crate::Error) -> Status {
    Status::invalid_argument(e.to_string())
}

/// Empty filter fields match everything.
fn filter(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

#[tonic::async_trait]
impl<R: RemoteStore> Discovery for RegistryServicer<R> {
    #[tracing::instrument(skip(self))]
    async fn register_service(
        &self,
        request: Request<RegisterServiceRequest>,
    ) -> std::result::Result<Response<RegisterServiceResponse>, Status> {
        self.ensure_ready("register_service")?;
        let service = Service::try_from(request.into_inner()).map_err(invalid)?;

        let ok = match self.register(&service).await {
            Ok(_) => true,
            Err(e) => {
                error!(service = %service.id(), "Failed to register service: {}", e);
                false
            }
        };
        Ok(Response::new(RegisterServiceResponse { ok }))
    }

    #[tracing::instrument(skip(self))]
    async fn unregister_service(
        &self,
        request: Request<UnregisterServiceRequest>,
    ) -> std::result::Result<Response<UnregisterServiceResponse>, Status> {
        self.ensure_ready("unregister_service")?;
        let id = ServiceId::try_from(request.into_inner().service_id).map_err(invalid)?;

        let ok = match self.unregister(&id).await {
            Ok(()) => true,
            Err(e) => {
                error!(service = %id, "Failed to unregister service: {}", e);
                false
            }
        };
        Ok(Response::new(UnregisterServiceResponse { ok }))
    }

    #[tracing::instrument(skip(self))]
    async fn keep_alive(
        &self,
        request: Request<KeepAliveRequest>,
    ) -> std::result::Result<Response<KeepAliveResponse>, Status> {
        self.ensure_ready("keep_alive")?;
        let id = ServiceId::try_from(request.into_inner().service_id).map_err(invalid)?;

        let ok = match RegistryServicer::keep_alive(self, &id).await {
            Ok(found) => found,
            Err(e) => {
                error!(service = %id, "Failed to refresh service: {}", e);
                false
            }
        };
        Ok(Response::new(KeepAliveResponse { ok }))
    }

    #[tracing::instrument(skip(self))]
    async fn list_services(
        &self,
        request: Request<ListServicesRequest>,
    ) -> std::result::Result<Response<ListServicesResponse>, Status> {
        self.ensure_ready("list_services")?;
        let request = request.into_inner();

        let rows = RegistryServicer::list_services(self, filter(&request.instance), filter(&request.service_type))
            .map_err(|e| {
                error!("Failed to read caches: {}", e);
                Status::internal(e.to_string())
            })?;
        let services = rows
            .iter()
            .filter_map(|(row, local)| match service_info(row, *local) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(service = %row.id, "skipping undecodable row: {}", e);
                    None
                }
            })
            .collect();
        Ok(Response::new(ListServicesResponse { services }))
    }
}
