//! Test fixtures shared by the unit tests of every module.

mod memory_store;
mod mock_etcd;
pub(crate) use memory_store::*;
pub(crate) use mock_etcd::*;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::CacheRow;
use crate::DiscoveryConfig;
use crate::Service;
use crate::ServiceCaches;
use crate::ServiceId;

pub(crate) const TEST_NAMESPACE: &str = "/discovery";

pub(crate) fn test_config(node: &str) -> DiscoveryConfig {
    let mut config = DiscoveryConfig::default();
    config.discovery.node_service_name = node.to_string();
    config.lease.ttl_secs = 10;
    config.lease.keep_alive_interval_secs = 3;
    config.discovery.sync_interval_secs = 60;
    config.server.bind_address = "127.0.0.1:0".to_string();
    config
}

pub(crate) fn test_caches() -> Arc<ServiceCaches> {
    Arc::new(ServiceCaches::temporary().expect("open temporary caches"))
}

pub(crate) fn service(
    instance: &str,
    name: &str,
    port: u16,
    ttl: u32,
) -> Service {
    let mut metadata = BTreeMap::new();
    metadata.insert("zone".to_string(), "eu-west".to_string());
    Service::new(
        ServiceId::new(instance, "http", name),
        format!("{instance}.local"),
        port,
        ttl,
        metadata,
    )
    .expect("valid test service")
}

pub(crate) fn row(
    instance: &str,
    name: &str,
    port: u16,
) -> CacheRow {
    service(instance, name, port, 30).to_row()
}
