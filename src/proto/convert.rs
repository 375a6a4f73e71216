//! Conversions between the registry protobuf messages and domain types.

use std::collections::BTreeMap;

use super::discovery;
use crate::CacheRow;
use crate::CodecError;
use crate::Result;
use crate::Service;
use crate::ServiceId;

impl From<&ServiceId> for discovery::ServiceId {
    fn from(id: &ServiceId) -> Self {
        Self {
            instance: id.instance.clone(),
            service_type: id.service_type.clone(),
            service_name: id.service_name.clone(),
        }
    }
}

impl TryFrom<Option<discovery::ServiceId>> for ServiceId {
    type Error = crate::Error;

    fn try_from(id: Option<discovery::ServiceId>) -> Result<Self> {
        let id = id.ok_or(CodecError::InvalidField {
            field: "service_id",
            reason: "missing".into(),
        })?;
        let id = ServiceId::new(id.instance, id.service_type, id.service_name);
        id.validate()?;
        Ok(id)
    }
}

pub(crate) fn metadata_to_proto(metadata: &BTreeMap<String, String>) -> Vec<discovery::Metadata> {
    metadata
        .iter()
        .map(|(key, value)| discovery::Metadata {
            key: key.clone(),
            value: value.clone(),
        })
        .collect()
}

/// Rejects duplicate keys instead of letting the last one win.
pub(crate) fn metadata_from_proto(entries: Vec<discovery::Metadata>) -> Result<BTreeMap<String, String>> {
    let mut metadata = BTreeMap::new();
    for entry in entries {
        if metadata.contains_key(&entry.key) {
            return Err(CodecError::InvalidField {
                field: "metadata",
                reason: format!("duplicate key `{}`", entry.key),
            }
            .into());
        }
        metadata.insert(entry.key, entry.value);
    }
    Ok(metadata)
}

impl TryFrom<discovery::RegisterServiceRequest> for Service {
    type Error = crate::Error;

    fn try_from(request: discovery::RegisterServiceRequest) -> Result<Self> {
        let id = ServiceId::try_from(request.service_id)?;
        let port = u16::try_from(request.port).map_err(|_| CodecError::InvalidField {
            field: "port",
            reason: format!("{} does not fit in 16 bits", request.port),
        })?;
        Service::new(
            id,
            request.hostname,
            port,
            request.ttl,
            metadata_from_proto(request.metadata)?,
        )
    }
}

impl From<&Service> for discovery::RegisterServiceRequest {
    fn from(service: &Service) -> Self {
        Self {
            service_id: Some(service.id().into()),
            hostname: service.hostname().to_string(),
            port: service.port() as u32,
            ttl: service.ttl(),
            metadata: metadata_to_proto(service.metadata()),
        }
    }
}

pub(crate) fn service_info(
    row: &CacheRow,
    local: bool,
) -> Result<discovery::ServiceInfo> {
    Ok(discovery::ServiceInfo {
        service_id: Some((&row.id).into()),
        hostname: row.hostname.clone(),
        port: row.port as u32,
        ttl: row.ttl,
        metadata: metadata_to_proto(&row.metadata()?),
        local,
    })
}

impl TryFrom<discovery::ServiceInfo> for Service {
    type Error = crate::Error;

    fn try_from(info: discovery::ServiceInfo) -> Result<Self> {
        Self::try_from(discovery::RegisterServiceRequest {
            service_id: info.service_id,
            hostname: info.hostname,
            port: info.port,
            ttl: info.ttl,
            metadata: info.metadata,
        })
    }
}
