//! Service value objects and their derived views.
//!
//! A [`Service`] is built transiently from a registration request. Everything
//! persisted is derived from it: the [`CacheRow`] stored in the local and
//! global caches, and the remote key/value pair produced by
//! [`ServiceKeyspace`].
//!
//! Remote layout:
//! ```text
//! <namespace>/<instance>/<service_type>/<service_name>
//!     -> {"hostname": "..", "port": "..", "ttl": "..", <metadata>...}
//! ```
//! The JSON object is written with sorted keys, so two equal services always
//! produce the same bytes and remote values can be diffed byte-wise.


use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::normalize_namespace;
use crate::CodecError;
use crate::Result;

pub(crate) const FIELD_HOSTNAME: &str = "hostname";
pub(crate) const FIELD_PORT: &str = "port";
pub(crate) const FIELD_TTL: &str = "ttl";
const RESERVED_FIELDS: [&str; 3] = [FIELD_HOSTNAME, FIELD_PORT, FIELD_TTL];

/// Primary key of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId {
    pub instance: String,
    pub service_type: String,
    pub service_name: String,
}

impl ServiceId {
    pub fn new(
        instance: impl Into<String>,
        service_type: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            service_type: service_type.into(),
            service_name: service_name.into(),
        }
    }

    /// Each segment becomes one key segment in the remote store, so it must
    /// be non-empty and free of separators.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("instance", &self.instance),
            ("service_type", &self.service_type),
            ("service_name", &self.service_name),
        ] {
            if value.is_empty() {
                return Err(CodecError::InvalidField {
                    field,
                    reason: "must not be empty".into(),
                }
                .into());
            }
            if value.contains('/') {
                return Err(CodecError::InvalidField {
                    field,
                    reason: format!("`{value}` must not contain `/`"),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Key of the row inside a cache tree.
    pub(crate) fn cache_key(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}/{}", self.instance, self.service_type, self.service_name)
    }
}

/// A registration as submitted by a client. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    id: ServiceId,
    hostname: String,
    port: u16,
    ttl: u32,
    metadata: BTreeMap<String, String>,
}

impl Service {
    /// Builds a validated service.
    ///
    /// # Errors
    /// - [`CodecError::InvalidField`] for empty/separator-bearing ids or a zero ttl
    /// - [`CodecError::ReservedMetadataKey`] when metadata shadows hostname/port/ttl
    pub fn new(
        id: ServiceId,
        hostname: impl Into<String>,
        port: u16,
        ttl: u32,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self> {
        id.validate()?;
        if ttl == 0 {
            return Err(CodecError::InvalidField {
                field: FIELD_TTL,
                reason: "must be greater than 0".into(),
            }
            .into());
        }
        if let Some(key) = metadata.keys().find(|k| RESERVED_FIELDS.contains(&k.as_str())) {
            return Err(CodecError::ReservedMetadataKey(key.clone()).into());
        }
        if metadata.keys().any(|k| k.is_empty()) {
            return Err(CodecError::InvalidField {
                field: "metadata",
                reason: "keys must not be empty".into(),
            }
            .into());
        }

        Ok(Self {
            id,
            hostname: hostname.into(),
            port,
            ttl,
            metadata,
        })
    }

    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn to_row(&self) -> CacheRow {
        CacheRow {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            ttl: self.ttl,
            // BTreeMap<String, String> serialization cannot fail
            data: serde_json::to_string(&self.metadata).unwrap_or_else(|_| "{}".to_string()),
        }
    }
}

/// One row of the local or global cache.
///
/// `data` holds the serialized metadata. Equality compares the deserialized
/// metadata, not the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRow {
    pub id: ServiceId,
    pub hostname: String,
    pub port: u16,
    pub ttl: u32,
    pub data: String,
}

impl CacheRow {
    pub fn metadata(&self) -> Result<BTreeMap<String, String>> {
        Ok(serde_json::from_str(&self.data)?)
    }

    pub fn to_service(&self) -> Result<Service> {
        Service::new(
            self.id.clone(),
            self.hostname.clone(),
            self.port,
            self.ttl,
            self.metadata()?,
        )
    }
}

impl PartialEq for CacheRow {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        if self.id != other.id
            || self.hostname != other.hostname
            || self.port != other.port
            || self.ttl != other.ttl
        {
            return false;
        }
        match (self.metadata(), other.metadata()) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.data == other.data,
        }
    }
}

impl Eq for CacheRow {}

/// Maps services to and from keys under one namespace of the remote store.
#[derive(Debug, Clone)]
pub struct ServiceKeyspace {
    namespace: String,
}

impl ServiceKeyspace {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: normalize_namespace(namespace),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Prefix shared by every service key, including the trailing separator.
    pub fn prefix(&self) -> Vec<u8> {
        format!("{}/", self.namespace).into_bytes()
    }

    pub fn key(
        &self,
        id: &ServiceId,
    ) -> Vec<u8> {
        format!(
            "{}/{}/{}/{}",
            self.namespace, id.instance, id.service_type, id.service_name
        )
        .into_bytes()
    }

    /// Reverse of [`ServiceKeyspace::key`]. Keys outside the namespace or with
    /// the wrong segment count are not ours and yield `None`.
    pub fn parse_key(
        &self,
        key: &[u8],
    ) -> Option<ServiceId> {
        let key = std::str::from_utf8(key).ok()?;
        let rest = key.strip_prefix(self.namespace.as_str())?.strip_prefix('/')?;

        let mut segments = rest.split('/');
        let id = ServiceId::new(segments.next()?, segments.next()?, segments.next()?);
        if segments.next().is_some() || id.validate().is_err() {
            return None;
        }
        Some(id)
    }

    /// Canonical remote value of a row: sorted keys, all values strings.
    pub fn encode_value(
        &self,
        row: &CacheRow,
    ) -> Result<Vec<u8>> {
        let mut object: BTreeMap<String, Value> = row
            .metadata()?
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        object.insert(FIELD_HOSTNAME.into(), Value::String(row.hostname.clone()));
        object.insert(FIELD_PORT.into(), Value::String(row.port.to_string()));
        object.insert(FIELD_TTL.into(), Value::String(row.ttl.to_string()));
        Ok(serde_json::to_vec(&object)?)
    }

    pub fn encode(
        &self,
        row: &CacheRow,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((self.key(&row.id), self.encode_value(row)?))
    }

    /// Decodes a remote key/value pair into a row.
    ///
    /// Malformed entries are dropped (`None`): they belong to another writer
    /// or namespace and are never retried.
    pub fn decode(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> Option<CacheRow> {
        let id = self.parse_key(key)?;
        match decode_value(id, value) {
            Ok(row) => Some(row),
            Err(e) => {
                debug!(key = %String::from_utf8_lossy(key), "dropping malformed service value: {}", e);
                None
            }
        }
    }
}

fn decode_value(
    id: ServiceId,
    value: &[u8],
) -> std::result::Result<CacheRow, CodecError> {
    let object: BTreeMap<String, Value> = serde_json::from_slice(value)?;

    let mut hostname = None;
    let mut port = None;
    let mut ttl = None;
    let mut metadata = BTreeMap::new();
    for (key, value) in object {
        match key.as_str() {
            FIELD_HOSTNAME => match value {
                Value::String(s) => hostname = Some(s),
                other => return Err(invalid(FIELD_HOSTNAME, &other)),
            },
            FIELD_PORT => port = Some(decode_integer::<u16>(FIELD_PORT, &value)?),
            FIELD_TTL => ttl = Some(decode_integer::<u32>(FIELD_TTL, &value)?),
            _ => {
                // metadata values are opaque strings
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                metadata.insert(key, value);
            }
        }
    }

    let missing = |field| CodecError::InvalidField {
        field,
        reason: "missing".into(),
    };
    Ok(CacheRow {
        id,
        hostname: hostname.ok_or_else(|| missing(FIELD_HOSTNAME))?,
        port: port.ok_or_else(|| missing(FIELD_PORT))?,
        ttl: ttl.ok_or_else(|| missing(FIELD_TTL))?,
        data: serde_json::to_string(&metadata)?,
    })
}

/// Accepts both a JSON number and a decimal string.
fn decode_integer<T>(
    field: &'static str,
    value: &Value,
) -> std::result::Result<T, CodecError>
where
    T: TryFrom<u64> + std::str::FromStr,
{
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| T::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<T>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(field, value))
}

fn invalid(
    field: &'static str,
    value: &Value,
) -> CodecError {
    CodecError::InvalidField {
        field,
        reason: format!("unexpected value {value}"),
    }
}
