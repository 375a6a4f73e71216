//! Discovery Daemon Error Hierarchy
//!
//! Errors are grouped by the collaborator that produced them: the remote
//! coordination store, the local cache storage, and the service codec.
//! Background loops classify errors with [`Error::is_unavailable`] and never
//! propagate them further than a log line.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Remote coordination store failures (transport and status)
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local cache storage failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Service key/value encoding failures
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registry listener could not be bound or stopped serving
    #[error("Registry server failed: {0}")]
    Server(String),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Transient remote unavailability: the caller should wait for the
    /// channel to become ready again instead of giving up.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Remote(RemoteError::Unavailable(_)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Transport down or endpoint unreachable
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    /// Any other gRPC status returned by the remote store
    #[error(transparent)]
    Status(Box<tonic::Status>),

    /// Channel construction failures
    #[error(transparent)]
    Transport(#[from] Box<tonic::transport::Error>),

    /// Malformed remote store endpoint
    #[error("Invalid URI format: {0}")]
    InvalidEndpoint(String),

    /// A bidirectional stream was closed by the peer
    #[error("{0} stream closed by remote store")]
    StreamClosed(&'static str),

    /// Watch canceled by the remote store (e.g. compacted revision)
    #[error("Watch canceled (compact_revision: {compact_revision}): {reason}")]
    WatchCanceled {
        reason: String,
        compact_revision: i64,
    },
}

impl From<tonic::Status> for RemoteError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable => RemoteError::Unavailable(status.message().to_string()),
            _ => RemoteError::Status(Box::new(status)),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Remote(status.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Embedded database errors
    #[error(transparent)]
    Db(#[from] sled::Error),

    /// Serialization failures for persisted rows
    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    /// Transaction aborted or conflicted
    #[error("Transaction failed: {0}")]
    Transaction(String),
}

impl From<sled::transaction::TransactionError<StorageError>> for StorageError {
    fn from(e: sled::transaction::TransactionError<StorageError>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => StorageError::Db(e),
        }
    }
}

impl From<sled::transaction::TransactionError<StorageError>> for Error {
    fn from(e: sled::transaction::TransactionError<StorageError>) -> Self {
        Error::Storage(e.into())
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Storage(StorageError::Db(e))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(StorageError::Bincode(e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Key outside the namespace or with the wrong segment count
    #[error("Malformed service key: {0}")]
    MalformedKey(String),

    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// Metadata key collides with hostname/port/ttl
    #[error("Metadata key `{0}` is reserved")]
    ReservedMetadataKey(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(CodecError::Json(e))
    }
}
