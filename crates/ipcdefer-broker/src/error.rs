use ipcdefer_rpc::{RemoteFailure, RpcError};

/// Why a deferred value could not be produced.
///
/// Cloneable: every resolver joined to one resolution receives the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No live entry with this id, or it was already resolved.
    #[error("no deferred value with id \"{0}\"")]
    UnknownIdentifier(String),

    /// The owner disconnected before producing the value.
    #[error("owner of deferred value \"{0}\" is gone")]
    PeerGone(String),

    #[error("resolution timed out")]
    Timeout,

    #[error("resolution canceled")]
    Canceled,

    /// The other side failed without saying why in a way we understand.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("deferred value \"{0}\" is already registered")]
    AlreadyRegistered(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The owner's resolver reported an error.
    #[error("resolver failed: {0}")]
    Failed(String),

    /// Not connected to a broker.
    #[error("not connected to broker")]
    Disconnected,
}

impl ResolveError {
    /// Machine-readable code sent alongside error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownIdentifier(_) => "unknown-identifier",
            Self::PeerGone(_) => "peer-gone",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Remote(_) => "remote",
            Self::AlreadyRegistered(_) => "already-registered",
            Self::InvalidPayload(_) => "invalid-payload",
            Self::Failed(_) => "failed",
            Self::Disconnected => "disconnected",
        }
    }

    /// Rebuild a typed error from an error response.
    pub fn from_remote(message: String, code: Option<&str>, id: &str) -> Self {
        match code {
            Some("unknown-identifier") => Self::UnknownIdentifier(id.to_string()),
            Some("peer-gone") => Self::PeerGone(id.to_string()),
            Some("timeout") => Self::Timeout,
            Some("canceled") => Self::Canceled,
            Some("invalid-payload") => Self::InvalidPayload(message),
            Some("failed") => Self::Failed(message),
            _ => Self::Remote(message),
        }
    }

    /// Map a failed call for `id`. A closed channel means we lost the broker.
    pub fn from_rpc(err: RpcError, id: &str) -> Self {
        match err {
            RpcError::Timeout(_) => Self::Timeout,
            RpcError::Canceled => Self::Canceled,
            RpcError::ChannelClosed => Self::Disconnected,
            RpcError::Remote { message, code } => Self::from_remote(message, code.as_deref(), id),
        }
    }

    /// Text carried in the `error` field: the inner detail for errors whose
    /// code already says what kind they are.
    fn wire_message(&self) -> String {
        match self {
            Self::Remote(detail) | Self::InvalidPayload(detail) | Self::Failed(detail) => {
                detail.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<ResolveError> for RemoteFailure {
    fn from(err: ResolveError) -> Self {
        RemoteFailure::new(err.wire_message()).with_code(err.code())
    }
}

/// Errors from running a broker or connecting to one.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("transport error: {0}")]
    Transport(#[from] ipcdefer_transport::TransportError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
