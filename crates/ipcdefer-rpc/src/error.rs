use std::time::Duration;

/// Errors surfaced by channels and the request multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The caller (or a drop of the pending call) canceled the request.
    #[error("request canceled")]
    Canceled,

    /// No response arrived within the call's timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered with an error response.
    #[error("remote error: {message}")]
    Remote {
        message: String,
        code: Option<String>,
    },

    /// The channel closed before the request settled, or was already closed.
    #[error("channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, RpcError>;
