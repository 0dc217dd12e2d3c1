use std::fmt;
use std::io;

use ipcdefer_broker::{BrokerError, ResolveError};
use ipcdefer_rpc::RpcError;
use ipcdefer_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const UNKNOWN_IDENTIFIER: i32 = 40;
pub const PEER_GONE: i32 = 41;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    match err {
        RpcError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn resolve_error(context: &str, err: ResolveError) -> CliError {
    let code = match err {
        ResolveError::UnknownIdentifier(_) => UNKNOWN_IDENTIFIER,
        ResolveError::PeerGone(_) => PEER_GONE,
        ResolveError::Timeout => TIMEOUT,
        ResolveError::InvalidPayload(_) => DATA_INVALID,
        ResolveError::AlreadyRegistered(_) => USAGE,
        _ => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn broker_error(context: &str, err: BrokerError) -> CliError {
    match err {
        BrokerError::Transport(err) => transport_error(context, err),
        BrokerError::Rpc(err) => rpc_error(context, err),
        BrokerError::Resolve(err) => resolve_error(context, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_errors_map_to_distinct_codes() {
        assert_eq!(
            resolve_error("x", ResolveError::UnknownIdentifier("k".into())).code,
            UNKNOWN_IDENTIFIER
        );
        assert_eq!(resolve_error("x", ResolveError::PeerGone("k".into())).code, PEER_GONE);
        assert_eq!(resolve_error("x", ResolveError::Timeout).code, TIMEOUT);
        assert_eq!(resolve_error("x", ResolveError::Disconnected).code, FAILURE);
    }

    #[test]
    fn rpc_timeouts_keep_their_exit_code() {
        let err = rpc_error(
            "resolve failed",
            RpcError::Timeout(std::time::Duration::from_millis(50)),
        );
        assert_eq!(err.code, TIMEOUT);
        assert_eq!(rpc_error("resolve failed", RpcError::ChannelClosed).code, FAILURE);
        assert_eq!(
            broker_error("resolve failed", BrokerError::Rpc(RpcError::Canceled)).code,
            FAILURE
        );
    }

    #[test]
    fn missing_socket_is_a_plain_failure() {
        let err = transport_error(
            "connect failed",
            TransportError::Connect {
                path: "/tmp/none.sock".into(),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
        );
        assert_eq!(err.code, FAILURE);
        assert!(err.message.starts_with("connect failed: "));
    }
}
