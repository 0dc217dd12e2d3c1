use std::path::PathBuf;

/// Socket-level failures. The CLI maps the wrapped `io::Error` kinds onto
/// exit codes, so the source is always kept.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot listen on {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot reach {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(std::io::Error),

    /// Reading or writing an established stream failed.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `sockaddr_un` cannot hold the path.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

pub type Result<T> = std::result::Result<T, TransportError>;
