//! Local IPC transport for ipcdefer.
//!
//! Provides the byte-stream layer everything else builds on:
//! - Unix domain sockets (Linux/macOS) driven by tokio
//!
//! The [`IpcStream`] returned here is an `AsyncRead + AsyncWrite` handle; the
//! frame layer turns it into a sequence of discrete messages.

pub mod error;
pub mod stream;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use stream::{IpcStream, PeerCredentials};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
