//! Deferred values shared between local processes.
//!
//! A producer publishes an opaque id for a value it can compute on demand;
//! any peer connected to the same broker can resolve the id later, and the
//! owner is asked for the bytes exactly once.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix domain socket transport
//! - [`frame`]: Length-prefixed framing with lane ids
//! - [`rpc`]: Request/response multiplexing, liveness, per-channel connection loop
//! - [`broker`]: Broker, peer registry, deferred registry and the peer-side client

/// Re-export transport types.
pub mod transport {
    pub use ipcdefer_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use ipcdefer_frame::*;
}

/// Re-export RPC types.
pub mod rpc {
    pub use ipcdefer_rpc::*;
}

/// Re-export broker types.
pub mod broker {
    pub use ipcdefer_broker::*;
}

pub use ipcdefer_broker::{
    generate_id, Broker, BrokerConfig, BrokerListener, ClientConfig, DeferredClient, ResolveError,
};
