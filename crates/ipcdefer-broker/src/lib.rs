//! Broker and peer side of deferred-value sharing.
//!
//! A producer registers an opaque id for a value it can compute on demand.
//! Any peer connected to the same [`Broker`] can later resolve that id: the
//! broker forwards the request to the owner, shares one round-trip between
//! concurrent resolvers, and fails every resolver with
//! [`ResolveError::PeerGone`] once the owner disconnects.
//!
//! Peers use [`DeferredClient`]; [`BrokerListener`] serves a broker on a Unix
//! domain socket.

pub mod broker;
pub mod client;
pub mod deferred;
pub mod error;
pub mod listener;
pub mod peers;

pub use broker::{Broker, BrokerConfig};
pub use client::{ClientConfig, DeferredClient};
pub use deferred::{
    decode_payload, encode_payload, generate_id, DeferredRegistry, DeferredStore, Joined,
    Owner, Resolution, ResolveResult, Resolver, DEFAULT_MAX_TOMBSTONES, RESOLVE_METHOD,
};
pub use error::{BrokerError, ResolveError, Result};
pub use listener::BrokerListener;
pub use peers::PeerRegistry;
