//! Request/response multiplexing over ordered two-party channels.
//!
//! A [`Channel`] carries [`WireMessage`]s in send order, either over a framed
//! byte stream ([`Channel::spawn`]) or in memory ([`Channel::pair`]). A
//! [`Connection`] drives one channel: it answers heartbeats, feeds the
//! [`Multiplexer`] with requests, responses and cancellations, and hands
//! registrations and peer-count broadcasts to a [`ConnectionEvents`] sink.
//! The initiating side can attach a [`LivenessMonitor`] that closes channels
//! whose peer stops answering pings.

pub mod channel;
pub mod connection;
pub mod error;
pub mod liveness;
pub mod mux;
pub mod wire;

pub use channel::{Channel, ChannelId, ChannelReceiver, ChannelSender, CloseReason};
pub use connection::{Connection, ConnectionEvents};
pub use error::{Result, RpcError};
pub use liveness::{LivenessConfig, LivenessMonitor, LivenessOutcome, LivenessState};
pub use mux::{CallHandle, Multiplexer, PendingCall, RemoteFailure};
pub use wire::{RequestId, Signal, WireMessage};
