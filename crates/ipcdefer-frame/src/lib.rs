//! Length-prefixed message framing for ipcdefer.
//!
//! Every message on a byte stream is framed with:
//! - A 2-byte magic number ("DV") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian lane id (control traffic vs. RPC traffic)
//!
//! [`FrameCodec`] plugs the format into `tokio_util::codec::Framed`.

pub mod codec;
pub mod error;
pub mod framed;
pub mod lane;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use framed::FrameCodec;
pub use lane::{lane_name, CONTROL, RPC, USER_LANE_START};
