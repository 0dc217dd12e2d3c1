use ipcdefer_frame::{Frame, CONTROL, RPC};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-channel request id, assigned by the caller and never reused.
pub type RequestId = u64;

/// Bare-string control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Ping,
    Pong,
    Close,
}

/// Every message shape a channel carries, one JSON value per frame.
///
/// Shapes are told apart by their keys. Anything that matches none of them
/// decodes as [`WireMessage::Unrecognized`] and is ignored by the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Signal(Signal),
    Request {
        request: String,
        #[serde(rename = "requestId")]
        request_id: RequestId,
        #[serde(default)]
        data: Value,
    },
    Response {
        response: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Cancel {
        #[serde(rename = "cancelRequest")]
        request_id: RequestId,
    },
    Register {
        #[serde(rename = "register-data-promise")]
        id: String,
    },
    ConnectionCount {
        #[serde(rename = "connectionCount")]
        connection_count: usize,
    },
    Unrecognized(Value),
}

impl WireMessage {
    pub fn request(method: impl Into<String>, request_id: RequestId, data: Value) -> Self {
        Self::Request {
            request: method.into(),
            request_id,
            data,
        }
    }

    pub fn success(request_id: RequestId, data: Value) -> Self {
        Self::Response {
            response: request_id,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn failure(request_id: RequestId, error: impl Into<String>, code: Option<String>) -> Self {
        Self::Response {
            response: request_id,
            data: None,
            error: Some(error.into()),
            code,
        }
    }

    pub fn cancel(request_id: RequestId) -> Self {
        Self::Cancel { request_id }
    }

    pub fn register(id: impl Into<String>) -> Self {
        Self::Register { id: id.into() }
    }

    pub fn connection_count(connection_count: usize) -> Self {
        Self::ConnectionCount { connection_count }
    }

    /// Signals travel on the CONTROL lane, everything else on RPC.
    pub fn lane(&self) -> u16 {
        match self {
            Self::Signal(_) => CONTROL,
            _ => RPC,
        }
    }

    /// True for ping, pong and close; these do not count as channel activity.
    pub fn is_signal(&self) -> bool {
        matches!(self, Self::Signal(_))
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Signal(Signal::Ping) => "ping",
            Self::Signal(Signal::Pong) => "pong",
            Self::Signal(Signal::Close) => "close",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Cancel { .. } => "cancel",
            Self::Register { .. } => "register",
            Self::ConnectionCount { .. } => "connection-count",
            Self::Unrecognized(_) => "unrecognized",
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<Frame> {
        Ok(Frame::new(self.lane(), serde_json::to_vec(self)?))
    }

    /// Decode a frame payload. Bytes that are not JSON are an error; JSON of
    /// an unknown shape is not.
    pub fn from_frame(frame: &Frame) -> serde_json::Result<Self> {
        serde_json::from_slice(&frame.payload)
    }
}

impl From<Signal> for WireMessage {
    fn from(signal: Signal) -> Self {
        Self::Signal(signal)
    }
}
