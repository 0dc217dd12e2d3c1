use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use futures_util::{SinkExt, StreamExt};
use ipcdefer_frame::{FrameCodec, FrameConfig, FrameError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, RpcError};
use crate::wire::WireMessage;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel handle, assigned in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan-{}", self.0)
    }
}

/// Why a channel closed. The first reason recorded wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// This side closed it.
    Local,
    /// The peer sent `"close"`, hung up, or its stream failed.
    PeerDisconnected,
    /// The peer stopped answering pings.
    Unresponsive,
    /// The peer sent bytes that are not a message.
    MalformedMessage,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::PeerDisconnected => "peer-disconnected",
            Self::Unresponsive => "unresponsive",
            Self::MalformedMessage => "malformed-message",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What travels through a channel's queues: a message, or the news that the
/// far side is gone (queued behind everything it sent first).
enum Envelope {
    Message(WireMessage),
    Closed(CloseReason),
}

struct ChannelState {
    id: ChannelId,
    closed: CancellationToken,
    finished: CancellationToken,
    reason: OnceLock<CloseReason>,
    last_activity: Mutex<Instant>,
    /// In-memory pairs: the other end's inbox, told when we close.
    remote_inbox: Option<mpsc::UnboundedSender<Envelope>>,
    /// Stream-backed channels finish once their writer has flushed.
    has_writer: bool,
}

impl ChannelState {
    fn new(remote_inbox: Option<mpsc::UnboundedSender<Envelope>>, has_writer: bool) -> Self {
        Self {
            id: ChannelId::next(),
            closed: CancellationToken::new(),
            finished: CancellationToken::new(),
            reason: OnceLock::new(),
            last_activity: Mutex::new(Instant::now()),
            remote_inbox,
            has_writer,
        }
    }

    fn close_with(&self, reason: CloseReason) {
        if self.reason.set(reason).is_err() {
            return;
        }
        debug!(channel = %self.id, %reason, "channel closed");
        self.closed.cancel();
        if let Some(inbox) = &self.remote_inbox {
            let _ = inbox.send(Envelope::Closed(CloseReason::PeerDisconnected));
        }
        if !self.has_writer {
            self.finished.cancel();
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// An ordered, bidirectional message channel to one peer.
pub struct Channel {
    pub sender: ChannelSender,
    pub receiver: ChannelReceiver,
}

impl Channel {
    /// Two linked in-memory channel ends. Closing one end is seen by the
    /// other as [`CloseReason::PeerDisconnected`], after any messages that
    /// were already sent.
    pub fn pair() -> (Self, Self) {
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let (right_tx, right_rx) = mpsc::unbounded_channel();

        let left_state = Arc::new(ChannelState::new(Some(right_tx.clone()), false));
        let right_state = Arc::new(ChannelState::new(Some(left_tx.clone()), false));

        let left = Self {
            sender: ChannelSender {
                state: left_state.clone(),
                outbox: right_tx,
            },
            receiver: ChannelReceiver {
                state: left_state,
                inbox: left_rx,
            },
        };
        let right = Self {
            sender: ChannelSender {
                state: right_state.clone(),
                outbox: left_tx,
            },
            receiver: ChannelReceiver {
                state: right_state,
                inbox: right_rx,
            },
        };
        (left, right)
    }

    /// Run a channel over a byte stream with the default frame limits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<S>(io: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::spawn_with_config(io, &FrameConfig::default())
    }

    /// Run a channel over a byte stream, spawning one reader and one writer
    /// task. Both stop when the channel closes; the writer flushes anything
    /// already queued before shutting the stream down.
    pub fn spawn_with_config<S>(io: S, config: &FrameConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let state = Arc::new(ChannelState::new(None, true));
        let (outbox, outgoing) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        let (sink, stream) = Framed::new(io, FrameCodec::new(config)).split();
        tokio::spawn(write_frames(state.clone(), sink, outgoing));
        tokio::spawn(read_frames(state.clone(), stream, inbox_tx));

        Self {
            sender: ChannelSender {
                state: state.clone(),
                outbox,
            },
            receiver: ChannelReceiver { state, inbox },
        }
    }

    pub fn id(&self) -> ChannelId {
        self.sender.id()
    }

    pub fn into_split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

async fn write_frames<S>(
    state: Arc<ChannelState>,
    mut sink: futures_util::stream::SplitSink<Framed<S, FrameCodec>, ipcdefer_frame::Frame>,
    mut outgoing: mpsc::UnboundedReceiver<Envelope>,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let envelope = tokio::select! {
            biased;
            envelope = outgoing.recv() => envelope,
            _ = state.closed.cancelled() => None,
        };
        let Some(envelope) = envelope else { break };
        if !write_one(&state, &mut sink, envelope).await {
            break;
        }
    }

    // Whatever was queued before the close still goes out.
    while let Ok(envelope) = outgoing.try_recv() {
        if !write_one(&state, &mut sink, envelope).await {
            break;
        }
    }

    if let Err(err) = sink.close().await {
        trace!(channel = %state.id, error = %err, "stream shutdown failed");
    }
    state.finished.cancel();
}

async fn write_one<S>(
    state: &ChannelState,
    sink: &mut futures_util::stream::SplitSink<Framed<S, FrameCodec>, ipcdefer_frame::Frame>,
    envelope: Envelope,
) -> bool
where
    S: AsyncRead + AsyncWrite,
{
    let Envelope::Message(message) = envelope else {
        return true;
    };
    let frame = match message.to_frame() {
        Ok(frame) => frame,
        Err(err) => {
            warn!(channel = %state.id, kind = message.kind(), error = %err, "dropping unencodable message");
            return true;
        }
    };
    match sink.send(frame).await {
        Ok(()) => true,
        Err(err) => {
            debug!(channel = %state.id, error = %err, "write failed");
            state.close_with(CloseReason::PeerDisconnected);
            false
        }
    }
}

async fn read_frames<S>(
    state: Arc<ChannelState>,
    mut stream: futures_util::stream::SplitStream<Framed<S, FrameCodec>>,
    inbox: mpsc::UnboundedSender<Envelope>,
) where
    S: AsyncRead + AsyncWrite,
{
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = state.closed.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(frame)) => match WireMessage::from_frame(&frame) {
                Ok(message) => {
                    trace!(channel = %state.id, kind = message.kind(), "received");
                    if inbox.send(Envelope::Message(message)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(channel = %state.id, lane = frame.lane, error = %err, "payload is not a message");
                    break CloseReason::MalformedMessage;
                }
            },
            Some(Err(err @ (FrameError::InvalidMagic | FrameError::PayloadTooLarge { .. }))) => {
                warn!(channel = %state.id, error = %err, "malformed frame");
                break CloseReason::MalformedMessage;
            }
            Some(Err(err)) => {
                debug!(channel = %state.id, error = %err, "read failed");
                break CloseReason::PeerDisconnected;
            }
            None => break CloseReason::PeerDisconnected,
        }
    };
    let _ = inbox.send(Envelope::Closed(reason));
}

/// Sending half of a channel. Cheap to clone.
#[derive(Clone)]
pub struct ChannelSender {
    state: Arc<ChannelState>,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl ChannelSender {
    pub fn id(&self) -> ChannelId {
        self.state.id
    }

    /// Queue a message. Fails with [`RpcError::ChannelClosed`] once closed.
    pub fn send(&self, message: impl Into<WireMessage>) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        let message = message.into();
        if !message.is_signal() {
            self.state.touch();
        }
        trace!(channel = %self.state.id, kind = message.kind(), "send");
        self.outbox
            .send(Envelope::Message(message))
            .map_err(|_| RpcError::ChannelClosed)
    }

    /// Close with [`CloseReason::Local`]. Idempotent.
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    /// Close with an explicit reason. Only the first close is recorded.
    pub fn close_with(&self, reason: CloseReason) {
        self.state.close_with(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.reason.get().copied()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.state.closed.cancelled().await;
    }

    /// Close, then wait until queued messages have been flushed.
    pub async fn shutdown(&self) {
        self.close();
        self.state.finished.cancelled().await;
    }

    /// When a non-signal message was last queued (channel creation if never).
    pub fn last_activity(&self) -> Instant {
        *self
            .state
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("id", &self.state.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving half of a channel.
pub struct ChannelReceiver {
    state: Arc<ChannelState>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelReceiver {
    pub fn id(&self) -> ChannelId {
        self.state.id
    }

    /// Next message in send order, or `None` once the channel is closed.
    ///
    /// Learning that the peer went away closes this end too.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        let envelope = tokio::select! {
            biased;
            _ = self.state.closed.cancelled() => return None,
            envelope = self.inbox.recv() => envelope,
        };
        match envelope {
            Some(Envelope::Message(message)) => Some(message),
            Some(Envelope::Closed(reason)) => {
                self.state.close_with(reason);
                None
            }
            None => {
                self.state.close_with(CloseReason::PeerDisconnected);
                None
            }
        }
    }
}

impl fmt::Debug for ChannelReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("id", &self.state.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ipcdefer_transport::IpcStream;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::wire::Signal;

    #[tokio::test]
    async fn pair_delivers_in_send_order() {
        let (left, mut right) = Channel::pair();
        for n in 0..5 {
            left.sender.send(WireMessage::connection_count(n)).unwrap();
        }
        for n in 0..5 {
            assert_eq!(
                right.receiver.recv().await,
                Some(WireMessage::connection_count(n))
            );
        }
        assert_ne!(left.id(), right.id());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_first_reason_wins() {
        let (left, _right) = Channel::pair();
        left.sender.close_with(CloseReason::Unresponsive);
        left.sender.close();
        left.sender.close_with(CloseReason::MalformedMessage);

        assert!(left.sender.is_closed());
        assert_eq!(left.sender.close_reason(), Some(CloseReason::Unresponsive));
        assert!(matches!(
            left.sender.send(Signal::Ping),
            Err(RpcError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn peer_sees_messages_then_disconnect() {
        let (left, mut right) = Channel::pair();
        left.sender.send(WireMessage::register("k1")).unwrap();
        left.sender.close();

        assert_eq!(right.receiver.recv().await, Some(WireMessage::register("k1")));
        assert_eq!(right.receiver.recv().await, None);
        assert_eq!(
            right.sender.close_reason(),
            Some(CloseReason::PeerDisconnected)
        );
    }

    #[tokio::test]
    async fn closed_end_stops_receiving() {
        let (left, mut right) = Channel::pair();
        left.sender.send(WireMessage::register("k1")).unwrap();
        right.sender.close();
        assert_eq!(right.receiver.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn signals_do_not_count_as_activity() {
        let (left, _right) = Channel::pair();
        let created = left.sender.last_activity();

        tokio::time::advance(std::time::Duration::from_millis(10)).await;
        left.sender.send(Signal::Ping).unwrap();
        assert_eq!(left.sender.last_activity(), created);

        left.sender.send(WireMessage::cancel(1)).unwrap();
        assert!(left.sender.last_activity() > created);
    }

    #[tokio::test]
    async fn stream_channels_carry_messages() {
        let (a, b) = IpcStream::pair().unwrap();
        let left = Channel::spawn(a);
        let mut right = Channel::spawn(b);

        left.sender
            .send(WireMessage::request("echo", 0, json!({"x": 1})))
            .unwrap();
        left.sender.send(Signal::Close).unwrap();

        assert_eq!(
            right.receiver.recv().await,
            Some(WireMessage::request("echo", 0, json!({"x": 1})))
        );
        assert_eq!(
            right.receiver.recv().await,
            Some(WireMessage::Signal(Signal::Close))
        );
    }

    #[tokio::test]
    async fn shutdown_flushes_before_hanging_up() {
        let (a, b) = IpcStream::pair().unwrap();
        let left = Channel::spawn(a);
        let mut right = Channel::spawn(b);

        left.sender.send(WireMessage::register("last")).unwrap();
        left.sender.shutdown().await;

        assert_eq!(
            right.receiver.recv().await,
            Some(WireMessage::register("last"))
        );
        assert_eq!(right.receiver.recv().await, None);
        assert_eq!(
            right.sender.close_reason(),
            Some(CloseReason::PeerDisconnected)
        );
    }

    #[tokio::test]
    async fn garbage_bytes_close_as_malformed() {
        let (mut raw, b) = IpcStream::pair().unwrap();
        let mut channel = Channel::spawn(b);

        let mut wire = bytes::BytesMut::new();
        ipcdefer_frame::encode_frame(ipcdefer_frame::RPC, b"{not json", &mut wire).unwrap();
        raw.write_all(&wire).await.unwrap();

        assert_eq!(channel.receiver.recv().await, None);
        assert_eq!(
            channel.sender.close_reason(),
            Some(CloseReason::MalformedMessage)
        );
    }
}
