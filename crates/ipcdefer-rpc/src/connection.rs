use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelId, ChannelReceiver, ChannelSender, CloseReason};
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::mux::Multiplexer;
use crate::wire::{Signal, WireMessage};

/// Hooks for the messages a [`Connection`] does not handle itself.
///
/// All methods run on the connection task and must not block.
pub trait ConnectionEvents: Send + Sync {
    /// The peer announced a deferred value it owns.
    fn on_register(&self, channel: ChannelId, id: String) {
        let _ = (channel, id);
    }

    /// The broker announced how many peers are connected.
    fn on_connection_count(&self, count: usize) {
        let _ = count;
    }

    /// The channel closed. Runs before outstanding calls are failed.
    fn on_close(&self, channel: ChannelId, reason: CloseReason) {
        let _ = (channel, reason);
    }
}

impl ConnectionEvents for () {}

/// Drives one channel until it closes.
pub struct Connection {
    sender: ChannelSender,
    receiver: ChannelReceiver,
    mux: Multiplexer,
    liveness: Option<LivenessConfig>,
}

impl Connection {
    pub fn new(channel: Channel) -> Self {
        let (sender, receiver) = channel.into_split();
        Self {
            mux: Multiplexer::new(sender.clone()),
            sender,
            receiver,
            liveness: None,
        }
    }

    /// Initiate pings on this channel.
    pub fn with_liveness(mut self, config: Option<LivenessConfig>) -> Self {
        self.liveness = config;
        self
    }

    pub fn id(&self) -> ChannelId {
        self.sender.id()
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Dispatch messages until the channel closes, then fire
    /// [`ConnectionEvents::on_close`] and fail everything still outstanding.
    pub async fn run<E>(self, events: &E) -> CloseReason
    where
        E: ConnectionEvents + ?Sized,
    {
        let Self {
            sender,
            mut receiver,
            mux,
            liveness,
        } = self;
        let channel = sender.id();

        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        let monitor = liveness
            .map(|config| tokio::spawn(LivenessMonitor::new(config, sender.clone(), pong_rx).run()));

        while let Some(message) = receiver.recv().await {
            match message {
                WireMessage::Signal(Signal::Ping) => {
                    let _ = sender.send(Signal::Pong);
                }
                WireMessage::Signal(Signal::Pong) => {
                    let _ = pong_tx.send(());
                }
                WireMessage::Signal(Signal::Close) => {
                    debug!(%channel, "peer said close");
                    sender.close_with(CloseReason::PeerDisconnected);
                }
                WireMessage::Request {
                    request,
                    request_id,
                    data,
                } => mux.handle_request(request, request_id, data),
                WireMessage::Response {
                    response,
                    data,
                    error,
                    code,
                } => mux.handle_response(response, data, error, code),
                WireMessage::Cancel { request_id } => mux.handle_cancel(request_id),
                WireMessage::Register { id } => events.on_register(channel, id),
                WireMessage::ConnectionCount { connection_count } => {
                    events.on_connection_count(connection_count)
                }
                WireMessage::Unrecognized(value) => {
                    warn!(%channel, message = %value, "ignoring unexpected message");
                }
            }
        }

        sender.close_with(CloseReason::PeerDisconnected);
        let reason = sender.close_reason().unwrap_or(CloseReason::PeerDisconnected);
        debug!(%channel, %reason, "connection finished");

        events.on_close(channel, reason);
        mux.fail_all();
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        reason
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.id())
            .field("liveness", &self.liveness)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::*;
    use crate::error::RpcError;

    #[derive(Default)]
    struct Recorder {
        registered: Mutex<Vec<String>>,
        counts: Mutex<Vec<usize>>,
        closed: Mutex<Vec<CloseReason>>,
    }

    impl ConnectionEvents for Recorder {
        fn on_register(&self, _channel: ChannelId, id: String) {
            self.registered.lock().unwrap().push(id);
        }

        fn on_connection_count(&self, count: usize) {
            self.counts.lock().unwrap().push(count);
        }

        fn on_close(&self, _channel: ChannelId, reason: CloseReason) {
            self.closed.lock().unwrap().push(reason);
        }
    }

    #[tokio::test]
    async fn answers_pings_and_routes_hooks() {
        let (local, remote) = Channel::pair();
        let (peer_tx, mut peer_rx) = remote.into_split();
        let recorder = std::sync::Arc::new(Recorder::default());

        let task = tokio::spawn({
            let recorder = recorder.clone();
            async move { Connection::new(local).run(&*recorder).await }
        });

        peer_tx.send(Signal::Ping).unwrap();
        assert_eq!(peer_rx.recv().await, Some(WireMessage::Signal(Signal::Pong)));

        peer_tx.send(WireMessage::register("k1")).unwrap();
        peer_tx.send(WireMessage::connection_count(2)).unwrap();
        peer_tx
            .send(WireMessage::Unrecognized(json!({"what": "ever"})))
            .unwrap();
        peer_tx.send(Signal::Close).unwrap();

        assert_eq!(task.await.unwrap(), CloseReason::PeerDisconnected);
        assert_eq!(*recorder.registered.lock().unwrap(), vec!["k1".to_string()]);
        assert_eq!(*recorder.counts.lock().unwrap(), vec![2]);
        assert_eq!(
            *recorder.closed.lock().unwrap(),
            vec![CloseReason::PeerDisconnected]
        );
    }

    #[tokio::test]
    async fn two_connections_call_each_other() {
        let (a, b) = Channel::pair();
        let a = Connection::new(a);
        let b = Connection::new(b);
        b.multiplexer().serve("greet", |data: Value| async move {
            Ok::<_, String>(json!(format!("hello {}", data.as_str().unwrap_or("?"))))
        });

        let a_mux = a.multiplexer().clone();
        let a_sender = a.sender().clone();
        tokio::spawn(async move { a.run(&()).await });
        tokio::spawn(async move { b.run(&()).await });

        let reply = a_mux.call("greet", json!("world"), None).await.unwrap();
        assert_eq!(reply, json!("hello world"));

        a_sender.close();
    }

    #[tokio::test]
    async fn close_fails_outstanding_calls() {
        let (a, b) = Channel::pair();
        let a = Connection::new(a);
        let a_mux = a.multiplexer().clone();
        tokio::spawn(async move { a.run(&()).await });

        let call = a_mux.call("never", Value::Null, None);
        b.sender.close();
        assert!(matches!(call.await, Err(RpcError::ChannelClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_peer_closes_with_liveness() {
        let (local, remote) = Channel::pair();
        let (_peer_tx, mut peer_rx) = remote.into_split();
        let recorder = std::sync::Arc::new(Recorder::default());

        let config = LivenessConfig {
            ping_interval: Duration::from_millis(10),
            dead_after: Duration::from_millis(50),
        };
        let task = tokio::spawn({
            let recorder = recorder.clone();
            async move {
                Connection::new(local)
                    .with_liveness(Some(config))
                    .run(&*recorder)
                    .await
            }
        });

        assert_eq!(peer_rx.recv().await, Some(WireMessage::Signal(Signal::Ping)));
        assert_eq!(task.await.unwrap(), CloseReason::Unresponsive);
        assert_eq!(
            *recorder.closed.lock().unwrap(),
            vec![CloseReason::Unresponsive]
        );
    }
}
