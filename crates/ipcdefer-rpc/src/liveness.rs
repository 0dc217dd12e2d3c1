use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::channel::{ChannelSender, CloseReason};
use crate::wire::Signal;

/// Keepalive timing for the side that initiates pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Quiet time before a ping is sent. Default: 1s.
    pub ping_interval: Duration,
    /// How long to wait for the pong before the channel is declared dead. Default: 60s.
    pub dead_after: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            dead_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Idle,
    AwaitingPong,
}

/// How a monitor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessOutcome {
    /// The channel closed for some other reason.
    Closed,
    /// No pong arrived in time; the monitor closed the channel as unresponsive.
    Dead,
}

/// Ping/pong state machine for one channel.
///
/// The connection loop forwards each received pong into `pongs`. Pongs that
/// arrive while no ping is outstanding are discarded.
pub struct LivenessMonitor {
    config: LivenessConfig,
    sender: ChannelSender,
    pongs: mpsc::UnboundedReceiver<()>,
}

impl LivenessMonitor {
    pub fn new(
        config: LivenessConfig,
        sender: ChannelSender,
        pongs: mpsc::UnboundedReceiver<()>,
    ) -> Self {
        Self {
            config,
            sender,
            pongs,
        }
    }

    pub async fn run(mut self) -> LivenessOutcome {
        let channel = self.sender.id();
        let mut state = LivenessState::Idle;
        let mut idle_since = Instant::now();

        loop {
            match state {
                LivenessState::Idle => {
                    let due = idle_since.max(self.sender.last_activity()) + self.config.ping_interval;
                    tokio::select! {
                        biased;
                        _ = self.sender.closed() => return LivenessOutcome::Closed,
                        pong = self.pongs.recv() => {
                            if pong.is_none() {
                                return LivenessOutcome::Closed;
                            }
                            trace!(%channel, "discarding unsolicited pong");
                        }
                        _ = tokio::time::sleep_until(due) => {
                            let due = idle_since.max(self.sender.last_activity()) + self.config.ping_interval;
                            if due > Instant::now() {
                                continue;
                            }
                            if self.sender.send(Signal::Ping).is_err() {
                                return LivenessOutcome::Closed;
                            }
                            trace!(%channel, "ping");
                            state = LivenessState::AwaitingPong;
                        }
                    }
                }
                LivenessState::AwaitingPong => {
                    let deadline = tokio::time::sleep(self.config.dead_after);
                    tokio::select! {
                        biased;
                        _ = self.sender.closed() => return LivenessOutcome::Closed,
                        pong = self.pongs.recv() => {
                            if pong.is_none() {
                                return LivenessOutcome::Closed;
                            }
                            trace!(%channel, "pong");
                            state = LivenessState::Idle;
                            idle_since = Instant::now();
                        }
                        _ = deadline => {
                            warn!(
                                %channel,
                                dead_after_ms = self.config.dead_after.as_millis() as u64,
                                "no ping response; closing connection"
                            );
                            self.sender.close_with(CloseReason::Unresponsive);
                            return LivenessOutcome::Dead;
                        }
                    }
                }
            }
        }
    }
}
