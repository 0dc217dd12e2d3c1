use std::collections::BTreeMap;

use ipcdefer_rpc::{ChannelId, Multiplexer, WireMessage};
use tracing::{debug, info};

/// The broker's connected peers, keyed by channel.
///
/// Every membership change tells all members the new peer count.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<ChannelId, Multiplexer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer and broadcast the new count, the newcomer included.
    pub fn connect(&mut self, peer: Multiplexer) -> usize {
        let channel = peer.channel_id();
        self.peers.insert(channel, peer);
        let count = self.peers.len();
        info!(%channel, count, "peer connected");
        self.broadcast(&WireMessage::connection_count(count));
        count
    }

    /// Remove a peer and broadcast the new count. Returns the remaining count,
    /// or `None` if the peer was already gone.
    pub fn evict(&mut self, channel: ChannelId) -> Option<usize> {
        self.peers.remove(&channel)?;
        let count = self.peers.len();
        info!(%channel, count, "peer evicted");
        self.broadcast(&WireMessage::connection_count(count));
        Some(count)
    }

    /// Send `message` to every member. A member that cannot be reached is
    /// skipped. Returns how many sends succeeded.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let mut delivered = 0;
        for (channel, peer) in &self.peers {
            match peer.sender().send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(%channel, error = %err, kind = message.kind(), "broadcast skipped peer"),
            }
        }
        delivered
    }

    pub fn get(&self, channel: ChannelId) -> Option<Multiplexer> {
        self.peers.get(&channel).cloned()
    }

    pub fn contains(&self, channel: ChannelId) -> bool {
        self.peers.contains_key(&channel)
    }

    pub fn members(&self) -> Vec<Multiplexer> {
        self.peers.values().cloned().collect()
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.peers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ipcdefer_rpc::{Channel, ChannelReceiver};

    use super::*;

    fn member() -> (Multiplexer, ChannelReceiver) {
        let (local, remote) = Channel::pair();
        let (_remote_tx, remote_rx) = remote.into_split();
        (Multiplexer::new(local.sender), remote_rx)
    }

    #[tokio::test]
    async fn connect_broadcasts_to_everyone() {
        let mut registry = PeerRegistry::new();
        let (a, mut a_rx) = member();
        let (b, mut b_rx) = member();

        assert_eq!(registry.connect(a), 1);
        assert_eq!(a_rx.recv().await, Some(WireMessage::connection_count(1)));

        assert_eq!(registry.connect(b), 2);
        assert_eq!(a_rx.recv().await, Some(WireMessage::connection_count(2)));
        assert_eq!(b_rx.recv().await, Some(WireMessage::connection_count(2)));
    }

    #[tokio::test]
    async fn evict_is_idempotent() {
        let mut registry = PeerRegistry::new();
        let (a, mut a_rx) = member();
        let (b, _b_rx) = member();
        let b_id = b.channel_id();
        registry.connect(a);
        registry.connect(b);

        assert_eq!(registry.evict(b_id), Some(1));
        assert_eq!(registry.evict(b_id), None);
        assert!(!registry.contains(b_id));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(a_rx.recv().await);
        }
        assert_eq!(
            seen,
            vec![
                Some(WireMessage::connection_count(1)),
                Some(WireMessage::connection_count(2)),
                Some(WireMessage::connection_count(1)),
            ]
        );
    }

    #[tokio::test]
    async fn broadcast_skips_closed_members() {
        let mut registry = PeerRegistry::new();
        let (a, _a_rx) = member();
        let (b, mut b_rx) = member();
        a.sender().close();
        registry.connect(a);
        registry.connect(b);

        assert_eq!(registry.broadcast(&WireMessage::register("x")), 1);
        assert_eq!(b_rx.recv().await, Some(WireMessage::connection_count(2)));
        assert_eq!(b_rx.recv().await, Some(WireMessage::register("x")));
        assert_eq!(registry.len(), 2);
    }
}
