use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ipcdefer_frame::FrameConfig;
use ipcdefer_rpc::Channel;
use ipcdefer_transport::UnixDomainSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerConfig};
use crate::error::Result;

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serves a [`Broker`] on a Unix domain socket.
pub struct BrokerListener {
    socket: UnixDomainSocket,
    broker: Arc<Broker>,
    frame_config: FrameConfig,
}

impl BrokerListener {
    /// Bind to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Path>, config: BrokerConfig) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        Ok(Self {
            socket,
            broker: Broker::new(config),
            frame_config: FrameConfig::default(),
        })
    }

    /// Override frame limits for accepted connections.
    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }

    /// Accept peers until `shutdown` fires, then close every connection and
    /// wait for them to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    match finished {
                        Ok(reason) => debug!(%reason, "connection task finished"),
                        Err(err) => warn!(error = %err, "connection task failed"),
                    }
                }
                accepted = self.socket.accept() => match accepted {
                    Ok(stream) => {
                        let creds = stream.peer_credentials();
                        let channel = Channel::spawn_with_config(stream, &self.frame_config);
                        info!(
                            channel = %channel.id(),
                            uid = creds.map(|c| c.uid),
                            pid = creds.and_then(|c| c.pid),
                            "accepted peer"
                        );
                        connections.spawn(self.broker.clone().serve_connection(channel));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!(
            path = ?self.socket.path(),
            peers = self.broker.connection_count(),
            "broker shutting down"
        );
        self.broker.close_all();
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;

    use super::*;
    use crate::client::{ClientConfig, DeferredClient};
    use crate::error::ResolveError;

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/ipcd-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("broker.sock")
    }

    #[tokio::test]
    async fn peers_share_a_value_over_sockets() {
        let sock_path = make_sock_path("share");
        let listener =
            BrokerListener::bind(&sock_path, BrokerConfig::default()).expect("listener should bind");
        let broker = listener.broker().clone();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(listener.run(shutdown.clone()));

        let owner = DeferredClient::connect(&sock_path, ClientConfig::default())
            .await
            .expect("owner should connect");
        let requester = DeferredClient::connect(&sock_path, ClientConfig::default())
            .await
            .expect("requester should connect");

        owner
            .register_deferred("k1", || async { Ok::<_, ResolveError>(Bytes::from_static(b"hello")) })
            .expect("register should succeed");
        while !broker.is_registered("k1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let value = requester.resolve("k1").await.expect("resolve should succeed");
        assert_eq!(value.as_ref(), b"hello");
        assert_eq!(
            requester.resolve("k1").await,
            Err(ResolveError::UnknownIdentifier("k1".into()))
        );

        assert_eq!(requester.wait_connection_count(|n| n == 2).await, Ok(2));

        shutdown.cancel();
        server
            .await
            .expect("server task should join")
            .expect("server should stop cleanly");
        assert!(!sock_path.exists(), "socket file should be removed");

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }

    #[tokio::test]
    async fn shutdown_closes_connected_peers() {
        let sock_path = make_sock_path("shutdown");
        let listener =
            BrokerListener::bind(&sock_path, BrokerConfig::default()).expect("listener should bind");
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(listener.run(shutdown.clone()));

        let client = DeferredClient::connect(&sock_path, ClientConfig::default())
            .await
            .expect("client should connect");
        assert_eq!(client.wait_connection_count(|n| n == 1).await, Ok(1));

        shutdown.cancel();
        server
            .await
            .expect("server task should join")
            .expect("server should stop cleanly");
        client.multiplexer().sender().closed().await;
        assert!(client.is_closed());

        if let Some(parent) = sock_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}
