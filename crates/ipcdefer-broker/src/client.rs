use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use ipcdefer_frame::FrameConfig;
use ipcdefer_rpc::{
    Channel, ChannelId, CloseReason, Connection, ConnectionEvents, LivenessConfig, Multiplexer,
    Signal, WireMessage,
};
use ipcdefer_transport::UnixDomainSocket;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::deferred::{
    decode_payload, encode_payload, requested_id, DeferredStore, Owner, ResolveResult, Resolver,
    DEFAULT_MAX_TOMBSTONES, RESOLVE_METHOD,
};
use crate::error::{ResolveError, Result};

/// Peer-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Default bound on a broker round-trip in [`DeferredClient::resolve`]. Default: 30s.
    pub resolve_timeout: Option<Duration>,
    /// Initiate pings toward the broker. Default: off (pings are only answered).
    pub liveness: Option<LivenessConfig>,
    pub frame: FrameConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Some(Duration::from_secs(30)),
            liveness: None,
            frame: FrameConfig::default(),
        }
    }
}

struct ClientEvents {
    peer_count: watch::Sender<Option<usize>>,
}

impl ConnectionEvents for ClientEvents {
    fn on_register(&self, channel: ChannelId, id: String) {
        debug!(%channel, %id, "ignoring registration sent to a peer");
    }

    fn on_connection_count(&self, count: usize) {
        self.peer_count.send_replace(Some(count));
    }
}

/// One peer's connection to a broker.
///
/// Values registered here are produced locally when the broker asks for
/// them; anything else is resolved through the broker.
pub struct DeferredClient {
    mux: Multiplexer,
    local: DeferredStore,
    config: ClientConfig,
    peer_count: watch::Receiver<Option<usize>>,
    task: Option<JoinHandle<CloseReason>>,
}

impl DeferredClient {
    /// Connect to a broker listening on `path`.
    pub async fn connect(path: impl AsRef<Path>, config: ClientConfig) -> Result<Self> {
        let stream = UnixDomainSocket::connect(path).await?;
        if let Some(creds) = stream.peer_credentials() {
            debug!(uid = creds.uid, pid = ?creds.pid, "connected to broker");
        }
        let channel = Channel::spawn_with_config(stream, &config.frame);
        Ok(Self::from_channel(channel, config))
    }

    /// Run the peer side over an already established channel.
    pub fn from_channel(channel: Channel, config: ClientConfig) -> Self {
        let connection = Connection::new(channel).with_liveness(config.liveness);
        let mux = connection.multiplexer().clone();
        let local = DeferredStore::new(DEFAULT_MAX_TOMBSTONES);

        let store = local.clone();
        mux.serve(RESOLVE_METHOD, move |data: Value| {
            let store = store.clone();
            async move {
                let id = requested_id(data)?;
                debug!(%id, "broker asked for value");
                let bytes = store.resolve(&id, local_only).await?;
                Ok::<_, ResolveError>(encode_payload(&bytes))
            }
        });

        let (count_tx, peer_count) = watch::channel(None);
        let events = ClientEvents {
            peer_count: count_tx,
        };
        let task = tokio::spawn(async move { connection.run(&events).await });

        Self {
            mux,
            local,
            config,
            peer_count,
            task: Some(task),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.mux.channel_id()
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Offer a value under `id`. It is produced by `resolver` the first time
    /// anyone resolves `id`, and only then.
    pub fn register_deferred<R>(
        &self,
        id: impl Into<String>,
        resolver: R,
    ) -> std::result::Result<(), ResolveError>
    where
        R: Resolver + 'static,
    {
        let id = id.into();
        self.local.register(id.clone(), Owner::Local(Arc::new(resolver)))?;
        if self.mux.sender().send(WireMessage::register(id.clone())).is_err() {
            self.local.lock().unregister(&id);
            return Err(ResolveError::Disconnected);
        }
        debug!(%id, "registered deferred value");
        Ok(())
    }

    /// Resolve `id` with the configured timeout.
    pub async fn resolve(&self, id: &str) -> ResolveResult {
        self.resolve_with_timeout(id, self.config.resolve_timeout).await
    }

    /// Resolve `id`: locally if this peer owns it, otherwise through the
    /// broker with `timeout` on the round-trip.
    pub async fn resolve_with_timeout(&self, id: &str, timeout: Option<Duration>) -> ResolveResult {
        match self.local.begin(id, local_only) {
            Ok(resolution) => return resolution.await,
            Err(ResolveError::UnknownIdentifier(_)) => {}
            Err(err) => return Err(err),
        }

        let reply = self
            .mux
            .call(RESOLVE_METHOD, Value::String(id.to_string()), timeout)
            .await
            .map_err(|err| ResolveError::from_rpc(err, id))?;
        decode_payload(reply)
    }

    /// Latest peer count announced by the broker, if any yet.
    pub fn connection_count(&self) -> Option<usize> {
        *self.peer_count.borrow()
    }

    /// Wait until the broker announces a peer count that satisfies `accept`.
    /// Returns at once if the latest announcement already does.
    pub async fn wait_connection_count<F>(
        &self,
        mut accept: F,
    ) -> std::result::Result<usize, ResolveError>
    where
        F: FnMut(usize) -> bool,
    {
        let mut counts = self.peer_count.clone();
        let count = counts
            .wait_for(|count| count.is_some_and(&mut accept))
            .await
            .map_err(|_| ResolveError::Disconnected)?;
        Ok(count.unwrap_or_default())
    }

    pub fn is_closed(&self) -> bool {
        self.mux.sender().is_closed()
    }

    /// Say `"close"`, flush, and wait for the connection to wind down.
    pub async fn disconnect(mut self) -> CloseReason {
        let _ = self.mux.sender().send(Signal::Close);
        self.mux.sender().shutdown().await;
        match self.task.take() {
            Some(task) => task.await.unwrap_or(CloseReason::Local),
            None => CloseReason::Local,
        }
    }
}

impl Drop for DeferredClient {
    fn drop(&mut self) {
        self.mux.sender().close();
    }
}

impl std::fmt::Debug for DeferredClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredClient")
            .field("channel", &self.channel_id())
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Entries in a peer's own store are always local.
fn local_only(channel: ChannelId) -> BoxFuture<'static, ResolveResult> {
    async move {
        Err(ResolveError::Failed(format!(
            "value owned by {channel} is not local"
        )))
    }
    .boxed()
}
