use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use ipcdefer_rpc::{
    Channel, ChannelId, CloseReason, Connection, ConnectionEvents, LivenessConfig, RpcError, Signal,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::deferred::{
    decode_payload, encode_payload, requested_id, DeferredStore, Owner, ResolveResult, Resolver,
    DEFAULT_MAX_TOMBSTONES, RESOLVE_METHOD,
};
use crate::error::ResolveError;
use crate::peers::PeerRegistry;

/// Broker behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Ping peers and evict those that stop answering. Default: 1s / 60s.
    pub liveness: Option<LivenessConfig>,
    /// Upper bound on one owner round-trip. Default: none.
    pub owner_timeout: Option<Duration>,
    /// Tombstones kept for ids whose owner disconnected. Default: 1024.
    pub max_tombstones: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            liveness: Some(LivenessConfig::default()),
            owner_timeout: None,
            max_tombstones: DEFAULT_MAX_TOMBSTONES,
        }
    }
}

/// Routes deferred-value resolution between connected peers.
///
/// Owns the peer set and the deferred registry; both are only reached
/// through its methods.
pub struct Broker {
    config: BrokerConfig,
    peers: Arc<Mutex<PeerRegistry>>,
    deferred: DeferredStore,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            deferred: DeferredStore::new(config.max_tombstones),
            peers: Arc::new(Mutex::new(PeerRegistry::new())),
            config,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn peers(&self) -> MutexGuard<'_, PeerRegistry> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve one peer until its channel closes, then evict it.
    pub async fn serve_connection(self: Arc<Self>, channel: Channel) -> CloseReason {
        let connection = Connection::new(channel).with_liveness(self.config.liveness);
        let channel_id = connection.id();

        let broker: Weak<Self> = Arc::downgrade(&self);
        connection
            .multiplexer()
            .serve(RESOLVE_METHOD, move |data: Value| {
                let broker = broker.upgrade();
                async move {
                    let broker = broker.ok_or(ResolveError::Disconnected)?;
                    let id = requested_id(data)?;
                    debug!(requester = %channel_id, %id, "resolve requested");
                    let bytes = broker.resolve(&id).await?;
                    Ok::<_, ResolveError>(encode_payload(&bytes))
                }
            });

        self.peers().connect(connection.multiplexer().clone());
        connection.run(self.as_ref()).await
    }

    /// Resolve `id` on behalf of a requester.
    pub async fn resolve(&self, id: &str) -> ResolveResult {
        let resolution = self
            .deferred
            .begin(id, |owner| self.owner_round_trip(owner, id))?;
        resolution.await
    }

    /// Ask the owner for the value. The owner's channel is looked up when the
    /// round-trip starts; a missing owner means it is already gone.
    fn owner_round_trip(&self, owner: ChannelId, id: &str) -> BoxFuture<'static, ResolveResult> {
        let peers = self.peers.clone();
        let timeout = self.config.owner_timeout;
        let id = id.to_string();
        async move {
            let mux = peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(owner);
            let Some(mux) = mux else {
                return Err(ResolveError::PeerGone(id));
            };
            debug!(channel = %owner, %id, "asking owner");
            match mux.call(RESOLVE_METHOD, Value::String(id.clone()), timeout).await {
                Ok(value) => decode_payload(value),
                Err(RpcError::ChannelClosed) => Err(ResolveError::PeerGone(id)),
                Err(err) => Err(ResolveError::from_rpc(err, &id)),
            }
        }
        .boxed()
    }

    /// Register a value this process owns; resolving it runs `resolver` here.
    pub fn register_local<R>(&self, id: impl Into<String>, resolver: R) -> Result<(), ResolveError>
    where
        R: Resolver + 'static,
    {
        self.deferred.register(id, Owner::Local(Arc::new(resolver)))
    }

    /// Remove a peer and fail everything it owned. Returns false if it was
    /// already gone.
    pub fn evict(&self, channel: ChannelId, reason: CloseReason) -> bool {
        let Some(remaining) = self.peers().evict(channel) else {
            return false;
        };
        let purged = self.deferred.purge_owner(channel);
        info!(%channel, %reason, remaining, purged = purged.len(), "evicted peer");
        true
    }

    pub fn connection_count(&self) -> usize {
        self.peers().len()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.deferred.lock().is_live(id)
    }

    pub fn is_resolving(&self, id: &str) -> bool {
        self.deferred.lock().is_resolving(id)
    }

    /// Say `"close"` to every peer and close their channels.
    pub fn close_all(&self) {
        let peers = self.peers().members();
        for peer in peers {
            let _ = peer.sender().send(Signal::Close);
            peer.sender().close();
        }
    }
}

impl ConnectionEvents for Broker {
    fn on_register(&self, channel: ChannelId, id: String) {
        match self.deferred.register(id, Owner::Remote(channel)) {
            Ok(()) => debug!(%channel, "deferred value registered"),
            Err(err) => warn!(%channel, error = %err, "ignoring registration"),
        }
    }

    fn on_connection_count(&self, count: usize) {
        debug!(count, "ignoring peer count sent to broker");
    }

    fn on_close(&self, channel: ChannelId, reason: CloseReason) {
        self.evict(channel, reason);
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("peers", &self.connection_count())
            .field("deferred", &self.deferred)
            .finish()
    }
}
