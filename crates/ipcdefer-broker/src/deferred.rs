use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{ready, Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use ipcdefer_rpc::ChannelId;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ResolveError;

/// Request method asking an owner to produce a deferred value.
pub const RESOLVE_METHOD: &str = "resolve-data-promise";

/// Tombstones kept for ids whose owner vanished.
pub const DEFAULT_MAX_TOMBSTONES: usize = 1024;

pub type ResolveResult = std::result::Result<Bytes, ResolveError>;

/// One pending resolution, joinable by any number of resolvers.
pub type Resolution = Shared<BoxFuture<'static, ResolveResult>>;

/// Produces a deferred value on demand.
pub trait Resolver: Send + Sync {
    fn resolve(&self) -> BoxFuture<'static, ResolveResult>;
}

impl<F, Fut> Resolver for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ResolveResult> + Send + 'static,
{
    fn resolve(&self) -> BoxFuture<'static, ResolveResult> {
        self().boxed()
    }
}

/// Who can produce a value.
#[derive(Clone)]
pub enum Owner {
    Local(Arc<dyn Resolver>),
    Remote(ChannelId),
}

impl Owner {
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Self::Local(_) => None,
            Self::Remote(channel) => Some(*channel),
        }
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(_) => f.write_str("Local"),
            Self::Remote(channel) => write!(f, "Remote({channel})"),
        }
    }
}

enum EntryState {
    Unrequested,
    Resolving(Resolution, Arc<Interest>),
    Gone,
}

/// Resolvers still waiting on one resolution. Changed only with the
/// registry locked.
#[derive(Default)]
struct Interest {
    waiting: AtomicUsize,
    abandoned: CancellationToken,
}

impl Interest {
    fn join(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self) {
        if self.waiting.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.abandoned.cancel();
        }
    }
}

struct Entry {
    owner: Owner,
    state: EntryState,
    generation: u64,
}

/// Deferred ids and their owners.
///
/// An entry lives until its first resolution completes. If its owner goes
/// away first the entry becomes a tombstone, so late resolvers learn
/// [`ResolveError::PeerGone`] rather than [`ResolveError::UnknownIdentifier`].
/// Only the newest `max_tombstones` tombstones are kept.
pub struct DeferredRegistry {
    entries: HashMap<String, Entry>,
    tombstones: VecDeque<(String, u64)>,
    max_tombstones: usize,
    next_generation: u64,
}

impl DeferredRegistry {
    pub fn new(max_tombstones: usize) -> Self {
        Self {
            entries: HashMap::new(),
            tombstones: VecDeque::new(),
            max_tombstones,
            next_generation: 0,
        }
    }

    /// Record ownership of `id`. A live entry with the same id is left alone
    /// and reported as [`ResolveError::AlreadyRegistered`]; a tombstone is
    /// replaced.
    pub fn register(&mut self, id: String, owner: Owner) -> Result<(), ResolveError> {
        if let Some(existing) = self.entries.get(&id) {
            if !matches!(existing.state, EntryState::Gone) {
                return Err(ResolveError::AlreadyRegistered(id));
            }
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        trace!(%id, ?owner, generation, "registered");
        self.entries.insert(
            id,
            Entry {
                owner,
                state: EntryState::Unrequested,
                generation,
            },
        );
        Ok(())
    }

    /// True if `id` is registered and its owner is still around.
    pub fn is_live(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| !matches!(entry.state, EntryState::Gone))
    }

    pub fn is_resolving(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| matches!(entry.state, EntryState::Resolving(..)))
    }

    pub fn owner(&self, id: &str) -> Option<&Owner> {
        self.entries
            .get(id)
            .filter(|entry| !matches!(entry.state, EntryState::Gone))
            .map(|entry| &entry.owner)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| !matches!(entry.state, EntryState::Gone))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    /// Drop a live, not yet requested entry.
    pub fn unregister(&mut self, id: &str) -> bool {
        let removable = self
            .entries
            .get(id)
            .is_some_and(|entry| matches!(entry.state, EntryState::Unrequested));
        if removable {
            self.entries.remove(id);
        }
        removable
    }

    /// Turn every entry owned by `channel` into a tombstone. Returns the ids
    /// that were live.
    pub fn purge_owner(&mut self, channel: ChannelId) -> Vec<String> {
        let mut purged = Vec::new();
        for (id, entry) in &mut self.entries {
            if entry.owner.channel() == Some(channel)
                && !matches!(entry.state, EntryState::Gone)
            {
                entry.state = EntryState::Gone;
                purged.push(id.clone());
            }
        }
        for id in &purged {
            if let Some(entry) = self.entries.get(id) {
                self.tombstones.push_back((id.clone(), entry.generation));
            }
        }
        self.trim_tombstones();
        purged
    }

    /// Record the outcome of the resolution started for `generation`.
    ///
    /// Success and ordinary failures consume the entry. [`ResolveError::PeerGone`]
    /// leaves a tombstone. Stale generations are ignored.
    pub fn settle(&mut self, id: &str, generation: u64, outcome: &ResolveResult) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.generation != generation || !matches!(entry.state, EntryState::Resolving(..)) {
            return;
        }
        match outcome {
            Err(ResolveError::PeerGone(_)) => {
                entry.state = EntryState::Gone;
                self.tombstones.push_back((id.to_string(), generation));
                self.trim_tombstones();
            }
            _ => {
                self.entries.remove(id);
            }
        }
        trace!(%id, generation, ok = outcome.is_ok(), "settled");
    }

    fn trim_tombstones(&mut self) {
        while self.tombstones.len() > self.max_tombstones {
            let Some((id, generation)) = self.tombstones.pop_front() else {
                break;
            };
            let still_this_tombstone = self.entries.get(&id).is_some_and(|entry| {
                entry.generation == generation && matches!(entry.state, EntryState::Gone)
            });
            if still_this_tombstone {
                self.entries.remove(&id);
            }
        }
    }
}

impl Default for DeferredRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TOMBSTONES)
    }
}

impl fmt::Debug for DeferredRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredRegistry")
            .field("live", &self.len())
            .field("tombstones", &self.tombstones.len())
            .finish()
    }
}

/// Shared handle to a [`DeferredRegistry`] that runs resolutions.
#[derive(Clone, Default)]
pub struct DeferredStore {
    inner: Arc<Mutex<DeferredRegistry>>,
}

impl DeferredStore {
    pub fn new(max_tombstones: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeferredRegistry::new(max_tombstones))),
        }
    }

    /// Lock the registry. Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, DeferredRegistry> {
        lock(&self.inner)
    }

    pub fn register(&self, id: impl Into<String>, owner: Owner) -> Result<(), ResolveError> {
        self.lock().register(id.into(), owner)
    }

    /// Turn every entry owned by `channel` into a tombstone.
    pub fn purge_owner(&self, channel: ChannelId) -> Vec<String> {
        self.lock().purge_owner(channel)
    }

    /// Join the resolution of `id`, starting it if nobody has asked yet.
    ///
    /// Local owners run their resolver; remote owners are reached through
    /// `remote`. Neither is called with the registry locked, so both may use
    /// this store. The resolution is driven on its own task while at least one
    /// [`Joined`] is waiting on it. Once every one of them is dropped unfinished
    /// the work is dropped too, which cancels an owner round-trip in flight.
    /// The entry is consumed either way.
    pub fn begin<F>(&self, id: &str, remote: F) -> Result<Joined, ResolveError>
    where
        F: FnOnce(ChannelId) -> BoxFuture<'static, ResolveResult>,
    {
        let (owner, start, joined) = {
            let mut registry = self.lock();
            let Some(entry) = registry.entries.get_mut(id) else {
                return Err(ResolveError::UnknownIdentifier(id.to_string()));
            };

            match &entry.state {
                EntryState::Gone => return Err(ResolveError::PeerGone(id.to_string())),
                EntryState::Resolving(_, interest) if interest.abandoned.is_cancelled() => {
                    return Err(ResolveError::UnknownIdentifier(id.to_string()));
                }
                EntryState::Resolving(resolution, interest) => {
                    debug!(%id, "joining pending resolution");
                    interest.join();
                    return Ok(self.joined(resolution.clone(), interest.clone()));
                }
                EntryState::Unrequested => {}
            }

            // The work itself is handed over once the lock is released.
            let (start, started) = oneshot::channel::<BoxFuture<'static, ResolveResult>>();
            let work = async move {
                match started.await {
                    Ok(work) => work.await,
                    Err(_) => Err(ResolveError::Failed("resolver panicked".to_string())),
                }
            }
            .boxed();

            let interest = Arc::new(Interest::default());
            interest.join();
            let resolution = settle_on_completion(
                Arc::downgrade(&self.inner),
                id.to_string(),
                entry.generation,
                interest.abandoned.clone(),
                work,
            );
            entry.state = EntryState::Resolving(resolution.clone(), interest.clone());
            debug!(%id, owner = ?entry.owner, "resolution started");
            tokio::spawn(resolution.clone());
            (entry.owner.clone(), start, self.joined(resolution, interest))
        };

        let work = std::panic::catch_unwind(AssertUnwindSafe(|| match owner {
            Owner::Local(resolver) => resolver.resolve(),
            Owner::Remote(channel) => remote(channel),
        }));
        match work {
            Ok(work) => {
                let _ = start.send(work);
            }
            Err(_) => warn!(%id, "resolver panicked"),
        }
        Ok(joined)
    }

    pub async fn resolve<F>(&self, id: &str, remote: F) -> ResolveResult
    where
        F: FnOnce(ChannelId) -> BoxFuture<'static, ResolveResult>,
    {
        self.begin(id, remote)?.await
    }

    fn joined(&self, resolution: Resolution, interest: Arc<Interest>) -> Joined {
        Joined {
            resolution,
            interest,
            registry: Arc::downgrade(&self.inner),
            done: false,
        }
    }
}

/// One resolver waiting on a shared resolution.
///
/// Dropping it unfinished withdraws its interest; when the last one goes the
/// resolution is abandoned.
#[must_use = "dropping a Joined withdraws from the resolution"]
pub struct Joined {
    resolution: Resolution,
    interest: Arc<Interest>,
    registry: Weak<Mutex<DeferredRegistry>>,
    done: bool,
}

impl Future for Joined {
    type Output = ResolveResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = ready!(this.resolution.poll_unpin(cx));
        this.done = true;
        Poll::Ready(outcome)
    }
}

impl Drop for Joined {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let registry = self.registry.upgrade();
        let _held = registry.as_deref().map(lock);
        self.interest.leave();
    }
}

impl fmt::Debug for Joined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Joined")
            .field("waiting", &self.interest.waiting.load(Ordering::SeqCst))
            .field("done", &self.done)
            .finish()
    }
}

impl fmt::Debug for DeferredStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.lock(), f)
    }
}

fn lock(inner: &Mutex<DeferredRegistry>) -> MutexGuard<'_, DeferredRegistry> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wrap `work` so the registry is updated before any joined resolver sees
/// the outcome.
fn settle_on_completion(
    registry: Weak<Mutex<DeferredRegistry>>,
    id: String,
    generation: u64,
    abandoned: CancellationToken,
    work: BoxFuture<'static, ResolveResult>,
) -> Resolution {
    async move {
        let outcome = tokio::select! {
            biased;
            outcome = AssertUnwindSafe(work).catch_unwind() => outcome.unwrap_or_else(|_| {
                warn!(%id, "resolver panicked");
                Err(ResolveError::Failed("resolver panicked".to_string()))
            }),
            _ = abandoned.cancelled() => {
                debug!(%id, "every resolver gave up; abandoning resolution");
                Err(ResolveError::Canceled)
            }
        };
        if let Some(registry) = registry.upgrade() {
            lock(&registry).settle(&id, generation, &outcome);
        }
        outcome
    }
    .boxed()
    .shared()
}

/// Bytes as a JSON array of integers.
pub fn encode_payload(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect())
}

pub fn decode_payload(value: Value) -> ResolveResult {
    serde_json::from_value::<Vec<u8>>(value)
        .map(Bytes::from)
        .map_err(|err| ResolveError::InvalidPayload(err.to_string()))
}

/// The id argument of a resolve request.
pub(crate) fn requested_id(data: Value) -> Result<String, ResolveError> {
    match data {
        Value::String(id) => Ok(id),
        other => Err(ResolveError::InvalidPayload(format!(
            "expected a string id, got {other}"
        ))),
    }
}

/// A fresh opaque id: base-36 milliseconds since the epoch, then a
/// process-local sequence number.
pub fn generate_id() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{}.{}", base36(millis), base36(seq))
}

fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::new();
    loop {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
