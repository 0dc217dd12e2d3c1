use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::{ChannelId, ChannelSender};
use crate::error::{Result, RpcError};
use crate::wire::{RequestId, WireMessage};

/// Error text and optional machine-readable code carried by an error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub message: String,
    pub code: Option<String>,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<String> for RemoteFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for RemoteFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

type HandlerFuture = BoxFuture<'static, std::result::Result<Value, RemoteFailure>>;
type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;
type Completion = oneshot::Sender<Result<Value>>;

struct Shared {
    sender: ChannelSender,
    next_request_id: AtomicU64,
    in_flight: Mutex<HashMap<RequestId, Completion>>,
    incoming: Mutex<HashMap<RequestId, CancellationToken>>,
    handlers: Mutex<HashMap<String, Handler>>,
    idle: Notify,
}

impl Shared {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<RequestId, Completion>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn incoming(&self) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.incoming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Handler>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle an outgoing call locally, telling the peer to stop working on it.
    fn cancel_outgoing(&self, request_id: RequestId, reason: RpcError) {
        let Some(completion) = self.in_flight().remove(&request_id) else {
            return;
        };
        debug!(channel = %self.sender.id(), request_id, %reason, "canceling request");
        let _ = self.sender.send(WireMessage::cancel(request_id));
        let _ = completion.send(Err(reason));
    }

    /// Record a finished incoming handler and send its response, unless the
    /// request was canceled in the meantime.
    fn finish_incoming(
        &self,
        request_id: RequestId,
        token: &CancellationToken,
        outcome: Option<std::result::Result<Value, RemoteFailure>>,
    ) {
        {
            let mut incoming = self.incoming();
            let tracked = incoming.remove(&request_id).is_some();
            match outcome {
                Some(outcome) if tracked && !token.is_cancelled() => {
                    let response = match outcome {
                        Ok(data) => WireMessage::success(request_id, data),
                        Err(failure) => {
                            WireMessage::failure(request_id, failure.message, failure.code)
                        }
                    };
                    if self.sender.send(response).is_err() {
                        trace!(channel = %self.sender.id(), request_id, "response dropped; channel closed");
                    }
                }
                _ => trace!(channel = %self.sender.id(), request_id, "result discarded; request canceled"),
            }
        }
        self.idle.notify_waiters();
    }
}

/// Correlates outgoing requests with responses and runs handlers for
/// incoming requests on one channel. Cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    pub fn new(sender: ChannelSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                sender,
                next_request_id: AtomicU64::new(0),
                in_flight: Mutex::new(HashMap::new()),
                incoming: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.shared.sender.id()
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.shared.sender
    }

    /// Install the handler for `method`, replacing any previous one.
    ///
    /// A handler error becomes an error response; a panicking handler is
    /// reported the same way. Neither closes the channel.
    pub fn serve<F, Fut, E>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, E>> + Send + 'static,
        E: Into<RemoteFailure> + 'static,
    {
        let handler: Handler =
            Arc::new(move |data| handler(data).map(|r| r.map_err(Into::into)).boxed());
        self.shared.handlers().insert(method.into(), handler);
    }

    /// Send a request. The returned [`PendingCall`] resolves with the
    /// response, and is canceled by timeout, by [`PendingCall::cancel`], or by
    /// being dropped unfinished.
    pub fn call(
        &self,
        method: impl Into<String>,
        data: Value,
        timeout: Option<Duration>,
    ) -> PendingCall {
        let method = method.into();
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (completion, rx) = oneshot::channel();
        self.shared.in_flight().insert(request_id, completion);

        trace!(channel = %self.channel_id(), request_id, %method, "call");
        if let Err(err) = self
            .shared
            .sender
            .send(WireMessage::request(method, request_id, data))
        {
            if let Some(completion) = self.shared.in_flight().remove(&request_id) {
                let _ = completion.send(Err(err));
            }
        }

        PendingCall {
            rx,
            timer: timeout.map(|after| (after, Box::pin(tokio::time::sleep(after)))),
            handle: CallHandle {
                shared: self.shared.clone(),
                request_id,
            },
            done: false,
        }
    }

    /// Dispatch an incoming request to its handler on a new task.
    pub fn handle_request(&self, method: String, request_id: RequestId, data: Value) {
        let token = CancellationToken::new();
        {
            let mut incoming = self.shared.incoming();
            if incoming.contains_key(&request_id) {
                warn!(channel = %self.channel_id(), request_id, "ignoring duplicate request id");
                return;
            }
            incoming.insert(request_id, token.clone());
        }

        let handler = self.shared.handlers().get(&method).cloned();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => {
                    let run = AssertUnwindSafe(async move { handler(data).await }).catch_unwind();
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        result = run => Some(result.unwrap_or_else(|_| {
                            warn!(channel = %shared.sender.id(), request_id, %method, "request handler panicked");
                            Err(RemoteFailure::new(format!("request \"{method}\" failed: handler panicked")))
                        })),
                    }
                }
                None => {
                    debug!(channel = %shared.sender.id(), request_id, %method, "unexpected request");
                    Some(Err(RemoteFailure::new(format!(
                        "unexpected request \"{method}\""
                    ))))
                }
            };
            shared.finish_incoming(request_id, &token, outcome);
        });
    }

    /// Settle the matching outgoing call. Responses for unknown or already
    /// settled requests are ignored.
    pub fn handle_response(
        &self,
        request_id: RequestId,
        data: Option<Value>,
        error: Option<String>,
        code: Option<String>,
    ) {
        let Some(completion) = self.shared.in_flight().remove(&request_id) else {
            trace!(channel = %self.channel_id(), request_id, "ignoring late response");
            return;
        };
        let result = match error {
            Some(message) => Err(RpcError::Remote { message, code }),
            None => Ok(data.unwrap_or(Value::Null)),
        };
        let _ = completion.send(result);
    }

    /// The peer gave up on one of its requests: stop the handler and
    /// suppress its response.
    pub fn handle_cancel(&self, request_id: RequestId) {
        let token = self.shared.incoming().remove(&request_id);
        match token {
            Some(token) => {
                debug!(channel = %self.channel_id(), request_id, "peer canceled request");
                token.cancel();
                self.shared.idle.notify_waiters();
            }
            None => trace!(channel = %self.channel_id(), request_id, "cancel for unknown request"),
        }
    }

    /// Reject every outgoing call with [`RpcError::ChannelClosed`] and cancel
    /// every incoming handler. Called once the channel has closed.
    pub fn fail_all(&self) {
        let in_flight: Vec<_> = self.shared.in_flight().drain().collect();
        let incoming: Vec<_> = self.shared.incoming().drain().collect();
        if !in_flight.is_empty() || !incoming.is_empty() {
            debug!(
                channel = %self.channel_id(),
                in_flight = in_flight.len(),
                incoming = incoming.len(),
                "failing outstanding requests"
            );
        }
        for (_, completion) in in_flight {
            let _ = completion.send(Err(RpcError::ChannelClosed));
        }
        for (_, token) in incoming {
            token.cancel();
        }
        self.shared.idle.notify_waiters();
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.in_flight().len()
    }

    pub fn incoming_len(&self) -> usize {
        self.shared.incoming().len()
    }

    /// Wait until no incoming request is being handled.
    pub async fn idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.incoming().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("channel", &self.channel_id())
            .field("in_flight", &self.in_flight_len())
            .field("incoming", &self.incoming_len())
            .finish()
    }
}

/// Cancels one outgoing request from anywhere. Cloneable.
#[derive(Clone)]
pub struct CallHandle {
    shared: Arc<Shared>,
    request_id: RequestId,
}

impl CallHandle {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn cancel(&self) {
        self.cancel_with(RpcError::Canceled);
    }

    /// Reject the call with `reason` and send `cancelRequest`. No effect if
    /// the call already settled.
    pub fn cancel_with(&self, reason: RpcError) {
        self.shared.cancel_outgoing(self.request_id, reason);
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// An outgoing request awaiting its response.
///
/// A response and an expired timeout observed in the same poll settle in
/// favor of the response.
#[must_use = "dropping a PendingCall cancels the request"]
pub struct PendingCall {
    rx: oneshot::Receiver<Result<Value>>,
    timer: Option<(Duration, Pin<Box<Sleep>>)>,
    handle: CallHandle,
    done: bool,
}

impl PendingCall {
    pub fn request_id(&self) -> RequestId {
        self.handle.request_id
    }

    pub fn handle(&self) -> CallHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn cancel_with(&self, reason: RpcError) {
        self.handle.cancel_with(reason);
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Err(RpcError::Canceled));
        }

        if let Poll::Ready(settled) = Pin::new(&mut this.rx).poll(cx) {
            this.done = true;
            return Poll::Ready(settled.unwrap_or(Err(RpcError::ChannelClosed)));
        }

        if let Some((after, sleep)) = this.timer.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                let after = *after;
                this.handle.cancel_with(RpcError::Timeout(after));
                this.done = true;
                // A response may have landed between the two polls.
                return Poll::Ready(
                    this.rx
                        .try_recv()
                        .unwrap_or(Err(RpcError::Timeout(after))),
                );
            }
        }

        Poll::Pending
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.done {
            self.handle.cancel();
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("request_id", &self.handle.request_id)
            .field("timeout", &self.timer.as_ref().map(|(after, _)| *after))
            .field("done", &self.done)
            .finish()
    }
}
