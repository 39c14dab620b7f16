//! RPC core: call/response correlation and handler dispatch over one transport.

use crate::error::{Result, RpcError};
use crate::handler::HandlerTable;
use crate::message::{error_codes, Message, MessageId};
use crate::transport::Transport;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Tunables for an [`Rpc`] instance.
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    /// Per-call timeout. `None` waits until the peer answers or the
    /// connection goes away.
    pub call_timeout: Option<Duration>,
}

impl RpcConfig {
    /// Set the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// Lifecycle state of an [`Rpc`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    /// Created, not yet listening.
    Idle,
    /// Listening on the transport.
    Running,
    /// The transport's inbound stream ended.
    Closed,
    /// `stop()` was called.
    Stopped,
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
    created_at: Instant,
}

struct CallTable {
    state: RpcState,
    pending: HashMap<MessageId, PendingCall>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: RpcConfig,
    next_id: AtomicU64,
    table: Mutex<CallTable>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// One endpoint of an RPC conversation.
///
/// Cheap to clone; all clones share the same pending-call table and
/// transport.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<Inner>,
}

impl Rpc {
    /// Bind a new instance to `transport` with default settings.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, RpcConfig::default())
    }

    /// Bind a new instance to `transport`.
    pub fn with_config(transport: Arc<dyn Transport>, config: RpcConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                next_id: AtomicU64::new(1),
                table: Mutex::new(CallTable {
                    state: RpcState::Idle,
                    pending: HashMap::new(),
                }),
                shutdown: CancellationToken::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Start servicing `handlers` and resolving replies.
    ///
    /// Calling this again while running is a no-op.
    pub fn start(&self, handlers: HandlerTable) -> Result<()> {
        match self.launch(handlers, None) {
            Err(RpcError::AlreadyStarted) => {
                tracing::debug!(transport = self.inner.transport.name(), "Rpc already running");
                Ok(())
            }
            other => other,
        }
    }

    /// Start in pass-through mode.
    ///
    /// Inbound calls for methods missing from `handlers`, and replies that
    /// match no pending call, are delivered to the returned stream instead
    /// of being answered or discarded. The stream ends with the instance.
    pub fn start_relay(&self, handlers: HandlerTable) -> Result<mpsc::UnboundedReceiver<Message>> {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        self.launch(handlers, Some(relay_tx))?;
        Ok(relay_rx)
    }

    fn launch(
        &self,
        handlers: HandlerTable,
        relay: Option<mpsc::UnboundedSender<Message>>,
    ) -> Result<()> {
        let incoming = {
            let mut table = self.inner.table.lock();
            match table.state {
                RpcState::Idle => {}
                RpcState::Running => return Err(RpcError::AlreadyStarted),
                RpcState::Closed => return Err(RpcError::TransportClosed),
                RpcState::Stopped => return Err(RpcError::Stopped),
            }
            let incoming = self
                .inner
                .transport
                .incoming()
                .ok_or(RpcError::AlreadyStarted)?;
            table.state = RpcState::Running;
            incoming
        };

        tracing::debug!(
            transport = self.inner.transport.name(),
            methods = ?handlers.methods(),
            relay = relay.is_some(),
            "Starting rpc"
        );

        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&self.inner),
            handlers,
            incoming,
            relay,
        ));
        *self.inner.dispatcher.lock() = Some(dispatcher);
        Ok(())
    }

    /// Send an already-formed message to the peer.
    pub fn forward(&self, message: Message) -> Result<()> {
        self.inner.transport.send(message)?;
        Ok(())
    }

    /// Issue a call without waiting for its reply.
    ///
    /// The `call` message is queued on the transport when this returns, so
    /// successive calls from one task reach the peer in order.
    pub fn begin_call(&self, method: &str, args: Vec<Value>) -> Result<PendingResponse> {
        let id = MessageId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (reply, rx) = oneshot::channel();

        {
            let mut table = self.inner.table.lock();
            match table.state {
                RpcState::Stopped => return Err(RpcError::Stopped),
                RpcState::Closed => return Err(RpcError::TransportClosed),
                RpcState::Idle | RpcState::Running => {}
            }
            table.pending.insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    reply,
                    created_at: Instant::now(),
                },
            );
        }

        tracing::debug!(method = %method, id = %id, "Sending call");

        if let Err(e) = self
            .inner
            .transport
            .send(Message::call(id.clone(), method, args))
        {
            self.inner.table.lock().pending.remove(&id);
            return Err(e.into());
        }

        Ok(PendingResponse {
            id,
            method: method.to_string(),
            rx,
            inner: Arc::downgrade(&self.inner),
            timeout: self.inner.config.call_timeout,
        })
    }

    /// Invoke `method` on the peer and wait for its reply.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.begin_call(method, args)?.wait().await
    }

    /// Invoke `method` and deserialize the reply.
    pub async fn call_as<R: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<R> {
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Deactivate the instance.
    ///
    /// Every outstanding call is rejected with [`RpcError::Stopped`], in-flight
    /// handlers are aborted and the transport is closed. Safe to call more
    /// than once and before [`start`](Self::start).
    pub async fn stop(&self) {
        let drained = {
            let mut table = self.inner.table.lock();
            if table.state == RpcState::Stopped {
                return;
            }
            table.state = RpcState::Stopped;
            std::mem::take(&mut table.pending)
        };

        tracing::debug!(
            transport = self.inner.transport.name(),
            rejected = drained.len(),
            "Stopping rpc"
        );

        for (_, call) in drained {
            let _ = call.reply.send(Err(RpcError::Stopped));
        }

        self.inner.shutdown.cancel();
        self.inner.transport.close().await;

        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }

    /// Wait until the instance is stopped or its transport has closed.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RpcState {
        self.inner.table.lock().state
    }

    /// True while listening on the transport.
    pub fn is_running(&self) -> bool {
        self.state() == RpcState::Running
    }

    /// Number of calls awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.table.lock().pending.len()
    }

    /// Name of the bound transport.
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }
}

impl Inner {
    fn handle_message(
        &self,
        message: Message,
        handlers: &HandlerTable,
        relay: Option<&mpsc::UnboundedSender<Message>>,
        tasks: &mut JoinSet<()>,
    ) {
        match message {
            Message::Call {
                id,
                method,
                payload,
            } => match handlers.get(&method) {
                Some(handler) => {
                    tracing::debug!(method = %method, id = %id, "Handling call");
                    let transport = Arc::clone(&self.transport);
                    tasks.spawn(async move {
                        let reply = match handler(payload).await {
                            Ok(value) => Message::response(id, value),
                            Err(e) => {
                                tracing::warn!(method = %method, error = %e, "Handler failed");
                                Message::error(id, e.code(), e.to_string())
                            }
                        };
                        if transport.send(reply).is_err() {
                            tracing::debug!(method = %method, "Transport closed, reply dropped");
                        }
                    });
                }
                None => {
                    let message = Message::Call {
                        id,
                        method,
                        payload,
                    };
                    if let Some(relay) = relay {
                        self.relay(relay, message);
                    } else {
                        self.reject_unknown(message);
                    }
                }
            },
            reply => self.settle(reply, relay),
        }
    }

    fn reject_unknown(&self, call: Message) {
        if let Message::Call { id, method, .. } = call {
            tracing::warn!(method = %method, id = %id, "Method not found");
            let reply = Message::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {method}"),
            );
            if self.transport.send(reply).is_err() {
                tracing::debug!("Transport closed, error reply dropped");
            }
        }
    }

    fn settle(&self, reply: Message, relay: Option<&mpsc::UnboundedSender<Message>>) {
        let id = reply.id().clone();
        let pending = self.table.lock().pending.remove(&id);

        let Some(call) = pending else {
            match relay {
                Some(relay) => self.relay(relay, reply),
                None => tracing::debug!(id = %id, kind = reply.kind(), "Discarding reply for unknown call"),
            }
            return;
        };

        let outcome = match reply {
            Message::Response { payload, .. } => Ok(payload),
            Message::Error { payload, .. } => Err(RpcError::Remote {
                code: payload.code,
                message: payload.message,
            }),
            Message::Call { .. } => return,
        };

        tracing::debug!(
            method = %call.method,
            id = %id,
            ok = outcome.is_ok(),
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "Call settled"
        );
        let _ = call.reply.send(outcome);
    }

    fn relay(&self, relay: &mpsc::UnboundedSender<Message>, message: Message) {
        if relay.send(message).is_err() {
            tracing::debug!("Relay stream dropped, message discarded");
        }
    }

    fn on_transport_closed(&self) {
        let drained = {
            let mut table = self.table.lock();
            if table.state == RpcState::Running {
                table.state = RpcState::Closed;
            }
            std::mem::take(&mut table.pending)
        };

        tracing::info!(
            transport = self.transport.name(),
            rejected = drained.len(),
            "Transport closed"
        );

        for (_, call) in drained {
            let _ = call.reply.send(Err(RpcError::TransportClosed));
        }
        self.shutdown.cancel();
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    handlers: HandlerTable,
    mut incoming: mpsc::UnboundedReceiver<Message>,
    relay: Option<mpsc::UnboundedSender<Message>>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Handler task panicked");
                    }
                }
            }
            message = incoming.recv() => match message {
                Some(message) => inner.handle_message(message, &handlers, relay.as_ref(), &mut tasks),
                None => {
                    inner.on_transport_closed();
                    break;
                }
            },
        }
    }

    if !tasks.is_empty() {
        tracing::debug!(aborted = tasks.len(), "Aborting in-flight handlers");
    }
    tasks.shutdown().await;
}

/// A call whose `call` message has been sent.
#[must_use = "the reply is only observed through wait()"]
pub struct PendingResponse {
    id: MessageId,
    method: String,
    rx: oneshot::Receiver<Result<Value>>,
    inner: Weak<Inner>,
    timeout: Option<Duration>,
}

impl PendingResponse {
    /// Correlation id of the call.
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Wait for the call's single outcome.
    pub async fn wait(self) -> Result<Value> {
        let Self {
            id,
            method,
            rx,
            inner,
            timeout,
        } = self;

        let outcome = match timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.table.lock().pending.remove(&id);
                    }
                    tracing::warn!(method = %method, id = %id, ?limit, "Call timed out");
                    return Err(RpcError::Timeout {
                        method,
                        timeout: limit,
                    });
                }
            },
        };

        outcome.unwrap_or(Err(RpcError::Stopped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::arg;
    use crate::transport::{ProcessTransport, Window, WindowTransport};
    use serde_json::json;
    use tokio::sync::Notify;

    fn pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        let left = Window::new();
        let right = Window::new();
        let a = WindowTransport::new(&left, right.clone(), "test");
        let b = WindowTransport::new(&right, left, "test");
        (Arc::new(a), Arc::new(b))
    }

    async fn double(args: Vec<Value>) -> std::result::Result<Value, HandlerError> {
        let n: i64 = arg(&args, 0)?;
        Ok(json!(n * 2))
    }

    async fn fail(_args: Vec<Value>) -> std::result::Result<Value, HandlerError> {
        Err(HandlerError::failed("boom"))
    }

    fn gated(gate: Arc<Notify>) -> HandlerTable {
        HandlerTable::new()
            .register("double", double)
            .register("wait", move |_| {
                let gate = Arc::clone(&gate);
                async move {
                    gate.notified().await;
                    Ok::<_, HandlerError>(json!("released"))
                }
            })
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (a, b) = pair();
        let caller = Rpc::new(a);
        let callee = Rpc::new(b);
        caller.start(HandlerTable::new()).unwrap();
        callee.start(HandlerTable::new().register("double", double)).unwrap();

        assert_eq!(caller.call("double", vec![json!(21)]).await.unwrap(), json!(42));
        let typed: i64 = caller.call_as("double", vec![json!(5)]).await.unwrap();
        assert_eq!(typed, 10);
        assert_eq!(caller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_method_names_method() {
        let (a, b) = pair();
        let caller = Rpc::new(a);
        let callee = Rpc::new(b);
        caller.start(HandlerTable::new()).unwrap();
        callee.start(HandlerTable::new()).unwrap();

        match caller.call("nope", vec![]).await {
            Err(RpcError::Remote { code, message }) => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "method not found: nope");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error() {
        let (a, b) = pair();
        let caller = Rpc::new(a);
        let callee = Rpc::new(b);
        caller.start(HandlerTable::new()).unwrap();
        callee
            .start(HandlerTable::new().register("fail", fail).register("double", double))
            .unwrap();

        match caller.call("fail", vec![]).await {
            Err(RpcError::Remote { code, message }) => {
                assert_eq!(code, error_codes::INTERNAL_ERROR);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        match caller.call("double", vec![json!("x")]).await {
            Err(RpcError::Remote { code, .. }) => assert_eq!(code, error_codes::INVALID_PARAMS),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_out_of_order() {
        let (a, b) = pair();
        let gate = Arc::new(Notify::new());
        let caller = Rpc::new(a);
        let callee = Rpc::new(b);
        caller.start(HandlerTable::new()).unwrap();
        callee.start(gated(Arc::clone(&gate))).unwrap();

        let slow = caller.begin_call("wait", vec![]).unwrap();
        let fast = caller.begin_call("double", vec![json!(1)]).unwrap();
        assert_ne!(slow.id(), fast.id());

        assert_eq!(fast.wait().await.unwrap(), json!(2));
        assert_eq!(caller.pending_count(), 1);

        gate.notify_one();
        assert_eq!(slow.wait().await.unwrap(), json!("released"));
        assert_eq!(caller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_rejects_pending_once() {
        let (a, b) = pair();
        let caller = Rpc::new(a);
        let callee = Rpc::new(b);
        caller.start(HandlerTable::new()).unwrap();
        callee.start(gated(Arc::new(Notify::new()))).unwrap();

        let first = caller.begin_call("wait", vec![]).unwrap();
        let second = caller.begin_call("wait", vec![]).unwrap();
        assert_eq!(caller.pending_count(), 2);

        caller.stop().await;
        caller.stop().await;

        assert!(matches!(first.wait().await, Err(RpcError::Stopped)));
        assert!(matches!(second.wait().await, Err(RpcError::Stopped)));
        assert_eq!(caller.pending_count(), 0);
        assert!(matches!(caller.call("double", vec![json!(1)]).await, Err(RpcError::Stopped)));
        assert_eq!(caller.state(), RpcState::Stopped);
        caller.closed().await;
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let (a, _b) = pair();
        let rpc = Rpc::new(a);
        rpc.stop().await;
        assert!(matches!(rpc.start(HandlerTable::new()), Err(RpcError::Stopped)));
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let (a, _b) = pair();
        let rpc = Rpc::new(a);
        rpc.start(HandlerTable::new()).unwrap();
        rpc.start(HandlerTable::new()).unwrap();
        assert!(rpc.is_running());
        assert!(matches!(
            rpc.start_relay(HandlerTable::new()),
            Err(RpcError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_call_timeout_clears_entry() {
        let (a, b) = pair();
        let caller = Rpc::with_config(
            a,
            RpcConfig::default().with_call_timeout(Duration::from_millis(50)),
        );
        let callee = Rpc::new(b);
        caller.start(HandlerTable::new()).unwrap();
        callee.start(gated(Arc::new(Notify::new()))).unwrap();

        match caller.call("wait", vec![]).await {
            Err(RpcError::Timeout { method, .. }) => assert_eq!(method, "wait"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(caller.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_close_rejects_pending() {
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg("sleep 0.2");
        let transport = Arc::new(ProcessTransport::spawn(command).unwrap());
        let rpc = Rpc::new(transport);
        rpc.start(HandlerTable::new()).unwrap();

        assert!(matches!(
            rpc.call("anything", vec![]).await,
            Err(RpcError::TransportClosed)
        ));
        rpc.closed().await;
        assert_eq!(rpc.state(), RpcState::Closed);
        assert!(matches!(
            rpc.call("anything", vec![]).await,
            Err(RpcError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_relay_mode_passes_through() {
        let (a, b) = pair();
        let relay = Rpc::new(a);
        let peer = Rpc::new(b);
        let mut passed = relay.start_relay(HandlerTable::new()).unwrap();
        peer.start(HandlerTable::new()).unwrap();

        let pending = peer.begin_call("runCell", vec![json!("1+1")]).unwrap();
        let relayed = passed.recv().await.unwrap();
        assert_eq!(relayed.kind(), "call");

        relay
            .forward(Message::response(relayed.id().clone(), json!("done")))
            .unwrap();
        assert_eq!(pending.wait().await.unwrap(), json!("done"));

        // A stray reply with no pending call is relayed too.
        peer.forward(Message::response(999, json!(null))).unwrap();
        assert_eq!(passed.recv().await.unwrap(), Message::response(999, json!(null)));
    }
}
