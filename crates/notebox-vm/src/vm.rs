//! The notebook VM: one sandbox reached over whichever transport works.

use crate::config::VmConfig;
use crate::error::{Result, VmError};
use crate::surface::SandboxSurface;
use notebox_rpc::{HandlerTable, Rpc, RpcConfig, SocketTransport, Window, WindowTransport};
use notebox_sandbox::CellId;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Transport a VM settled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// WebSocket to a notebox server.
    Socket,
    /// In-process sandboxed surface.
    Surface,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket => write!(f, "socket"),
            Self::Surface => write!(f, "surface"),
        }
    }
}

enum Binding {
    Socket { rpc: Rpc },
    Surface { rpc: Rpc, surface: SandboxSurface },
}

impl Binding {
    fn rpc(&self) -> &Rpc {
        match self {
            Self::Socket { rpc } | Self::Surface { rpc, .. } => rpc,
        }
    }

    fn kind(&self) -> TransportKind {
        match self {
            Self::Socket { .. } => TransportKind::Socket,
            Self::Surface { .. } => TransportKind::Surface,
        }
    }
}

/// A notebook VM.
///
/// The transport is chosen lazily on first use and never revisited: the
/// configured server if it answers within the connect timeout, otherwise a
/// [`SandboxSurface`] in this process.
pub struct Vm {
    id: Uuid,
    config: VmConfig,
    handlers: HandlerTable,
    host_window: Window,
    binding: Mutex<Option<Binding>>,
    destroyed: AtomicBool,
}

impl Vm {
    /// Create a VM that services `handlers` (usually
    /// [`rpc_handlers`](crate::rpc_handlers)) for the sandbox.
    pub fn new(config: VmConfig, handlers: HandlerTable) -> Self {
        Self::with_host_window(config, handlers, Window::new())
    }

    /// Like [`Vm::new`], with surface traffic arriving on a shared window.
    ///
    /// Several VMs may share one host window; each only accepts messages
    /// carrying its own channel id.
    pub fn with_host_window(config: VmConfig, handlers: HandlerTable, host_window: Window) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(vm = %id, "Created VM");
        Self {
            id,
            config,
            handlers,
            host_window,
            binding: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Unique VM identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Channel id used by this VM's surface.
    pub fn channel_id(&self) -> String {
        self.id.to_string()
    }

    /// True once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// The chosen transport, or `None` before the first use.
    pub async fn transport_kind(&self) -> Option<TransportKind> {
        self.binding.lock().await.as_ref().map(Binding::kind)
    }

    /// Pick and bind the transport if that has not happened yet.
    pub async fn init(&self) -> Result<TransportKind> {
        self.bound_rpc().await.map(|(kind, _)| kind)
    }

    /// Run `code` as cell `cell`. Output arrives through the handler table.
    pub async fn exec(&self, code: &str, cell: impl Into<CellId>) -> Result<Value> {
        let cell = cell.into();
        self.call("runCell", vec![Value::String(code.to_string()), cell.to_value()])
            .await
    }

    /// Call any method the sandbox services.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let (_, rpc) = self.bound_rpc().await?;
        Ok(rpc.call(method, args).await?)
    }

    /// Tear down the transport. Later calls fail with [`VmError::Destroyed`].
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let binding = self.binding.lock().await.take();
        match binding {
            Some(Binding::Socket { rpc }) => rpc.stop().await,
            Some(Binding::Surface { rpc, surface }) => {
                rpc.stop().await;
                surface.remove().await;
            }
            None => {}
        }

        tracing::info!(vm = %self.id, "VM destroyed");
    }

    async fn bound_rpc(&self) -> Result<(TransportKind, Rpc)> {
        if self.is_destroyed() {
            return Err(VmError::Destroyed);
        }

        let mut binding = self.binding.lock().await;
        if self.is_destroyed() {
            return Err(VmError::Destroyed);
        }

        if let Some(bound) = binding.as_ref() {
            return Ok((bound.kind(), bound.rpc().clone()));
        }

        let bound = self.bind().await?;
        let result = (bound.kind(), bound.rpc().clone());
        tracing::info!(vm = %self.id, transport = %result.0, "VM transport selected");
        *binding = Some(bound);
        Ok(result)
    }

    async fn bind(&self) -> Result<Binding> {
        let rpc_config = RpcConfig {
            call_timeout: self.config.call_timeout,
        };

        match &self.config.ws_url {
            Some(url) => match SocketTransport::connect(url, self.config.connect_timeout).await {
                Ok(socket) => {
                    let rpc = Rpc::with_config(Arc::new(socket), rpc_config);
                    rpc.start(self.handlers.clone())?;
                    return Ok(Binding::Socket { rpc });
                }
                Err(e) => {
                    tracing::warn!(
                        vm = %self.id,
                        %url,
                        error = %e,
                        "Server unreachable, falling back to sandboxed surface"
                    );
                }
            },
            None => tracing::debug!(vm = %self.id, "No server configured"),
        }

        let channel_id = self.channel_id();
        let surface =
            SandboxSurface::create(&self.host_window, &channel_id, self.config.sandbox.clone())
                .await?;

        let transport =
            WindowTransport::new(&self.host_window, surface.window().clone(), channel_id);
        let rpc = Rpc::with_config(Arc::new(transport), rpc_config);
        if let Err(e) = rpc.start(self.handlers.clone()) {
            surface.remove().await;
            return Err(e.into());
        }

        Ok(Binding::Surface { rpc, surface })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::tests::RecordingSink;
    use crate::output::{rpc_handlers, OutputRegistry};
    use notebox_sandbox::EventKind;
    use serde_json::json;
    use std::time::Duration;

    async fn wait_for_events(sink: &RecordingSink, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.snapshot().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sink never received expected events");
    }

    #[tokio::test]
    async fn test_no_address_uses_surface() {
        let registry = OutputRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let _sub = registry.register("cellA", sink.clone());

        let vm = Vm::new(VmConfig::default(), rpc_handlers(registry.clone()));
        assert_eq!(vm.transport_kind().await, None);

        let reply = vm.exec("1+1", "cellA").await.unwrap();
        assert_eq!(reply, Value::Null);
        assert_eq!(vm.transport_kind().await, Some(TransportKind::Surface));

        wait_for_events(&sink, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.snapshot(), vec![(EventKind::Print, json!("2"))]);

        vm.destroy().await;
    }

    #[tokio::test]
    async fn test_unreachable_address_falls_back() {
        let config = VmConfig::default()
            .with_ws_url("ws://127.0.0.1:1/")
            .with_connect_timeout(Duration::from_millis(500));
        let vm = Vm::new(config, HandlerTable::new());

        assert_eq!(vm.init().await.unwrap(), TransportKind::Surface);
        assert_eq!(vm.call("ping", vec![]).await.unwrap(), json!({"pong": true}));

        // The decision sticks.
        assert_eq!(vm.init().await.unwrap(), TransportKind::Surface);
        vm.destroy().await;
    }

    #[tokio::test]
    async fn test_cell_state_persists_across_exec() {
        let registry = OutputRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let _sub = registry.register(1i64, sink.clone());
        let vm = Vm::new(VmConfig::default(), rpc_handlers(registry.clone()));

        vm.exec("var counter = 40", 1i64).await.unwrap();
        vm.exec("counter + 2", 1i64).await.unwrap();

        wait_for_events(&sink, 1).await;
        assert_eq!(sink.snapshot(), vec![(EventKind::Print, json!("42"))]);
        vm.destroy().await;
    }

    #[tokio::test]
    async fn test_cell_error_is_reported() {
        let vm = Vm::new(VmConfig::default(), HandlerTable::new());

        let err = vm.exec("require('fs')", "c").await.unwrap_err();
        match err {
            VmError::Rpc(notebox_rpc::RpcError::Remote { message, .. }) => {
                assert_eq!(message, "Error: forbidden module: fs");
            }
            other => panic!("unexpected error: {other}"),
        }
        vm.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_final() {
        let vm = Vm::new(VmConfig::default(), HandlerTable::new());
        vm.init().await.unwrap();

        vm.destroy().await;
        vm.destroy().await;

        assert!(vm.is_destroyed());
        assert!(matches!(vm.exec("1", "c").await, Err(VmError::Destroyed)));
        assert!(matches!(vm.init().await, Err(VmError::Destroyed)));
        assert_eq!(vm.transport_kind().await, None);
    }

    #[tokio::test]
    async fn test_destroy_before_init() {
        let vm = Vm::new(VmConfig::default(), HandlerTable::new());
        vm.destroy().await;
        assert!(matches!(vm.init().await, Err(VmError::Destroyed)));
    }

    #[tokio::test]
    async fn test_shared_window_keeps_vms_apart() {
        let host_window = Window::new();
        let registry = OutputRegistry::new();
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let _a = registry.register("a", first.clone());
        let _b = registry.register("b", second.clone());

        let vm_a = Vm::with_host_window(
            VmConfig::default(),
            rpc_handlers(registry.clone()),
            host_window.clone(),
        );
        let vm_b = Vm::with_host_window(
            VmConfig::default(),
            rpc_handlers(registry.clone()),
            host_window.clone(),
        );
        assert_ne!(vm_a.channel_id(), vm_b.channel_id());

        vm_a.exec("'from a'", "a").await.unwrap();
        vm_b.exec("'from b'", "b").await.unwrap();

        wait_for_events(&first, 1).await;
        wait_for_events(&second, 1).await;
        assert_eq!(first.snapshot(), vec![(EventKind::Print, json!("from a"))]);
        assert_eq!(second.snapshot(), vec![(EventKind::Print, json!("from b"))]);

        vm_a.destroy().await;
        vm_b.destroy().await;
    }
}
