//! Routing of cell output events to UI sinks.
//!
//! The sandbox reports output as `print`, `plot` and `downloadProgress`
//! calls carrying `[cellId, data]`. [`rpc_handlers`] turns a [`CellLookup`]
//! into the handler table that services those calls. Events for a cell with
//! no registered sink are dropped.

use notebox_rpc::{arg, HandlerError, HandlerTable};
use notebox_sandbox::{CellId, EventKind};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Receiver of one cell's output.
pub trait OutputSink: Send + Sync {
    /// Text printed by the cell.
    fn print(&self, data: &Value);
    /// Plot data emitted by the cell.
    fn plot(&self, data: &Value);
    /// `{url, loaded, total}` while a download streams.
    fn download_progress(&self, data: &Value);
}

/// Resolves the sink that currently owns a cell.
pub trait CellLookup: Send + Sync + 'static {
    /// Sink registered for `cell`, if any.
    fn sink_for(&self, cell: &CellId) -> Option<Arc<dyn OutputSink>>;
}

type SinkMap = HashMap<CellId, Arc<dyn OutputSink>>;

/// Caller-owned map from cell id to sink.
#[derive(Clone, Default)]
pub struct OutputRegistry {
    sinks: Arc<RwLock<SinkMap>>,
}

impl OutputRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route output for `cell` to `sink` until the returned subscription is
    /// dropped. Registering again for the same cell replaces the sink.
    pub fn register(&self, cell: impl Into<CellId>, sink: Arc<dyn OutputSink>) -> Subscription {
        let cell = cell.into();
        let previous = self.sinks.write().insert(cell.clone(), Arc::clone(&sink));
        if previous.is_some() {
            tracing::debug!(%cell, "Replaced output sink");
        }

        Subscription {
            sinks: Arc::downgrade(&self.sinks),
            cell,
            sink,
            active: true,
        }
    }

    /// Number of cells with a live sink.
    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    /// True if no cell has a sink.
    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }
}

impl CellLookup for OutputRegistry {
    fn sink_for(&self, cell: &CellId) -> Option<Arc<dyn OutputSink>> {
        self.sinks.read().get(cell).cloned()
    }
}

/// Registration handle returned by [`OutputRegistry::register`].
///
/// Unregisters on drop. A subscription that was replaced by a later
/// registration for the same cell leaves the newer sink in place.
pub struct Subscription {
    sinks: Weak<RwLock<SinkMap>>,
    cell: CellId,
    sink: Arc<dyn OutputSink>,
    active: bool,
}

impl Subscription {
    /// The cell this subscription routes.
    pub fn cell(&self) -> &CellId {
        &self.cell
    }

    /// Unregister now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.active, false) {
            return;
        }
        let Some(sinks) = self.sinks.upgrade() else {
            return;
        };

        let mut sinks = sinks.write();
        let owned = sinks
            .get(&self.cell)
            .is_some_and(|current| same_sink(current, &self.sink));
        if owned {
            sinks.remove(&self.cell);
            tracing::debug!(cell = %self.cell, "Unregistered output sink");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

fn same_sink(a: &Arc<dyn OutputSink>, b: &Arc<dyn OutputSink>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Handler table for the UI side of a VM: `print`, `plot` and
/// `downloadProgress`, each routed through `lookup` by cell id.
pub fn rpc_handlers<L: CellLookup>(lookup: L) -> HandlerTable {
    let lookup: Arc<dyn CellLookup> = Arc::new(lookup);

    [EventKind::Print, EventKind::Plot, EventKind::DownloadProgress]
        .into_iter()
        .fold(HandlerTable::new(), |table, kind| {
            let lookup = Arc::clone(&lookup);
            table.register(kind.method(), move |args| {
                route_event(Arc::clone(&lookup), kind, args)
            })
        })
}

async fn route_event(
    lookup: Arc<dyn CellLookup>,
    kind: EventKind,
    args: Vec<Value>,
) -> Result<Value, HandlerError> {
    let cell: CellId = arg(&args, 0)?;
    let data = args.get(1).cloned().unwrap_or(Value::Null);

    match lookup.sink_for(&cell) {
        Some(sink) => match kind {
            EventKind::Print => sink.print(&data),
            EventKind::Plot => sink.plot(&data),
            EventKind::DownloadProgress => sink.download_progress(&data),
        },
        None => tracing::debug!(%cell, method = kind.method(), "No sink for cell, dropping output"),
    }

    Ok(Value::Null)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Sink that records every event it receives.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) events: Mutex<Vec<(EventKind, Value)>>,
    }

    impl RecordingSink {
        pub(crate) fn snapshot(&self) -> Vec<(EventKind, Value)> {
            self.events.lock().clone()
        }
    }

    impl OutputSink for RecordingSink {
        fn print(&self, data: &Value) {
            self.events.lock().push((EventKind::Print, data.clone()));
        }

        fn plot(&self, data: &Value) {
            self.events.lock().push((EventKind::Plot, data.clone()));
        }

        fn download_progress(&self, data: &Value) {
            self.events
                .lock()
                .push((EventKind::DownloadProgress, data.clone()));
        }
    }

    async fn invoke(table: &HandlerTable, method: &str, args: Vec<Value>) -> Value {
        let handler = table.get(method).expect("handler registered");
        handler(args).await.unwrap()
    }

    #[test]
    fn test_handler_table_methods() {
        let table = rpc_handlers(OutputRegistry::new());
        assert_eq!(table.methods(), vec!["downloadProgress", "plot", "print"]);
    }

    #[tokio::test]
    async fn test_routes_by_cell() {
        let registry = OutputRegistry::new();
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        let _sub_a = registry.register("a", a.clone());
        let _sub_b = registry.register(7i64, b.clone());

        let table = rpc_handlers(registry.clone());
        invoke(&table, "print", vec![json!("a"), json!("hello")]).await;
        invoke(&table, "plot", vec![json!(7), json!({"x": [1, 2]})]).await;
        invoke(&table, "downloadProgress", vec![json!("a"), json!(0.5)]).await;

        assert_eq!(
            a.snapshot(),
            vec![
                (EventKind::Print, json!("hello")),
                (EventKind::DownloadProgress, json!(0.5)),
            ]
        );
        assert_eq!(b.snapshot(), vec![(EventKind::Plot, json!({"x": [1, 2]}))]);
    }

    #[tokio::test]
    async fn test_unknown_cell_is_dropped() {
        let registry = OutputRegistry::new();
        let table = rpc_handlers(registry);
        let reply = invoke(&table, "print", vec![json!("ghost"), json!("x")]).await;
        assert_eq!(reply, Value::Null);
    }

    #[tokio::test]
    async fn test_missing_cell_argument_is_invalid() {
        let table = rpc_handlers(OutputRegistry::new());
        let handler = table.get("print").unwrap();
        let err = handler(vec![]).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParams(_)));
    }

    #[test]
    fn test_subscription_drop_unregisters() {
        let registry = OutputRegistry::new();
        let sub = registry.register("a", Arc::new(RecordingSink::default()));
        assert_eq!(registry.len(), 1);
        assert_eq!(sub.cell(), &CellId::from("a"));

        drop(sub);
        assert!(registry.is_empty());
        assert!(registry.sink_for(&CellId::from("a")).is_none());
    }

    #[test]
    fn test_unsubscribe_keeps_newer_sink() {
        let registry = OutputRegistry::new();
        let old = registry.register("a", Arc::new(RecordingSink::default()));
        let newer = Arc::new(RecordingSink::default());
        let _current = registry.register("a", newer.clone());

        old.unsubscribe();

        let sink = registry.sink_for(&CellId::from("a")).unwrap();
        sink.print(&json!("still here"));
        assert_eq!(newer.snapshot(), vec![(EventKind::Print, json!("still here"))]);
    }

    #[test]
    fn test_subscription_outlives_registry() {
        let registry = OutputRegistry::new();
        let sub = registry.register("a", Arc::new(RecordingSink::default()));
        drop(registry);
        drop(sub);
    }
}
