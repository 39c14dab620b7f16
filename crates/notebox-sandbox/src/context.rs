//! The restricted JavaScript environment cells run in.
//!
//! One context is created per worker (or per sandboxed surface). Cells run
//! one after another and share top-level bindings. The engine has no
//! filesystem or OS bindings; the only capabilities are the globals
//! installed by the prelude and the allow-listed modules behind `require`.

use crate::cell::{CellId, EventKind, OutputEvent};
use crate::config::SandboxOptions;
use crate::error::{Result, SandboxError};
use crate::modules::{self, HttpLimits};
use parking_lot::Mutex;
use rquickjs::{CatchResultExt, CaughtError, Context, Ctx, Function, Runtime, Value};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const PRELUDE: &str = include_str!("prelude.js");

/// Global the prelude leaves behind for formatting completion values.
const FORMAT_FN: &str = "__notebox_format";

type CurrentCell = Rc<RefCell<Option<CellId>>>;
type Emitter = Rc<dyn Fn(OutputEvent)>;

#[derive(Default)]
struct Watchdog {
    deadline: Mutex<Option<Instant>>,
    halted: AtomicBool,
    tripped: AtomicBool,
}

impl Watchdog {
    fn should_interrupt(&self) -> bool {
        let expired = self.halted.load(Ordering::SeqCst)
            || self
                .deadline
                .lock()
                .is_some_and(|deadline| Instant::now() >= deadline);
        if expired {
            self.tripped.store(true, Ordering::SeqCst);
        }
        expired
    }

    fn arm(&self, limit: Option<Duration>) {
        *self.deadline.lock() = limit.map(|limit| Instant::now() + limit);
        self.tripped.store(false, Ordering::SeqCst);
    }

    /// Clear the deadline; returns whether the engine was interrupted.
    fn disarm(&self) -> bool {
        *self.deadline.lock() = None;
        self.tripped.swap(false, Ordering::SeqCst)
    }
}

/// Handle for aborting a running cell from another thread.
#[derive(Clone)]
pub struct InterruptHandle(Arc<Watchdog>);

impl InterruptHandle {
    /// Interrupt the running cell and every later one.
    pub fn halt(&self) {
        self.0.halted.store(true, Ordering::SeqCst);
    }

    /// True once [`halt`](Self::halt) has been called.
    pub fn is_halted(&self) -> bool {
        self.0.halted.load(Ordering::SeqCst)
    }
}

/// A sandboxed JavaScript global environment.
///
/// Not `Send`: the context stays on the thread that created it.
pub struct SandboxContext {
    runtime: Runtime,
    context: Context,
    current_cell: CurrentCell,
    watchdog: Arc<Watchdog>,
    emitter: Emitter,
    options: SandboxOptions,
}

impl SandboxContext {
    /// Create a context whose output events are handed to `emitter` in
    /// emission order.
    pub fn new(options: SandboxOptions, emitter: impl Fn(OutputEvent) + 'static) -> Result<Self> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;

        let watchdog = Arc::new(Watchdog::default());
        let interrupt = Arc::clone(&watchdog);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.should_interrupt())));

        let emitter: Emitter = Rc::new(emitter);
        let current_cell: CurrentCell = Rc::new(RefCell::new(None));

        context.with(|ctx| {
            install(
                &ctx,
                &options,
                Rc::clone(&current_cell),
                Rc::clone(&emitter),
            )
        })?;

        tracing::debug!(time_limit = ?options.cell_time_limit, "Sandbox context created");

        Ok(Self {
            runtime,
            context,
            current_cell,
            watchdog,
            emitter,
            options,
        })
    }

    /// Handle that can interrupt this context from another thread.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(Arc::clone(&self.watchdog))
    }

    /// Evaluate `code` as cell `cell`.
    ///
    /// A completion value other than `undefined` is emitted as a `print`
    /// event. A thrown exception becomes [`SandboxError::Exception`].
    pub fn run_cell(&self, cell: &CellId, code: &str) -> Result<()> {
        tracing::debug!(cell = %cell, len = code.len(), "Running cell");

        *self.current_cell.borrow_mut() = Some(cell.clone());
        self.watchdog.arm(self.options.cell_time_limit);

        let result = self.context.with(|ctx| self.evaluate(&ctx, cell, code));
        self.drain_jobs(cell);

        let interrupted = self.watchdog.disarm();
        *self.current_cell.borrow_mut() = None;

        match result {
            Err(_) if interrupted => {
                tracing::warn!(cell = %cell, "Cell interrupted");
                Err(SandboxError::Interrupted)
            }
            other => other,
        }
    }

    fn evaluate<'js>(&self, ctx: &Ctx<'js>, cell: &CellId, code: &str) -> Result<()> {
        let value: Value<'js> = match ctx.eval::<Value, _>(code).catch(ctx) {
            Ok(value) => value,
            Err(error) => return Err(describe(ctx, error)),
        };

        if !value.is_undefined() {
            let format: Function = ctx.globals().get(FORMAT_FN)?;
            let text: String = format.call((value,))?;
            (self.emitter)(OutputEvent::print(cell.clone(), text));
        }
        Ok(())
    }

    fn drain_jobs(&self, cell: &CellId) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => tracing::warn!(cell = %cell, "Pending job threw"),
            }
        }
    }
}

fn describe<'js>(ctx: &Ctx<'js>, error: CaughtError<'js>) -> SandboxError {
    match error {
        CaughtError::Exception(exception) => {
            let name: String = exception
                .get("name")
                .unwrap_or_else(|_| "Error".to_string());
            let message = exception.message().unwrap_or_default();
            SandboxError::Exception(format!("{name}: {message}"))
        }
        CaughtError::Value(value) => {
            let text = ctx
                .globals()
                .get::<_, Function>(FORMAT_FN)
                .and_then(|format| format.call::<_, String>((value,)))
                .unwrap_or_else(|_| "exception".to_string());
            SandboxError::Exception(format!("Uncaught {text}"))
        }
        CaughtError::Error(e) => SandboxError::Engine(e.to_string()),
    }
}

/// Register the native bindings and run the prelude, which captures them
/// and removes them from the global object.
fn install<'js>(
    ctx: &Ctx<'js>,
    options: &SandboxOptions,
    current_cell: CurrentCell,
    emitter: Emitter,
) -> Result<()> {
    let globals = ctx.globals();

    let emit_cell = Rc::clone(&current_cell);
    let emit_to = Rc::clone(&emitter);
    globals.set(
        "__notebox_emit",
        Function::new(ctx.clone(), move |kind: String, data: String| {
            emit_event(&emit_cell, &*emit_to, &kind, &data)
        })?,
    )?;

    globals.set(
        "__notebox_check_module",
        Function::new(ctx.clone(), |name: String| match modules::check_module(&name) {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        })?,
    )?;

    globals.set(
        "__notebox_ip_version",
        Function::new(ctx.clone(), |input: String| modules::ip_version(&input))?,
    )?;

    globals.set(
        "__notebox_dns_lookup",
        Function::new(ctx.clone(), |host: String| {
            modules::reply(modules::dns_lookup(&host))
        })?,
    )?;

    let limits = HttpLimits {
        max_bytes: options.max_download_bytes,
        timeout: options.http_timeout,
    };
    globals.set(
        "__notebox_http_get",
        Function::new(ctx.clone(), move |scheme: String, url: String| {
            let result = modules::http_get(&scheme, &url, limits, |progress| {
                let cell = current_cell.borrow().clone();
                if let Some(cell) = cell {
                    emitter(OutputEvent::new(
                        EventKind::DownloadProgress,
                        cell,
                        json!({
                            "url": url,
                            "loaded": progress.loaded,
                            "total": progress.total,
                        }),
                    ));
                }
            })
            .map(|response| json!({ "status": response.status, "body": response.body }));
            modules::reply(result)
        })?,
    )?;

    let process = modules::process_info().to_string();
    globals.set(
        "__notebox_process",
        Function::new(ctx.clone(), move || process.clone())?,
    )?;

    ctx.eval::<(), _>(PRELUDE)
        .catch(ctx)
        .map_err(|e| SandboxError::Engine(format!("prelude failed: {e}")))?;
    Ok(())
}

fn emit_event(current_cell: &RefCell<Option<CellId>>, emitter: &dyn Fn(OutputEvent), kind: &str, data: &str) {
    let Some(kind) = EventKind::from_method(kind) else {
        tracing::warn!(kind, "Unknown output event");
        return;
    };
    let Some(cell) = current_cell.borrow().clone() else {
        tracing::debug!(kind = kind.method(), "Output outside of a cell dropped");
        return;
    };
    let data = serde_json::from_str(data).unwrap_or(serde_json::Value::Null);
    emitter(OutputEvent::new(kind, cell, data));
}
