//! Sandbox host: runs cells on a dedicated engine thread and reports their
//! output to the peer through the bound [`Rpc`].

use crate::cell::{CellId, OutputEvent};
use crate::config::SandboxOptions;
use crate::context::{InterruptHandle, SandboxContext};
use crate::error::{Result, SandboxError};
use notebox_rpc::{arg, HandlerError, HandlerTable, Rpc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

/// Events buffered between the engine thread and the forwarder. A full
/// queue blocks the engine thread.
const EVENT_QUEUE: usize = 256;

/// Output calls the peer has not acknowledged yet. Once reached, forwarding
/// waits for acknowledgements.
pub(crate) const MAX_UNACKED_OUTPUT: usize = 256;

struct CellRequest {
    cell: CellId,
    code: String,
    reply: oneshot::Sender<Result<()>>,
}

enum Command {
    Run(CellRequest),
    Shutdown,
}

/// Events leaving the engine thread, in the order they happened.
///
/// A cell's output events and its completion travel on the same channel so
/// every output call is queued before the cell's reply.
enum HostEvent {
    Output(OutputEvent),
    Finished {
        reply: oneshot::Sender<Result<()>>,
        result: Result<()>,
    },
}

/// Owns one [`SandboxContext`] and exposes it as a handler table.
pub struct SandboxHost {
    commands: mpsc::UnboundedSender<Command>,
    interrupt: InterruptHandle,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxHost {
    /// Boot the engine thread. Output events are sent to the peer of `rpc`
    /// as `print`/`plot`/`downloadProgress` calls.
    pub async fn spawn(options: SandboxOptions, rpc: Rpc) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name("notebox-sandbox".into())
            .spawn(move || run_engine(options, command_rx, event_tx, ready_tx))?;

        let interrupt = match ready_rx.await {
            Ok(ready) => ready?,
            Err(_) => {
                return Err(SandboxError::Engine(
                    "sandbox thread exited during startup".into(),
                ))
            }
        };

        let forwarder = tokio::spawn(forward_events(rpc, event_rx));

        tracing::info!("Sandbox host ready");

        Ok(Self {
            commands: command_tx,
            interrupt,
            thread: Mutex::new(Some(thread)),
            forwarder: Mutex::new(Some(forwarder)),
        })
    }

    /// Handlers this host services: `runCell` and `ping`.
    pub fn handlers(&self) -> HandlerTable {
        let commands = self.commands.clone();
        HandlerTable::new()
            .register("runCell", move |args| run_cell(commands.clone(), args))
            .register("ping", ping)
    }

    /// Run one cell and wait for it to finish.
    pub async fn run_cell(&self, cell: CellId, code: String) -> Result<()> {
        submit(&self.commands, cell, code).await
    }

    /// Interrupt any running cell, stop the engine thread and wait for it.
    pub async fn shutdown(&self) {
        self.interrupt.halt();
        let _ = self.commands.send(Command::Shutdown);

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::warn!("Sandbox thread did not exit cleanly");
            }
        }

        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        tracing::debug!("Sandbox host shut down");
    }
}

impl Drop for SandboxHost {
    fn drop(&mut self) {
        self.interrupt.halt();
        let _ = self.commands.send(Command::Shutdown);
    }
}

fn run_engine(
    options: SandboxOptions,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<HostEvent>,
    ready: oneshot::Sender<Result<InterruptHandle>>,
) {
    let output = events.clone();
    let context = match SandboxContext::new(options, move |event| {
        let _ = output.blocking_send(HostEvent::Output(event));
    }) {
        Ok(context) => context,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create sandbox context");
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(context.interrupt_handle()));

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Run(request) => {
                let result = context.run_cell(&request.cell, &request.code);
                let _ = events.blocking_send(HostEvent::Finished {
                    reply: request.reply,
                    result,
                });
            }
            Command::Shutdown => break,
        }
    }

    tracing::debug!("Sandbox thread exiting");
}

async fn forward_events(rpc: Rpc, mut events: mpsc::Receiver<HostEvent>) {
    let unacked = Arc::new(Semaphore::new(MAX_UNACKED_OUTPUT));

    while let Some(event) = events.recv().await {
        match event {
            HostEvent::Output(output) => {
                let Ok(permit) = Arc::clone(&unacked).acquire_owned().await else {
                    break;
                };
                let method = output.kind.method();
                match rpc.begin_call(method, vec![output.cell.to_value(), output.data]) {
                    Ok(pending) => {
                        tokio::spawn(async move {
                            let _permit = permit;
                            if let Err(e) = pending.wait().await {
                                tracing::debug!(method, error = %e, "Output event not acknowledged");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!(method, cell = %output.cell, error = %e, "Dropping output event");
                    }
                }
            }
            HostEvent::Finished { reply, result } => {
                let _ = reply.send(result);
            }
        }
    }
}

async fn submit(commands: &mpsc::UnboundedSender<Command>, cell: CellId, code: String) -> Result<()> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(Command::Run(CellRequest { cell, code, reply }))
        .map_err(|_| SandboxError::ShutDown)?;
    rx.await.map_err(|_| SandboxError::ShutDown)?
}

async fn run_cell(
    commands: mpsc::UnboundedSender<Command>,
    args: Vec<Value>,
) -> std::result::Result<Value, HandlerError> {
    let code: String = arg(&args, 0)?;
    let cell: CellId = arg(&args, 1)?;
    submit(&commands, cell, code)
        .await
        .map_err(HandlerError::failed)?;
    Ok(Value::Null)
}

async fn ping(_args: Vec<Value>) -> std::result::Result<Value, HandlerError> {
    Ok(json!({ "pong": true }))
}
