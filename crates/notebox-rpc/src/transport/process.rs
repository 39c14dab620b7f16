//! Process-channel transport.
//!
//! Messages travel as newline-delimited JSON. The supervising side owns the
//! child process and watches for its exit; the worker side wraps its own
//! stdin/stdout.

use super::{Inbox, Outbox, Transport};
use crate::error::TransportError;
use crate::message::Message;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

/// Maximum accepted line length (16 MB).
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// How long to keep reading a child's stdout after it exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport over a pair of pipes, optionally bound to a child process.
pub struct ProcessTransport {
    inbox: Inbox,
    outbox: Outbox,
    child: Option<ChildControl>,
}

/// Lifecycle control for a supervised child.
struct ChildControl {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessTransport {
    /// Spawn `command` as a child process and wrap its stdin/stdout.
    ///
    /// stderr is inherited so the child's logs reach the parent's stderr.
    /// When the child exits, the inbound stream ends.
    pub fn spawn(mut command: Command) -> Result<Self, TransportError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connect("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Connect("child stdout unavailable".into()))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_lines(stdout, inbound_tx.clone()));
        let writer = tokio::spawn(write_lines(stdin, outbound_rx));

        let exited = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_child(
            child,
            kill_rx,
            reader,
            Arc::clone(&exited),
            inbound_tx,
        ));

        tracing::debug!(pid = ?pid, "Spawned child process");

        Ok(Self {
            inbox: Inbox::new(inbound_rx),
            outbox: Outbox::new(outbound_tx, writer),
            child: Some(ChildControl {
                pid,
                exited,
                kill_tx: Mutex::new(Some(kill_tx)),
                watcher: Mutex::new(Some(watcher)),
            }),
        })
    }

    /// Wrap the current process's stdin/stdout (worker side).
    pub fn from_stdio() -> Self {
        Self::from_pipes(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Wrap an arbitrary reader/writer pair.
    pub fn from_pipes<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_lines(reader, inbound_tx));
        let writer = tokio::spawn(write_lines(writer, outbound_rx));

        Self {
            inbox: Inbox::new(inbound_rx),
            outbox: Outbox::new(outbound_tx, writer),
            child: None,
        }
    }

    /// OS process id of the child, if this transport owns one.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.pid)
    }

    /// True once the child has exited and been reaped.
    pub fn has_exited(&self) -> bool {
        self.child
            .as_ref()
            .is_some_and(|c| c.exited.load(Ordering::SeqCst))
    }

    /// Forcibly terminate the child and wait until it is reaped.
    ///
    /// No-op when there is no child or it already exited.
    pub async fn kill(&self) {
        let Some(child) = &self.child else {
            return;
        };
        if let Some(kill_tx) = child.kill_tx.lock().take() {
            let _ = kill_tx.send(());
        }
        let watcher = child.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        self.outbox.send(message)
    }

    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbox.take()
    }

    async fn close(&self) {
        self.outbox.shutdown(self.name()).await;
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Some(child) = &mut self.child {
            if let Some(kill_tx) = child.kill_tx.get_mut().take() {
                let _ = kill_tx.send(());
            }
        }
    }
}

/// Decode newline-delimited messages until EOF.
async fn read_lines<R>(reader: R, inbound: mpsc::UnboundedSender<Message>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!(max = MAX_LINE_LENGTH, "Dropping oversized line");
                continue;
            }
            Err(LinesCodecError::Io(e)) => {
                tracing::warn!(error = %e, "Process channel read failed");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match Message::decode(trimmed) {
            Ok(message) => {
                tracing::trace!(kind = message.kind(), id = %message.id(), "Received message");
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed message");
            }
        }
    }

    tracing::debug!("Process channel reached EOF");
}

/// Encode queued messages as lines until the queue closes.
async fn write_lines<W>(writer: W, mut outbound: mpsc::UnboundedReceiver<Message>)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());

    while let Some(message) = outbound.recv().await {
        let line = match message.encode() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode message");
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            tracing::warn!(error = %e, "Process channel write failed");
            break;
        }
    }

    let _ = SinkExt::<String>::close(&mut sink).await;
}

/// Wait for the child to exit (or kill it on request), then end the inbound stream.
///
/// After a natural exit the reader keeps running until it reaches EOF, so
/// lines written just before exiting are still delivered.
async fn watch_child(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    mut reader: JoinHandle<()>,
    exited: Arc<AtomicBool>,
    inbound: mpsc::UnboundedSender<Message>,
) {
    let pid = child.id();
    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill_rx => {
            tracing::debug!(pid = ?pid, "Killing child process");
            if let Err(e) = child.start_kill() {
                tracing::warn!(pid = ?pid, error = %e, "Failed to signal child process");
            }
            (child.wait().await, true)
        }
    };

    match status {
        Ok(status) => tracing::info!(pid = ?pid, %status, "Child process exited"),
        Err(e) => tracing::warn!(pid = ?pid, error = %e, "Failed to wait for child process"),
    }

    exited.store(true, Ordering::SeqCst);
    if killed {
        reader.abort();
    } else if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
        // A descendant may still hold stdout open.
        tracing::warn!(pid = ?pid, "Child output not drained, discarding the rest");
        reader.abort();
    }
    drop(inbound);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_pipes_decode_and_drop_malformed() {
        let (mut peer, local) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(local);
        let transport = ProcessTransport::from_pipes(read_half, write_half);
        let mut incoming = transport.incoming().unwrap();
        assert!(transport.incoming().is_none());

        peer.write_all(b"not json\n\n{\"kind\":\"call\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, Message::call(1, "ping", vec![]));
    }

    #[tokio::test]
    async fn test_pipes_encode_lines() {
        let (peer, local) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(local);
        let transport = ProcessTransport::from_pipes(read_half, write_half);

        transport.send(Message::response(4, json!("ok"))).unwrap();
        transport.close().await;

        let mut lines = BufReader::new(peer).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(Message::decode(&line).unwrap(), Message::response(4, json!("ok")));
        assert!(transport.send(Message::response(5, json!(null))).is_err());
    }

    #[tokio::test]
    async fn test_child_exit_ends_incoming() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 0");
        let transport = ProcessTransport::spawn(command).unwrap();
        assert!(transport.pid().is_some());
        let mut incoming = transport.incoming().unwrap();

        let end = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
            .await
            .unwrap();
        assert!(end.is_none());
        assert!(transport.has_exited());
    }

    #[tokio::test]
    async fn test_output_written_before_exit_is_delivered() {
        let script = r#"i=0
while [ $i -lt 3000 ]; do
  echo "{\"kind\":\"response\",\"id\":$i,\"payload\":null}"
  i=$((i+1))
done
exit 0"#;

        for _ in 0..5 {
            let mut command = Command::new("sh");
            command.arg("-c").arg(script);
            let transport = ProcessTransport::spawn(command).unwrap();
            let mut incoming = transport.incoming().unwrap();

            let mut received = 0u64;
            let drained = tokio::time::timeout(Duration::from_secs(20), async {
                while let Some(message) = incoming.recv().await {
                    assert_eq!(message, Message::response(received, json!(null)));
                    received += 1;
                }
            })
            .await;

            assert!(drained.is_ok());
            assert_eq!(received, 3000);
            assert!(transport.has_exited());
        }
    }

    #[tokio::test]
    async fn test_kill_reaps_child() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let transport = ProcessTransport::spawn(command).unwrap();
        let mut incoming = transport.incoming().unwrap();

        transport.kill().await;
        assert!(transport.has_exited());
        assert!(incoming.recv().await.is_none());

        // Second kill is a no-op.
        transport.kill().await;
    }

    #[tokio::test]
    async fn test_child_roundtrip_through_cat() {
        let transport = ProcessTransport::spawn(Command::new("cat")).unwrap();
        let mut incoming = transport.incoming().unwrap();

        transport
            .send(Message::call(9, "echo", vec![json!({"a": 1})]))
            .unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, Message::call(9, "echo", vec![json!({"a": 1})]));

        transport.kill().await;
    }
}
