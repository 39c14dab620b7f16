//! VM over a real WebSocket, served by an in-process sandbox host.

use futures::{future, SinkExt, StreamExt};
use notebox_rpc::{Frame, Rpc, SocketTransport};
use notebox_sandbox::{SandboxHost, SandboxOptions};
use notebox_vm::{rpc_handlers, EventKind, OutputRegistry, OutputSink, TransportKind, Vm, VmConfig};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

#[derive(Default)]
struct Collect {
    events: Mutex<Vec<(EventKind, Value)>>,
}

impl OutputSink for Collect {
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

/// Accept one WebSocket client and serve a sandbox on it until it leaves.
/// Resolves `done` once the server side has observed the disconnect.
async fn serve_one(listener: TcpListener, done: oneshot::Sender<()>) {
    let (stream, _) = listener.accept().await.unwrap();
    let socket = tokio_tungstenite::accept_async(stream).await.unwrap();

    let (sink, stream) = socket.split();
    let stream = stream.map(|frame| frame.map(Frame::from));
    let sink = sink.with(|text: String| {
        future::ready(Ok::<_, tungstenite::Error>(WsMessage::Text(text)))
    });

    let rpc = Rpc::new(Arc::new(SocketTransport::from_frames(stream, sink)));
    let host = SandboxHost::spawn(SandboxOptions::default(), rpc.clone())
        .await
        .unwrap();
    rpc.start(host.handlers()).unwrap();

    rpc.closed().await;
    rpc.stop().await;
    host.shutdown().await;
    let _ = done.send(());
}

#[tokio::test]
async fn test_vm_prefers_reachable_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = oneshot::channel();
    tokio::spawn(serve_one(listener, done_tx));

    let registry = OutputRegistry::new();
    let sink = Arc::new(Collect::default());
    let _sub = registry.register("cellA", sink.clone());

    let config = VmConfig::default()
        .with_ws_url(format!("ws://{addr}/"))
        .with_connect_timeout(Duration::from_secs(5));
    let vm = Vm::new(config, rpc_handlers(registry.clone()));

    assert_eq!(vm.init().await.unwrap(), TransportKind::Socket);
    assert_eq!(vm.exec("1+1", "cellA").await.unwrap(), Value::Null);

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.events.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*sink.events.lock(), vec![(EventKind::Print, json!("2"))]);

    vm.destroy().await;
    tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("server never saw the disconnect")
        .unwrap();
}

#[tokio::test]
async fn test_no_output_after_destroy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, _done_rx) = oneshot::channel();
    tokio::spawn(serve_one(listener, done_tx));

    let registry = OutputRegistry::new();
    let sink = Arc::new(Collect::default());
    let _sub = registry.register("loop", sink.clone());

    let vm = Arc::new(Vm::new(
        VmConfig::default().with_ws_url(format!("ws://{addr}/")),
        rpc_handlers(registry.clone()),
    ));
    vm.init().await.unwrap();

    let running = {
        let vm = Arc::clone(&vm);
        tokio::spawn(async move {
            vm.exec("for (let i = 0; i < 1e9; i++) { if (i % 100000 === 0) print(i); }", "loop")
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.events.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    vm.destroy().await;
    assert!(running.await.unwrap().is_err());

    let seen = sink.events.lock().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.events.lock().len(), seen);
}
