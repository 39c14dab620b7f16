//! HTTP/WebSocket endpoint.
//!
//! ## Endpoints
//!
//! - `GET /` - WebSocket upgrade for notebook clients, server info otherwise
//! - `GET /health` - Health check with the live connection count

use crate::supervisor::Supervisor;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{Html, IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};
use notebox_rpc::{Frame, SocketTransport};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the HTTP router.
pub fn build_router(supervisor: Supervisor) -> Router {
    tracing::debug!("Building HTTP router");

    Router::new()
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(supervisor)
}

/// Health check endpoint.
async fn health_handler(State(supervisor): State<Supervisor>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "notebox-server",
        "connections": supervisor.active_connections(),
    }))
}

/// Root endpoint: WebSocket upgrade or server info.
async fn root_handler(
    State(supervisor): State<Supervisor>,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    match upgrade {
        Some(upgrade) => upgrade.on_upgrade(move |socket| handle_socket(supervisor, socket)),
        None => {
            tracing::trace!("Root page request");
            Html(INFO_PAGE).into_response()
        }
    }
}

async fn handle_socket(supervisor: Supervisor, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let stream = stream.map(|message| message.map(frame_from_axum));
    let sink = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(WsMessage::Text(text))));

    let client = SocketTransport::from_frames(stream, sink);
    match supervisor.serve_client(client).await {
        Ok(reason) => tracing::debug!(%reason, "Client session ended"),
        Err(e) => tracing::warn!(error = %e, "Client session failed"),
    }
}

fn frame_from_axum(message: WsMessage) -> Frame {
    match message {
        WsMessage::Text(text) => Frame::Text(text),
        WsMessage::Binary(data) => Frame::Binary(data),
        WsMessage::Close(_) => Frame::Close,
        WsMessage::Ping(_) | WsMessage::Pong(_) => Frame::Control,
    }
}

/// Start the HTTP server on `addr`.
///
/// Runs until `shutdown` completes.
pub async fn serve(
    supervisor: Supervisor,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    tracing::info!(%addr, "Starting HTTP/WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    serve_on(listener, supervisor, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    supervisor: Supervisor,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    axum::serve(listener, build_router(supervisor))
        .with_graceful_shutdown(shutdown)
        .await
}

const INFO_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>notebox server</title>
    <style>
        body { font-family: system-ui; max-width: 800px; margin: 50px auto; padding: 20px; }
        code { background: #f4f4f4; padding: 2px 6px; border-radius: 3px; }
    </style>
</head>
<body>
    <h1>notebox server</h1>
    <p>Runs notebook cells in isolated worker processes.</p>

    <h2>Endpoints</h2>
    <ul>
        <li><code>GET /</code> (WebSocket upgrade) - one sandbox per connection</li>
        <li><code>GET /health</code> - Health check</li>
    </ul>

    <h2>Calls</h2>
    <ul>
        <li><code>runCell(code, cellId)</code> - run a cell; output arrives as
            <code>print</code>, <code>plot</code> and <code>downloadProgress</code> calls</li>
        <li><code>ping()</code> - liveness check</li>
    </ul>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerCommand;

    #[tokio::test]
    async fn test_build_router() {
        let supervisor = Supervisor::new(WorkerCommand::parse("true").unwrap());
        let _router = build_router(supervisor);
        // Router builds without panic
    }

    #[test]
    fn test_frame_mapping() {
        assert_eq!(frame_from_axum(WsMessage::Text("x".into())), Frame::Text("x".into()));
        assert_eq!(frame_from_axum(WsMessage::Binary(vec![1])), Frame::Binary(vec![1]));
        assert_eq!(frame_from_axum(WsMessage::Close(None)), Frame::Close);
    }
}
