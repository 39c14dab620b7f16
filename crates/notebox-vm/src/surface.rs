//! Sandboxed surface: the in-process fallback when no server is reachable.
//!
//! A surface is described by a small HTML document that carries its channel
//! id in a `<meta>` tag and loads one fixed script under a restrictive
//! `sandbox` policy. The host booted for the surface reads its channel id
//! back from that document, so both sides agree on it, and talks to the VM
//! over a pair of [`Window`]s.

use crate::error::{Result, VmError};
use notebox_rpc::{Rpc, Window, WindowTransport};
use notebox_sandbox::{SandboxHost, SandboxOptions};
use std::sync::Arc;

/// `sandbox` attribute applied to the surface frame.
pub const SANDBOX_POLICY: &str = "allow-scripts";

/// The only script the surface document loads.
pub const SANDBOX_SCRIPT: &str = "/sandbox.js";

/// Name of the `<meta>` tag holding the channel id.
pub const CHANNEL_META: &str = "rpc-channel-id";

/// Render the surface document for `channel_id`.
pub fn render_document(channel_id: &str, base_href: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="{CHANNEL_META}" content="{channel}">
<base href="{base}">
<script src="{SANDBOX_SCRIPT}"></script>
</head>
<body></body>
</html>"#,
        channel = escape_attr(channel_id),
        base = escape_attr(base_href),
    )
}

/// Wrap a surface document in a sandboxed frame.
pub fn render_frame(document: &str) -> String {
    format!(
        r#"<iframe sandbox="{SANDBOX_POLICY}" srcdoc="{}"></iframe>"#,
        escape_attr(document)
    )
}

/// Read the channel id back out of a surface document.
pub fn channel_id_from_document(document: &str) -> Option<String> {
    let marker = format!(r#"<meta name="{CHANNEL_META}" content=""#);
    let start = document.find(&marker)? + marker.len();
    let len = document[start..].find('"')?;
    Some(unescape_attr(&document[start..start + len]))
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_attr(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// An in-process sandbox host reachable through a window pair.
pub struct SandboxSurface {
    document: String,
    channel_id: String,
    window: Window,
    rpc: Rpc,
    host: SandboxHost,
}

impl SandboxSurface {
    /// Render the document, boot a host and bind it to `host_window`.
    ///
    /// The returned surface listens on its own window; the VM side binds a
    /// [`WindowTransport`] from `host_window` to [`Self::window`].
    pub async fn create(
        host_window: &Window,
        channel_id: &str,
        options: SandboxOptions,
    ) -> Result<Self> {
        let document = render_document(channel_id, "/");
        let channel_id = channel_id_from_document(&document)
            .ok_or_else(|| VmError::Surface("channel id missing from surface document".into()))?;

        let window = Window::new();
        let transport = WindowTransport::new(&window, host_window.clone(), channel_id.clone());
        let rpc = Rpc::new(Arc::new(transport));

        let host = SandboxHost::spawn(options, rpc.clone()).await?;
        if let Err(e) = rpc.start(host.handlers()) {
            host.shutdown().await;
            return Err(e.into());
        }

        tracing::info!(channel = %channel_id, "Sandboxed surface ready");

        Ok(Self {
            document,
            channel_id,
            window,
            rpc,
            host,
        })
    }

    /// The window the surface's host listens on.
    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Channel id read back from the surface document.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The rendered surface document.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// The sandboxed frame markup for this surface.
    pub fn frame_html(&self) -> String {
        render_frame(&self.document)
    }

    /// Detach the surface: stop its endpoint and the host thread.
    pub async fn remove(&self) {
        self.rpc.stop().await;
        self.host.shutdown().await;
        tracing::debug!(channel = %self.channel_id, "Sandboxed surface removed");
    }
}
