//! Allow-listed modules available to cells through `require`.
//!
//! Only network-facing modules are exposed. Each native returns a JSON reply
//! of the form `{"ok": ...}` or `{"error": "..."}` which the prelude unwraps
//! into a value or a thrown `Error`.

use crate::error::SandboxError;
use serde_json::{json, Value};
use std::io::Read;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::Duration;

/// Modules `require` may load.
pub const ALLOWED_MODULES: &[&str] = &["net", "dns", "http", "https"];

/// Size of one body read while streaming a download.
const READ_CHUNK: usize = 16 * 1024;

/// Check `name` against the allow-list.
pub fn check_module(name: &str) -> Result<(), SandboxError> {
    if ALLOWED_MODULES.contains(&name) {
        Ok(())
    } else {
        Err(SandboxError::ForbiddenModule(name.to_string()))
    }
}

/// `net.isIP`: 4 or 6 for a valid address, 0 otherwise.
pub fn ip_version(input: &str) -> i32 {
    match input.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => 4,
        Ok(IpAddr::V6(_)) => 6,
        Err(_) => 0,
    }
}

/// `dns.lookup`: resolve `host` to its addresses.
pub fn dns_lookup(host: &str) -> Result<Vec<String>, String> {
    let addrs = (host, 0)
        .to_socket_addrs()
        .map_err(|e| format!("dns lookup failed for {host}: {e}"))?;

    let mut ips: Vec<String> = Vec::new();
    for addr in addrs {
        let ip = addr.ip().to_string();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    Ok(ips)
}

/// Progress of a streaming download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub loaded: u64,
    pub total: Option<u64>,
}

/// Limits applied to `http.get`/`https.get`.
#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    pub max_bytes: u64,
    pub timeout: Duration,
}

/// Response returned to the cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// `http.get`/`https.get`: fetch `url`, reporting progress per chunk.
///
/// `scheme` is the module name and must match the URL's scheme.
pub fn http_get(
    scheme: &str,
    url: &str,
    limits: HttpLimits,
    mut on_progress: impl FnMut(Progress),
) -> Result<HttpResponse, String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid url {url}: {e}"))?;
    if parsed.scheme() != scheme {
        return Err(format!("{scheme}.get only supports {scheme}: URLs"));
    }

    // Proxy settings come from the worker's environment, which cells must not use.
    let client = reqwest::blocking::Client::builder()
        .no_proxy()
        .timeout(limits.timeout)
        .build()
        .map_err(|e| format!("http client error: {e}"))?;

    let mut response = client
        .get(parsed)
        .send()
        .map_err(|e| format!("request to {url} failed: {e}"))?;

    let status = response.status().as_u16();
    let total = response.content_length();
    if total.is_some_and(|len| len > limits.max_bytes) {
        return Err(format!("response exceeds {} bytes", limits.max_bytes));
    }

    let mut body = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = response
            .read(&mut chunk)
            .map_err(|e| format!("reading {url} failed: {e}"))?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() as u64 > limits.max_bytes {
            return Err(format!("response exceeds {} bytes", limits.max_bytes));
        }
        on_progress(Progress {
            loaded: body.len() as u64,
            total,
        });
    }

    tracing::debug!(url, status, bytes = body.len(), "Download finished");

    Ok(HttpResponse {
        status,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Wrap a native result in the reply shape the prelude expects.
pub fn reply<T: Into<Value>>(result: Result<T, String>) -> String {
    let value = match result {
        Ok(ok) => {
            let ok: Value = ok.into();
            json!({ "ok": ok })
        }
        Err(error) => json!({ "error": error }),
    };
    value.to_string()
}

/// Read-only view of the worker process exposed as `process`.
///
/// `env` is always empty: the worker's environment never reaches cells.
pub fn process_info() -> Value {
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let platform = match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "win32",
        other => other,
    };

    json!({
        "cwd": cwd,
        "env": {},
        "platform": platform,
        "pid": std::process::id(),
    })
}
