//! Configuration for a notebook VM.

use notebox_sandbox::SandboxOptions;
use std::time::Duration;

/// Default time allowed for the socket connection attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Configuration for a [`Vm`](crate::Vm).
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// WebSocket address of a notebox server. `None` skips straight to the
    /// sandboxed surface.
    pub ws_url: Option<String>,

    /// How long to wait for the socket before falling back.
    pub connect_timeout: Duration,

    /// Per-call timeout for calls into the sandbox.
    pub call_timeout: Option<Duration>,

    /// Options for the in-process sandbox used by the surface fallback.
    pub sandbox: SandboxOptions,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: None,
            sandbox: SandboxOptions::default(),
        }
    }
}

impl VmConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `NOTEBOX_WS_URL` | unset (surface only) |
    /// | `NOTEBOX_CONNECT_TIMEOUT_MS` | `2000` |
    /// | `NOTEBOX_CALL_TIMEOUT_MS` | unset (no timeout) |
    ///
    /// Sandbox options for the fallback come from [`SandboxOptions::from_env`].
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            ws_url: std::env::var("NOTEBOX_WS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            connect_timeout: std::env::var("NOTEBOX_CONNECT_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.connect_timeout),
            call_timeout: std::env::var("NOTEBOX_CALL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            sandbox: SandboxOptions::from_env(),
        }
    }

    /// Set the server address.
    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmConfig::default();
        assert!(config.ws_url.is_none());
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(config.call_timeout.is_none());
    }

    #[test]
    fn test_builders() {
        let config = VmConfig::default()
            .with_ws_url("ws://localhost:8081/")
            .with_connect_timeout(Duration::from_millis(10));
        assert_eq!(config.ws_url.as_deref(), Some("ws://localhost:8081/"));
        assert_eq!(config.connect_timeout, Duration::from_millis(10));
    }
}
