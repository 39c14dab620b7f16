//! Sandbox tunables.

use std::time::Duration;

/// Default cap on a single `http.get`/`https.get` body (64 MB).
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 64 * 1024 * 1024;

/// Options for a sandbox context.
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Wall-clock limit for one cell. `None` lets cells run until done.
    pub cell_time_limit: Option<Duration>,

    /// Maximum response body size accepted by the `http`/`https` modules.
    pub max_download_bytes: u64,

    /// Request timeout for the `http`/`https` modules.
    pub http_timeout: Duration,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            cell_time_limit: None,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            http_timeout: Duration::from_secs(30),
        }
    }
}

impl SandboxOptions {
    /// Load options from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `NOTEBOX_CELL_TIME_LIMIT_SECS` | unset (no limit) |
    /// | `NOTEBOX_MAX_DOWNLOAD_BYTES` | `67108864` |
    /// | `NOTEBOX_HTTP_TIMEOUT_SECS` | `30` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            cell_time_limit: std::env::var("NOTEBOX_CELL_TIME_LIMIT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            max_download_bytes: std::env::var("NOTEBOX_MAX_DOWNLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_download_bytes),
            http_timeout: std::env::var("NOTEBOX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.http_timeout),
        }
    }

    /// Set the per-cell time limit.
    pub fn with_cell_time_limit(mut self, limit: Duration) -> Self {
        self.cell_time_limit = Some(limit);
        self
    }
}
