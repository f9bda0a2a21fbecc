use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::error::ProxyError;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 8192;
pub const DEFAULT_REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(50);
pub const DEFAULT_ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Runtime tunables of the proxy core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Tunnel torn down after this long with no traffic in either direction
    pub idle_timeout: Duration,
    /// Hard cap on the CONNECT request line plus headers
    pub max_request_bytes: usize,
    pub request_read_timeout: Duration,
    pub dial_timeout: Duration,
    /// Deadline for the first byte used to pick a protocol
    pub peek_timeout: Duration,
    /// How long shutdown waits for in-flight connections
    pub drain_timeout: Duration,
    pub accept_backoff_min: Duration,
    pub accept_backoff_max: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            request_read_timeout: DEFAULT_REQUEST_READ_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            peek_timeout: DEFAULT_PEEK_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            accept_backoff_min: DEFAULT_ACCEPT_BACKOFF_MIN,
            accept_backoff_max: DEFAULT_ACCEPT_BACKOFF_MAX,
        }
    }
}

/// On-disk overrides, every field optional. Durations are in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub idle_timeout_ms: Option<u64>,
    pub max_request_bytes: Option<usize>,
    pub request_read_timeout_ms: Option<u64>,
    pub dial_timeout_ms: Option<u64>,
    pub peek_timeout_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub accept_backoff_min_ms: Option<u64>,
    pub accept_backoff_max_ms: Option<u64>,
}

impl ConfigFile {
    pub fn from_json(raw: &str) -> Result<Self, ProxyError> {
        serde_json::from_str(raw).map_err(|e| ProxyError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }
}

impl ProxyConfig {
    /// Overlays the fields present in `file` on top of `self`.
    pub fn merge(mut self, file: ConfigFile) -> Self {
        let ms = Duration::from_millis;
        if let Some(v) = file.idle_timeout_ms {
            self.idle_timeout = ms(v);
        }
        if let Some(v) = file.max_request_bytes {
            self.max_request_bytes = v;
        }
        if let Some(v) = file.request_read_timeout_ms {
            self.request_read_timeout = ms(v);
        }
        if let Some(v) = file.dial_timeout_ms {
            self.dial_timeout = ms(v);
        }
        if let Some(v) = file.peek_timeout_ms {
            self.peek_timeout = ms(v);
        }
        if let Some(v) = file.drain_timeout_ms {
            self.drain_timeout = ms(v);
        }
        if let Some(v) = file.accept_backoff_min_ms {
            self.accept_backoff_min = ms(v);
        }
        if let Some(v) = file.accept_backoff_max_ms {
            self.accept_backoff_max = ms(v);
        }
        self
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        let durations = [
            ("idle_timeout", self.idle_timeout),
            ("request_read_timeout", self.request_read_timeout),
            ("dial_timeout", self.dial_timeout),
            ("peek_timeout", self.peek_timeout),
            ("drain_timeout", self.drain_timeout),
            ("accept_backoff_min", self.accept_backoff_min),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ProxyError::Config(format!("{name} must be non-zero")));
        }
        if self.max_request_bytes == 0 {
            return Err(ProxyError::Config("max_request_bytes must be non-zero".into()));
        }
        if self.accept_backoff_min > self.accept_backoff_max {
            return Err(ProxyError::Config(format!(
                "accept backoff min {:?} exceeds max {:?}",
                self.accept_backoff_min, self.accept_backoff_max
            )));
        }
        Ok(())
    }
}
