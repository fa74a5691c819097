use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{OciError, Result};

/// Prefix for user metadata headers sent with registry requests.
pub const META_HEADER_PREFIX: &str = "X-Meta-";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrent fetch/copy operations during traversal
    pub parallelism: usize,

    /// Retry policy for registry network operations
    pub retry: RetryPolicy,

    /// Registry client settings
    pub registry: RegistryConfig,

    /// Name recorded as image author and in history comments
    pub tool_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 1,
            retry: RetryPolicy::default(),
            registry: RegistryConfig::default(),
            tool_name: "a3s-oci".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            OciError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| {
            OciError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `A3S_OCI_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("A3S_OCI_PARALLELISM") {
            self.parallelism = parse_env("A3S_OCI_PARALLELISM", &value)?;
        }
        if let Some(value) = lookup("A3S_OCI_REQUEST_TIMEOUT_SECS") {
            self.registry.request_timeout_secs = parse_env("A3S_OCI_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("A3S_OCI_MAX_RETRIES") {
            self.retry.max_retries = parse_env("A3S_OCI_MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("A3S_OCI_PLAIN_HTTP") {
            self.registry.plain_http_hosts = value
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(OciError::ConfigError(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.registry.request_timeout_secs == 0 {
            return Err(OciError::ConfigError(
                "registry request timeout must be non-zero".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(OciError::ConfigError(format!(
                "retry jitter must be in [0, 1), got {}",
                self.retry.jitter
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| OciError::ConfigError(format!("invalid value for {}: '{}'", key, value)))
}

/// Retry policy for idempotent registry operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// First backoff delay; later delays grow along the Fibonacci sequence
    pub initial_delay_ms: u64,

    /// Relative jitter applied to each delay (0.2 = ±20%)
    pub jitter: f64,

    /// Include earlier attempt errors in the final error
    pub join_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 1000,
            jitter: 0.2,
            join_errors: true,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

/// Registry client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Extra headers attached to every registry request
    pub headers: BTreeMap<String, String>,

    /// Metadata sent as `X-Meta-<key>` headers
    pub meta_headers: BTreeMap<String, String>,

    /// Registry hosts reached over plain HTTP
    pub plain_http_hosts: Vec<String>,

    pub user_agent: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            headers: BTreeMap::new(),
            meta_headers: BTreeMap::new(),
            plain_http_hosts: Vec::new(),
            user_agent: format!("a3s-oci/{}", crate::VERSION),
        }
    }
}

impl RegistryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// All headers to attach, with metadata keys prefixed.
    pub fn all_headers(&self) -> BTreeMap<String, String> {
        let mut headers = self.headers.clone();
        for (key, value) in &self.meta_headers {
            let name = if key.starts_with(META_HEADER_PREFIX) {
                key.clone()
            } else {
                format!("{}{}", META_HEADER_PREFIX, key)
            };
            headers.insert(name, value.clone());
        }
        headers
    }

    /// Whether a host is reached over plain HTTP.
    ///
    /// Loopback registries always are.
    pub fn is_plain_http(&self, host: &str) -> bool {
        let hostname = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
        matches!(hostname, "localhost" | "127.0.0.1" | "[::1]")
            || self.plain_http_hosts.iter().any(|h| h == host || h == hostname)
    }
}
