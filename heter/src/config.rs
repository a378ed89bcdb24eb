use std::{env, fs, num::NonZeroUsize, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    client::RetryPolicy,
    error::{HeterErr, Result},
};

const DEFAULT_HOST: &str = "127.0.0.1";

/// The configuration of a heter node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeterConfig {
    /// The `host:port` to listen on.
    pub endpoint: String,
    /// The channels served, one task queue channel each.
    pub channels: Vec<String>,
    #[serde(default)]
    pub expected_workers: usize,
    #[serde(default)]
    pub queue_capacity: Option<NonZeroUsize>,
    /// Micro-batch scopes created up front under mini-batch 0.
    #[serde(default)]
    pub micro_batches: usize,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub connect_timeout_ms: u64,
}

fn default_ready_timeout_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryPolicy::default().into()
    }
}

impl From<RetryPolicy> for RetryConfig {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_retries: policy.max_retries,
            base_backoff_ms: policy.base_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            connect_timeout_ms: policy.connect_timeout.as_millis() as u64,
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

impl HeterConfig {
    /// Parses a JSON configuration.
    ///
    /// # Returns
    /// The configuration or a `Config` error if it's invalid JSON or has no channels.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| HeterErr::Config(format!("invalid configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Reads and parses the JSON configuration at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| HeterErr::Config(format!("can't read {}: {e}", path.display())))?;

        Self::from_json(&json)
    }

    /// Overrides the endpoint's host and port with the `HOST` and `PORT` environment variables.
    pub fn apply_env(&mut self) {
        self.override_endpoint(env::var("HOST").ok(), env::var("PORT").ok());
    }

    fn override_endpoint(&mut self, host: Option<String>, port: Option<String>) {
        if host.is_none() && port.is_none() {
            return;
        }

        let (cur_host, cur_port) = self
            .endpoint
            .rsplit_once(':')
            .unwrap_or((DEFAULT_HOST, "0"));

        self.endpoint = format!(
            "{}:{}",
            host.as_deref().unwrap_or(cur_host),
            port.as_deref().unwrap_or(cur_port)
        );
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().into()
    }

    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(HeterErr::Config("no channels configured".into()));
        }

        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(HeterErr::Config(format!(
                "base backoff {}ms exceeds max backoff {}ms",
                self.retry.base_backoff_ms, self.retry.max_backoff_ms
            )));
        }

        Ok(())
    }
}
