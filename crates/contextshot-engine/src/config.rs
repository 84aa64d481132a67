use std::env;
use std::time::Duration;

use anyhow::{bail, Result};

pub const DEFAULT_API_BASE: &str = "https://engine.prod.bria-api.com/v2";
pub const DEFAULT_POLL_ATTEMPTS: u32 = 30;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_PACE_INTERVAL: Duration = Duration::from_secs(3);

const DEFAULT_REQUEST_TIMEOUT_S: f64 = 120.0;

/// Connection settings for the image edit provider.
#[derive(Clone)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_token: String,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_token: api_token.into(),
            request_timeout: Duration::from_secs_f64(DEFAULT_REQUEST_TIMEOUT_S),
        }
    }

    /// Reads `BRIA_API_TOKEN`, plus the optional `BRIA_API_BASE` and
    /// `BRIA_REQUEST_TIMEOUT` (seconds) overrides.
    pub fn from_env() -> Result<Self> {
        let Some(api_token) = non_empty_env("BRIA_API_TOKEN") else {
            bail!("BRIA_API_TOKEN not set");
        };
        let mut config = Self::new(api_token);
        if let Some(base) = non_empty_env("BRIA_API_BASE") {
            config = config.with_api_base(&base);
        }
        if let Some(raw) = non_empty_env("BRIA_REQUEST_TIMEOUT") {
            let seconds = raw
                .parse::<f64>()
                .map_err(|_| anyhow::anyhow!("BRIA_REQUEST_TIMEOUT must be a number, got '{raw}'"))?;
            config.request_timeout = Duration::from_secs_f64(seconds.clamp(5.0, 600.0));
        }
        Ok(config)
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        let trimmed = api_base.trim().trim_end_matches('/');
        if !trimmed.is_empty() {
            self.api_base = trimmed.to_string();
        }
        self
    }

    /// Token prefix for log lines; the full token never leaves this struct.
    pub fn token_hint(&self) -> String {
        let prefix: String = self.api_token.chars().take(8).collect();
        format!("{prefix}...")
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_base", &self.api_base)
            .field("api_token", &self.token_hint())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Attempt budget for one pending job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Delay between consecutive items, applied whatever the previous item's
    /// outcome was.
    pub pace_interval: Duration,
    /// Overall budget for the batch, measured from the start of `run`.
    pub deadline: Option<Duration>,
    pub allow_empty: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            pace_interval: DEFAULT_PACE_INTERVAL,
            deadline: None,
            allow_empty: true,
        }
    }
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
