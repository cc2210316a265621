//! Guard configuration
//!
//! Resolution order: per-call `RetryConfig` > environment > config file >
//! defaults. Environment and file are folded into one `GuardConfig` at
//! startup; the retry loop never reads the environment.

use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(10_000);

/// Sessions with this much lifetime left or less are refreshed before use.
pub const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(60);

/// How long the breaker stays open after a trip.
pub const DEFAULT_BREAKER_DURATION: Duration = Duration::from_secs(2 * 60);

/// Failure age at which a trip escalates to a forced sign-out.
pub const DEFAULT_AUTO_SIGNOUT_DELAY: Duration = Duration::from_secs(10 * 60);

pub const ENV_MAX_RETRIES: &str = "GUARD_MAX_RETRIES";
pub const ENV_BACKOFF_MS: &str = "GUARD_BACKOFF_MS";
pub const ENV_MAX_BACKOFF_MS: &str = "GUARD_MAX_BACKOFF_MS";
pub const ENV_SEND_LOGS: &str = "GUARD_SEND_LOGS";

/// Retry policy for one guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 means exactly one attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Emit telemetry events for retries and failures
    pub should_log: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            should_log: cfg!(debug_assertions),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt_index + 1`.
    ///
    /// `min(initial_backoff * 2^attempt_index, max_backoff)`, saturating on
    /// overflow, so the first retry waits exactly `initial_backoff`.
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_logging(mut self, should_log: bool) -> Self {
        self.should_log = should_log;
        self
    }

    /// Overlay `GUARD_*` environment variables onto this config.
    pub fn apply_env(&mut self) -> common::Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay environment-style overrides read through `lookup`.
    ///
    /// Unset or empty values leave the current setting in place. Unparseable
    /// values are rejected. `GUARD_SEND_LOGS=true` turns logging on; it never
    /// turns off logging that debug builds enable.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> common::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(raw) = read(ENV_MAX_RETRIES) {
            self.max_retries = raw
                .parse()
                .map_err(|e| common::Error::invalid_env(ENV_MAX_RETRIES, &raw, e))?;
        }
        if let Some(raw) = read(ENV_BACKOFF_MS) {
            let ms: u64 = raw
                .parse()
                .map_err(|e| common::Error::invalid_env(ENV_BACKOFF_MS, &raw, e))?;
            self.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(raw) = read(ENV_MAX_BACKOFF_MS) {
            let ms: u64 = raw
                .parse()
                .map_err(|e| common::Error::invalid_env(ENV_MAX_BACKOFF_MS, &raw, e))?;
            self.max_backoff = Duration::from_millis(ms);
        }
        if let Some(raw) = read(ENV_SEND_LOGS) {
            let enabled: bool = raw
                .parse()
                .map_err(|e| common::Error::invalid_env(ENV_SEND_LOGS, &raw, e))?;
            self.should_log |= enabled;
        }
        Ok(())
    }

    pub fn validate(&self) -> common::Result<()> {
        if self.max_backoff < self.initial_backoff {
            return Err(common::Error::Config(format!(
                "max_backoff ({}ms) must not be below initial_backoff ({}ms)",
                self.max_backoff.as_millis(),
                self.initial_backoff.as_millis()
            )));
        }
        Ok(())
    }
}

/// Process-wide guard settings, resolved once and passed to `SessionGuard::new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Default policy for calls that don't supply their own
    pub retry: RetryConfig,
    pub refresh_threshold: Duration,
    pub breaker_duration: Duration,
    pub auto_signout_delay: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
            breaker_duration: DEFAULT_BREAKER_DURATION,
            auto_signout_delay: DEFAULT_AUTO_SIGNOUT_DELAY,
        }
    }
}

impl GuardConfig {
    pub fn validate(&self) -> common::Result<()> {
        self.retry.validate()?;
        if self.breaker_duration.is_zero() {
            return Err(common::Error::Config(
                "breaker_duration must be greater than 0".into(),
            ));
        }
        if self.auto_signout_delay <= self.breaker_duration {
            return Err(common::Error::Config(format!(
                "auto_signout_delay ({}s) must exceed breaker_duration ({}s)",
                self.auto_signout_delay.as_secs(),
                self.breaker_duration.as_secs()
            )));
        }
        Ok(())
    }
}

/// `[guard]` table of a TOML config file. Every field is optional.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Unset means "debug builds only"
    #[serde(default)]
    pub should_log: Option<bool>,
    #[serde(default = "default_refresh_threshold_secs")]
    pub refresh_threshold_secs: u64,
    #[serde(default = "default_breaker_duration_secs")]
    pub breaker_duration_secs: u64,
    #[serde(default = "default_auto_signout_delay_secs")]
    pub auto_signout_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF.as_millis() as u64
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF.as_millis() as u64
}

fn default_refresh_threshold_secs() -> u64 {
    DEFAULT_REFRESH_THRESHOLD.as_secs()
}

fn default_breaker_duration_secs() -> u64 {
    DEFAULT_BREAKER_DURATION.as_secs()
}

fn default_auto_signout_delay_secs() -> u64 {
    DEFAULT_AUTO_SIGNOUT_DELAY.as_secs()
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            should_log: None,
            refresh_threshold_secs: default_refresh_threshold_secs(),
            breaker_duration_secs: default_breaker_duration_secs(),
            auto_signout_delay_secs: default_auto_signout_delay_secs(),
        }
    }
}

impl GuardSettings {
    /// Fold file settings and environment overrides into a validated config.
    pub fn resolve_with<F>(&self, lookup: F) -> common::Result<GuardConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut retry = RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            should_log: self.should_log.unwrap_or(cfg!(debug_assertions)),
        };
        retry.apply_env_with(lookup)?;

        let config = GuardConfig {
            retry,
            refresh_threshold: Duration::from_secs(self.refresh_threshold_secs),
            breaker_duration: Duration::from_secs(self.breaker_duration_secs),
            auto_signout_delay: Duration::from_secs(self.auto_signout_delay_secs),
        };
        config.validate()?;
        Ok(config)
    }

    /// `resolve_with` against the process environment.
    pub fn resolve(&self) -> common::Result<GuardConfig> {
        self.resolve_with(|key| std::env::var(key).ok())
    }
}
