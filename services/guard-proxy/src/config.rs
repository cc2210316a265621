//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The auth API key and refresh token come from GUARD_API_KEY /
//! GUARD_REFRESH_TOKEN or from `*_file` paths, never from the TOML itself.

use common::Secret;
use serde::Deserialize;
use session_guard::GuardSettings;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const ENV_API_KEY: &str = "GUARD_API_KEY";
pub const ENV_REFRESH_TOKEN: &str = "GUARD_REFRESH_TOKEN";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub guard: GuardSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub headers: Vec<HeaderInjection>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Auth server settings
#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    /// Base URL of the GoTrue-compatible auth server
    pub url: String,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Collector for `{"event":"session_retry"}` posts. Unset disables posting.
    #[serde(default)]
    pub metrics_url: Option<String>,
}

/// Header to inject into proxied requests
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn require_http_scheme(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(());
    }
    Err(common::Error::Config(format!(
        "{field} must start with http:// or https://, got: {url}"
    )))
}

/// Read a secret from `env_key`, falling back to `file`.
///
/// Blank values count as unset. A configured file that can't be read is an
/// error, unless the environment already supplied the value.
fn resolve_secret(env_key: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_key) {
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Some(Secret::new(value)));
        }
    }
    let Some(path) = file else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(path).map_err(|e| {
        common::Error::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let value = contents.trim().to_owned();
    Ok((!value.is_empty()).then(|| Secret::new(value)))
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Secret resolution order, per secret:
    /// 1. Environment variable (`GUARD_API_KEY`, `GUARD_REFRESH_TOKEN`)
    /// 2. `*_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        require_http_scheme("upstream_url", &config.proxy.upstream_url)?;
        require_http_scheme("auth.url", &config.auth.url)?;
        if let Some(url) = &config.telemetry.metrics_url {
            require_http_scheme("telemetry.metrics_url", url)?;
        }

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        // The session bearer owns Authorization
        if let Some(h) = config
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("authorization"))
        {
            return Err(common::Error::Config(format!(
                "header {:?} cannot be injected: authorization carries the session token",
                h.name
            )));
        }

        config.auth.api_key = resolve_secret(ENV_API_KEY, config.auth.api_key_file.as_deref())?;
        config.auth.refresh_token = resolve_secret(
            ENV_REFRESH_TOKEN,
            config.auth.refresh_token_file.as_deref(),
        )?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-guard-proxy.toml")
    }
}
