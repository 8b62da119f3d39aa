// Runtime settings read from the environment. There are no command line
// flags: every knob has a default and can be overridden with an
// `AUTORETOUCH_*` variable.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pipeline::BatchOptions;

pub const DEFAULT_AUTH_URL: &str = "https://auth.autoretouch.com";
pub const DEFAULT_API_URL: &str = "https://api.autoretouch.com";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub config_path: PathBuf,
    pub auth_url: String,
    pub api_url: String,
    pub audience: String,
    pub http_timeout: Duration,
    /// Extra attempts for requests that failed with a transient error.
    pub http_retries: u32,
    pub sweep_delay: Duration,
    pub max_wait: Option<Duration>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_path = lookup("AUTORETOUCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);
        let api_url = lookup("AUTORETOUCH_API_URL").unwrap_or_else(|| DEFAULT_API_URL.into());

        Ok(Settings {
            config_path,
            auth_url: lookup("AUTORETOUCH_AUTH_URL").unwrap_or_else(|| DEFAULT_AUTH_URL.into()),
            audience: lookup("AUTORETOUCH_AUDIENCE").unwrap_or_else(|| DEFAULT_API_URL.into()),
            api_url,
            http_timeout: Duration::from_secs(
                parse(&lookup, "AUTORETOUCH_HTTP_TIMEOUT_SECS")?.unwrap_or(60),
            ),
            http_retries: parse(&lookup, "AUTORETOUCH_HTTP_RETRIES")?.unwrap_or(2),
            sweep_delay: Duration::from_millis(
                parse(&lookup, "AUTORETOUCH_SWEEP_DELAY_MS")?.unwrap_or(1000),
            ),
            max_wait: parse(&lookup, "AUTORETOUCH_MAX_WAIT_SECS")?.map(Duration::from_secs),
        })
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            sweep_delay: self.sweep_delay,
            max_wait: self.max_wait,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid value {raw:?} for {key}"))
        })
        .transpose()
}

/// `<config dir>/autoretouch/config.json`, or `config.json` in the working
/// directory when the platform has no config dir.
fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("autoretouch").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}
