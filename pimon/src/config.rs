//! Runtime settings. Environment overrides are read once at startup.

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_REFRESH_SECS: u64 = 6;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;
/// Floor for `PIMON_HTTP_TIMEOUT_MS`; anything lower fails every request.
pub const MIN_HTTP_TIMEOUT_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub refresh_interval: Duration,
    pub http_timeout: Duration,
    pub keepalive: Duration,
    pub default_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            default_port: DEFAULT_PORT,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary key lookup; unset or unparsable keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            refresh_interval: Duration::from_secs(
                parse_or(&lookup, "PIMON_REFRESH_SECS", DEFAULT_REFRESH_SECS).max(1),
            ),
            http_timeout: Duration::from_millis(
                parse_or(&lookup, "PIMON_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS)
                    .max(MIN_HTTP_TIMEOUT_MS),
            ),
            keepalive: Duration::from_secs(
                parse_or(&lookup, "PIMON_KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS).max(1),
            ),
            default_port: parse_or(&lookup, "PIMON_PORT", d.default_port),
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, %default, "ignoring unparsable setting");
                default
            }
        },
        None => default,
    }
}
