use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    /// Skip the startup full-sync scheduling pass (useful for local dev
    /// against a database that's already caught up).
    pub skip_startup_full_sync: bool,

    /// How often the session poller ticks.
    pub session_poll_interval: Duration,
    /// Per-server HTTP timeout for a single poll request.
    pub session_poll_server_timeout: Duration,
    /// Number of retries before a server's backoff kicks in.
    pub session_poll_server_retries: u32,
    /// Max number of servers polled concurrently.
    pub session_poll_server_concurrency: usize,

    /// Base URL of the IP geolocation API used by the geolocation pipeline.
    pub geo_lookup_base_url: String,
    /// Optional API key for the geolocation provider.
    pub geo_lookup_api_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables, falling back to a
    /// `.env` file in development.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse_or("PORT", 8080)?,
            skip_startup_full_sync: env_bool("SKIP_STARTUP_FULL_SYNC", false)?,
            session_poll_interval: Duration::from_millis(env_parse_or(
                "SESSION_POLL_INTERVAL_MS",
                5_000,
            )?),
            session_poll_server_timeout: Duration::from_millis(env_parse_or(
                "SESSION_POLL_SERVER_TIMEOUT_MS",
                60_000,
            )?),
            session_poll_server_retries: env_parse_or("SESSION_POLL_SERVER_RETRIES", 3)?,
            session_poll_server_concurrency: env_parse_or(
                "SESSION_POLL_SERVER_CONCURRENCY",
                3usize,
            )?,
            geo_lookup_base_url: env::var("GEO_LOOKUP_BASE_URL")
                .unwrap_or_else(|_| "https://geo.example.internal/lookup".to_string()),
            geo_lookup_api_key: env::var("GEO_LOOKUP_API_KEY").ok(),
        })
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid number: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(anyhow::anyhow!("{key} must be a boolean, got {other:?}")),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_accepts_common_truthy_values() {
        assert!(env_bool("__NONEXISTENT_TRUE__", true).unwrap());
    }

    #[test]
    fn env_parse_or_falls_back_to_default() {
        let v: u16 = env_parse_or("__NONEXISTENT_PORT__", 1234).unwrap();
        assert_eq!(v, 1234);
    }
}
