//! Runtime configuration, environment-driven with CLI overrides applied by
//! the binary.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub port: u16,
    pub workers: usize,
    pub db_path: PathBuf,
    pub webhook_url: Option<String>,
    pub ipc_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8089,
            workers: 2,
            db_path: PathBuf::from("relay.db"),
            webhook_url: None,
            ipc_timeout: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    /// Read `RELAY_*` variables over the defaults. Unparseable values are
    /// logged and ignored rather than failing startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parsed("RELAY_PORT", defaults.port),
            workers: env_parsed("RELAY_WORKERS", defaults.workers).max(1),
            db_path: std::env::var("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            webhook_url: std::env::var("RELAY_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            ipc_timeout: Duration::from_secs(env_parsed(
                "RELAY_IPC_TIMEOUT_SECS",
                defaults.ipc_timeout.as_secs(),
            )),
        }
    }
}

fn env_parsed<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => parse_or(name, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr + Copy>(name: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(var = name, value = raw, "unparseable value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = GatewayConfig::default();
        assert_eq!(c.port, 8089);
        assert_eq!(c.workers, 2);
        assert!(c.webhook_url.is_none());
        assert_eq!(c.ipc_timeout, Duration::from_secs(30));
    }

    #[test]
    fn parse_or_falls_back_on_garbage() {
        assert_eq!(parse_or("RELAY_PORT", "9000", 8089u16), 9000);
        assert_eq!(parse_or("RELAY_PORT", "not-a-port", 8089u16), 8089);
        assert_eq!(parse_or("RELAY_WORKERS", " 4 ", 2usize), 4);
    }
}
