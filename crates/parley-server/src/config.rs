use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Per-connection queue length; allocated on every connect.
const MAX_SUBSCRIBER_QUEUE: u64 = 65_536;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

/// Runtime settings, read from `PARLEY_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// Gateway ping interval
    pub heartbeat_interval: Duration,
    /// Silence after which the sweeper marks a user offline
    pub presence_timeout: Duration,
    pub sweep_interval: Duration,
    /// Per-connection queue capacity in the broker
    pub subscriber_queue: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = lookup("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.trim().is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLEY_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let parse = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw.trim().parse().with_context(|| format!("{} must be a number, got {:?}", key, raw)),
                None => Ok(default),
            }
        };

        let port = parse("PARLEY_PORT", 3000)?;
        let port = u16::try_from(port).with_context(|| format!("PARLEY_PORT {} is out of range", port))?;
        let subscriber_queue = parse("PARLEY_SUBSCRIBER_QUEUE", 256)?;
        if !(1..=MAX_SUBSCRIBER_QUEUE).contains(&subscriber_queue) {
            bail!("PARLEY_SUBSCRIBER_QUEUE must be between 1 and {}", MAX_SUBSCRIBER_QUEUE);
        }

        Ok(Self {
            host: lookup("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: lookup("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into()).into(),
            jwt_secret,
            heartbeat_interval: Duration::from_secs(parse("PARLEY_HEARTBEAT_SECS", 15)?.max(1)),
            presence_timeout: Duration::from_secs(parse("PARLEY_PRESENCE_TIMEOUT_SECS", 30)?),
            sweep_interval: Duration::from_secs(parse("PARLEY_SWEEP_INTERVAL_SECS", 10)?.max(1)),
            subscriber_queue: subscriber_queue as usize,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_secret_is_set() {
        let cfg = config(&[("PARLEY_JWT_SECRET", "a-long-random-value")]).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.db_path, PathBuf::from("parley.db"));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(cfg.presence_timeout, Duration::from_secs(30));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(10));
        assert_eq!(cfg.subscriber_queue, 256);
        assert_eq!(cfg.bind_addr().unwrap().port(), 3000);
    }

    #[test]
    fn placeholder_secrets_are_rejected() {
        assert!(config(&[]).is_err());
        assert!(config(&[("PARLEY_JWT_SECRET", "dev-secret-change-me")]).is_err());
        assert!(config(&[("PARLEY_JWT_SECRET", "  ")]).is_err());
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = config(&[("PARLEY_JWT_SECRET", "a-long-random-value"), ("PARLEY_PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("PARLEY_PORT"));
        assert!(config(&[("PARLEY_JWT_SECRET", "a-long-random-value"), ("PARLEY_PORT", "70000")]).is_err());
        assert!(config(&[("PARLEY_JWT_SECRET", "a-long-random-value"), ("PARLEY_SUBSCRIBER_QUEUE", "0")]).is_err());
    }

    #[test]
    fn subscriber_queue_is_capped() {
        let secret = ("PARLEY_JWT_SECRET", "a-long-random-value");
        let cfg = config(&[secret, ("PARLEY_SUBSCRIBER_QUEUE", "65536")]).unwrap();
        assert_eq!(cfg.subscriber_queue, 65_536);
        let err = config(&[secret, ("PARLEY_SUBSCRIBER_QUEUE", "18446744073709551615")]).unwrap_err();
        assert!(err.to_string().contains("PARLEY_SUBSCRIBER_QUEUE"));
    }
}
