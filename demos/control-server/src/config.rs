//! Environment configuration.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// HTTP control API, UI channel and WebSocket transport.
    pub http_addr: SocketAddr,
    /// TCP transport listener.
    pub tcp_addr: SocketAddr,
    /// Snapshots kept in memory.
    pub snapshot_capacity: usize,
    /// How long a greeting request waits for its reply.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            tcp_addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            snapshot_capacity: multiwire_core::snapshot_store::DEFAULT_CAPACITY,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Read `MULTIWIRE_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            http_addr: parse_var(&lookup, "MULTIWIRE_HTTP_ADDR")?.unwrap_or(defaults.http_addr),
            tcp_addr: parse_var(&lookup, "MULTIWIRE_TCP_ADDR")?.unwrap_or(defaults.tcp_addr),
            snapshot_capacity: parse_var(&lookup, "MULTIWIRE_SNAPSHOT_CAPACITY")?
                .unwrap_or(defaults.snapshot_capacity),
            request_timeout: parse_var(&lookup, "MULTIWIRE_REQUEST_TIMEOUT_MS")?
                .map_or(defaults.request_timeout, Duration::from_millis),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .with_context(|| format!("invalid value for {key}: {raw:?}"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("MULTIWIRE_TCP_ADDR", "0.0.0.0:9000"),
            ("MULTIWIRE_SNAPSHOT_CAPACITY", "42"),
            ("MULTIWIRE_REQUEST_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.tcp_addr.port(), 9000);
        assert_eq!(config.snapshot_capacity, 42);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_value_names_the_variable() {
        let err = Config::from_lookup(lookup(&[("MULTIWIRE_SNAPSHOT_CAPACITY", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("MULTIWIRE_SNAPSHOT_CAPACITY"));
    }
}
