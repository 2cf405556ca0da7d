//! Relay Configuration

use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the TCP listener binds to.
    pub listen_addr: String,
    /// Hard cap on one newline-delimited frame; longer lines are dropped.
    pub max_line_bytes: usize,
    /// How long an issued verification code stays valid.
    pub code_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: "0.0.0.0:7600".to_string(),
            max_line_bytes: 65_536,
            code_ttl: Duration::from_secs(600),
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = RelayConfig::default();
        RelayConfig {
            listen_addr: std::env::var("PEERLINK_RELAY_LISTEN_ADDR")
                .unwrap_or(defaults.listen_addr),
            max_line_bytes: env_parse("PEERLINK_RELAY_MAX_LINE_BYTES", defaults.max_line_bytes),
            code_ttl: Duration::from_secs(env_parse(
                "PEERLINK_RELAY_CODE_TTL_SECS",
                defaults.code_ttl.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparseable {name}={raw}");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:7600");
        assert_eq!(config.max_line_bytes, 65_536);
        assert_eq!(config.code_ttl, Duration::from_secs(600));
    }

    #[test]
    fn test_env_parse_falls_back() {
        // Unset variable uses the default.
        assert_eq!(env_parse("PEERLINK_RELAY_TEST_UNSET", 42usize), 42);
    }
}
