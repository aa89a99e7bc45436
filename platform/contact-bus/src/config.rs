//! Broker connection settings loaded from environment variables
//!
//! | Variable                      | Default          |
//! |-------------------------------|------------------|
//! | `BROKER_HOST`                 | `localhost`      |
//! | `BROKER_PORT`                 | `5672`           |
//! | `BROKER_USER`                 | `guest`          |
//! | `BROKER_PASSWORD`             | `guest`          |
//! | `BROKER_VHOST`                | `/`              |
//! | `BROKER_EXCHANGE`             | `contact_events` |
//! | `BROKER_CONNECT_TIMEOUT_SECS` | `10`             |

use crate::{BusError, BusResult};
use std::env;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_USER: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_EXCHANGE: &str = "contact_events";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name of the shared fanout exchange
    pub exchange: String,
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
            vhost: DEFAULT_VHOST.to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl BrokerConfig {
    /// Load from the environment (and `.env` if present), falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> BusResult<Self> {
        dotenvy::dotenv().ok();

        let port = match env::var("BROKER_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| BusError::InvalidConfig(format!("BROKER_PORT: '{}' is not a port", raw)))?,
            Err(_) => DEFAULT_PORT,
        };

        let connect_timeout_secs = match env::var("BROKER_CONNECT_TIMEOUT_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BusError::InvalidConfig(format!(
                    "BROKER_CONNECT_TIMEOUT_SECS: '{}' is not a number of seconds",
                    raw
                ))
            })?,
            Err(_) => DEFAULT_CONNECT_TIMEOUT_SECS,
        };

        let exchange = env::var("BROKER_EXCHANGE").unwrap_or_else(|_| DEFAULT_EXCHANGE.to_string());
        if exchange.is_empty() || exchange.contains(['.', '*', '>', ' ']) {
            return Err(BusError::InvalidConfig(format!(
                "BROKER_EXCHANGE: '{}' is not a valid exchange name",
                exchange
            )));
        }

        Ok(Self {
            host: env::var("BROKER_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port,
            user: env::var("BROKER_USER").unwrap_or_else(|_| DEFAULT_USER.to_string()),
            password: env::var("BROKER_PASSWORD").unwrap_or_else(|_| DEFAULT_PASSWORD.to_string()),
            vhost: env::var("BROKER_VHOST").unwrap_or_else(|_| DEFAULT_VHOST.to_string()),
            exchange,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
        })
    }

    pub fn server_url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    /// JetStream domain for the vhost; the root vhost maps to the default domain
    pub fn jetstream_domain(&self) -> Option<String> {
        let domain = self.vhost.trim_matches('/');
        if domain.is_empty() {
            None
        } else {
            Some(domain.to_string())
        }
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("exchange", &self.exchange)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 7] = [
        "BROKER_HOST",
        "BROKER_PORT",
        "BROKER_USER",
        "BROKER_PASSWORD",
        "BROKER_VHOST",
        "BROKER_EXCHANGE",
        "BROKER_CONNECT_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 5672);
        assert_eq!(cfg.user, "guest");
        assert_eq!(cfg.password, "guest");
        assert_eq!(cfg.vhost, "/");
        assert_eq!(cfg.exchange, "contact_events");
        assert_eq!(cfg.server_url(), "nats://localhost:5672");
        assert_eq!(cfg.jetstream_domain(), None);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults_when_unset() {
        clear_env();
        let cfg = BrokerConfig::from_env().unwrap();
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.exchange, DEFAULT_EXCHANGE);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("BROKER_HOST", "broker.internal");
        env::set_var("BROKER_PORT", "4222");
        env::set_var("BROKER_VHOST", "/contacts");
        env::set_var("BROKER_EXCHANGE", "crm_events");

        let cfg = BrokerConfig::from_env().unwrap();
        assert_eq!(cfg.server_url(), "nats://broker.internal:4222");
        assert_eq!(cfg.jetstream_domain(), Some("contacts".to_string()));
        assert_eq!(cfg.exchange, "crm_events");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_port() {
        clear_env();
        env::set_var("BROKER_PORT", "not-a-port");
        assert!(matches!(BrokerConfig::from_env(), Err(BusError::InvalidConfig(_))));
        clear_env();
    }

    #[test]
    fn test_debug_hides_password() {
        let cfg = BrokerConfig {
            password: "s3cret".to_string(),
            ..Default::default()
        };
        assert!(!format!("{:?}", cfg).contains("s3cret"));
    }
}
