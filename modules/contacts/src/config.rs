use contact_bus::{BusError, BusResult};
use std::env;
use std::time::Duration;

pub const DEFAULT_BINDING: &str = "*";
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Settings of the contacts consumer process
///
/// | Variable | Default |
/// |---|---|
/// | `CONTACTS_QUEUE` | derived from the handler |
/// | `CONTACTS_BINDING` | `*` |
/// | `CONTACTS_SHUTDOWN_GRACE_SECS` | `30` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub queue: Option<String>,
    pub binding: String,
    pub shutdown_grace: Duration,
}

impl ConsumerSettings {
    pub fn from_env() -> BusResult<Self> {
        let grace_secs = match env::var("CONTACTS_SHUTDOWN_GRACE_SECS") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                BusError::InvalidConfig(format!(
                    "CONTACTS_SHUTDOWN_GRACE_SECS: '{}' is not a number of seconds",
                    raw
                ))
            })?,
            Err(_) => DEFAULT_SHUTDOWN_GRACE_SECS,
        };

        Ok(Self {
            queue: env::var("CONTACTS_QUEUE").ok().filter(|q| !q.trim().is_empty()),
            binding: env::var("CONTACTS_BINDING").unwrap_or_else(|_| DEFAULT_BINDING.to_string()),
            shutdown_grace: Duration::from_secs(grace_secs),
        })
    }
}
