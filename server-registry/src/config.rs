use std::env;
use std::time::Duration;

use crate::Error;

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TTL_SECS: u64 = 30;
pub const DEFAULT_KEY_PREFIX: &str = "server:registry";
/// Upper bound for both the heartbeat interval and the TTL.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Settings for one registry participant.
///
/// The liveness TTL must be longer than the heartbeat interval; with the
/// defaults (10s / 30s) a process survives two missed heartbeats before its
/// peers evict it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Explicit server id. `None` derives `<hostname>-<pid>`.
    pub server_id: Option<String>,
    pub heartbeat_interval: Duration,
    pub ttl: Duration,
    pub key_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server_id: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RegistryConfig {
    /// Read configuration from the environment.
    ///
    /// Recognized variables: `SERVER_ID`, `REGISTRY_HEARTBEAT_INTERVAL_SECS`,
    /// `REGISTRY_TTL_SECS` and `REGISTRY_KEY_PREFIX`. Missing variables fall
    /// back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a numeric variable does not parse or the
    /// resulting settings fail [`RegistryConfig::validate`].
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(id) = env::var("SERVER_ID") {
            if !id.trim().is_empty() {
                config.server_id = Some(id.trim().to_string());
            }
        }
        if let Some(secs) = parse_secs("REGISTRY_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_secs("REGISTRY_TTL_SECS")? {
            config.ttl = Duration::from_secs(secs);
        }
        if let Ok(prefix) = env::var("REGISTRY_KEY_PREFIX") {
            if !prefix.is_empty() {
                config.key_prefix = prefix;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// # Errors
    ///
    /// Returns `Error::Config` for a zero interval or TTL, either one above
    /// [`MAX_DURATION`], or a TTL that does not exceed the heartbeat interval.
    pub fn validate(&self) -> Result<(), Error> {
        if self.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be non-zero".into()));
        }
        if self.ttl.is_zero() {
            return Err(Error::Config("liveness TTL must be non-zero".into()));
        }
        if self.heartbeat_interval > MAX_DURATION || self.ttl > MAX_DURATION {
            return Err(Error::Config(format!(
                "heartbeat interval ({:?}) and liveness TTL ({:?}) must not exceed {:?}",
                self.heartbeat_interval, self.ttl, MAX_DURATION
            )));
        }
        if self.ttl <= self.heartbeat_interval {
            return Err(Error::Config(format!(
                "liveness TTL ({:?}) must exceed heartbeat interval ({:?})",
                self.ttl, self.heartbeat_interval
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(Error::Config("key prefix must not be empty".into()));
        }
        Ok(())
    }

    pub fn keys(&self) -> RegistryKeys {
        RegistryKeys::new(&self.key_prefix)
    }
}

fn parse_secs(var: &str) -> Result<Option<u64>, Error> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{var}={raw:?}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Key layout inside the store.
///
/// - `<prefix>`: hash, field = server id, value = JSON `ServerRecord`
/// - `<prefix>:ttl:<server_id>`: liveness marker with expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryKeys {
    registry: String,
}

impl RegistryKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            registry: prefix.to_string(),
        }
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn ttl_marker(&self, server_id: &str) -> String {
        format!("{}:ttl:{}", self.registry, server_id)
    }
}
