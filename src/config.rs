//! Validated configuration records (spec §3, §6). These are plain structs
//! built programmatically by the embedding application; this crate does not
//! parse any configuration file format itself (spec Non-goals).

use std::time::Duration;

use crate::error::ValidationError;
use crate::net::address::InterfaceAddress;
use crate::tls::ServerTlsConfig;

/// Configuration for a single listening endpoint.
pub struct ListenerConfig {
    pub name: String,
    pub interface: InterfaceAddress,
    pub tls: Option<ServerTlsConfig>,
    pub nodelay: Option<bool>,
    pub keepalive: Option<Duration>,
    pub idle_session_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, interface: InterfaceAddress) -> Self {
        Self {
            name: name.into(),
            interface,
            tls: None,
            nodelay: None,
            keepalive: None,
            idle_session_timeout: Duration::from_secs(300),
            shutdown_grace: Duration::from_millis(250),
        }
    }

    pub fn tls(mut self, tls: ServerTlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = Some(nodelay);
        self
    }

    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn idle_session_timeout(mut self, timeout: Duration) -> Self {
        self.idle_session_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::UnknownField("endpoint name must not be empty".into()));
        }
        Ok(())
    }
}

/// Configuration for a [`crate::file_preserver::FilePreserver`] (spec §4.11).
///
/// `rotate_at_size`/`check_period` form the periodic size-based trigger;
/// `save_on_start`/`save_on_stop`/`save_on_reload` are the lifecycle-edge
/// triggers. `rotate_on_reload` (run a size check at reload) and
/// `save_on_reload` (unconditionally rotate at reload) are mutually
/// exclusive — both ask to handle the same lifecycle edge with different
/// semantics, which is exactly the "rotate and save both given" conflict
/// from spec §9's open question; see [`FilePreserverConfig::validate`].
pub struct FilePreserverConfig {
    pub directory: std::path::PathBuf,
    pub prefix: String,
    pub suffix: String,
    pub rotate_at_size: Option<u64>,
    pub check_period: Duration,
    pub max_age: Option<Duration>,
    pub save_on_start: bool,
    pub save_on_stop: bool,
    pub rotate_on_reload: bool,
    pub save_on_reload: bool,
    pub max_old_count: Option<usize>,
    pub max_old_bytes: Option<u64>,
}

impl FilePreserverConfig {
    pub fn new(directory: impl Into<std::path::PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
            suffix: ".log".to_string(),
            rotate_at_size: None,
            check_period: Duration::from_secs(5 * 60),
            max_age: None,
            save_on_start: false,
            save_on_stop: false,
            rotate_on_reload: false,
            save_on_reload: false,
            max_old_count: None,
            max_old_bytes: None,
        }
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn rotate_at_size(mut self, bytes: u64) -> Self {
        self.rotate_at_size = Some(bytes);
        self
    }

    pub fn check_period(mut self, period: Duration) -> Self {
        self.check_period = period;
        self
    }

    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    pub fn save_on_start(mut self, enabled: bool) -> Self {
        self.save_on_start = enabled;
        self
    }

    pub fn save_on_stop(mut self, enabled: bool) -> Self {
        self.save_on_stop = enabled;
        self
    }

    pub fn rotate_on_reload(mut self, enabled: bool) -> Self {
        self.rotate_on_reload = enabled;
        self
    }

    pub fn save_on_reload(mut self, enabled: bool) -> Self {
        self.save_on_reload = enabled;
        self
    }

    pub fn max_old_count(mut self, count: usize) -> Self {
        self.max_old_count = Some(count);
        self
    }

    pub fn max_old_bytes(mut self, bytes: u64) -> Self {
        self.max_old_bytes = Some(bytes);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.prefix.is_empty() {
            return Err(ValidationError::UnknownField("file preserver prefix must not be empty".into()));
        }
        if self.rotate_on_reload && self.save_on_reload {
            return Err(ValidationError::ConflictingRotationTriggers);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_conflicting_reload_triggers() {
        let config = FilePreserverConfig::new("/tmp", "svc")
            .rotate_on_reload(true)
            .save_on_reload(true);
        assert!(matches!(config.validate(), Err(ValidationError::ConflictingRotationTriggers)));
    }

    #[test]
    fn rejects_empty_listener_name() {
        let config = ListenerConfig::new("", InterfaceAddress::Tcp("127.0.0.1:0".parse().unwrap()));
        assert!(config.validate().is_err());
    }
}
