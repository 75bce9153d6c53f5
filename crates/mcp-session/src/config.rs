//! Configuration surface consumed by the session layer.
//!
//! All knobs are externally supplied and defaulted sanely; [`SessionConfig::validate`]
//! is expected to run once at startup, before anything is wired together.

use std::time::Duration;

use thiserror::Error;

/// Configuration for the session layer and its HTTP front end.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// A session with no attributed request for longer than this is pruned.
    pub idle_timeout: Duration,
    /// How often the idle reaper sweeps.
    pub reap_interval: Duration,
    /// Sliding expiry for retained events; extended on each replay access.
    pub event_sliding_expiry: Duration,
    /// Absolute ceiling for retained events, regardless of access.
    pub event_absolute_expiry: Duration,
    /// Ping interval on live SSE streams. `None` disables keep-alive.
    pub sse_keep_alive: Option<Duration>,
    /// Reconnection-interval hint sent to clients (SSE `retry:`), also the
    /// suggested polling cadence once a stream has been demoted to polling.
    pub sse_retry: Option<Duration>,
    /// Hosts accepted in addition to the loopback forms.
    pub allowed_hosts: Vec<String>,
    /// Capacity of the per-stream and per-session delivery channels.
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(2 * 60 * 60),
            reap_interval: Duration::from_secs(60),
            event_sliding_expiry: Duration::from_secs(5 * 60),
            event_absolute_expiry: Duration::from_secs(30 * 60),
            sse_keep_alive: Some(Duration::from_secs(15)),
            sse_retry: Some(Duration::from_millis(1000)),
            allowed_hosts: Vec::new(),
            channel_capacity: 64,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },
    #[error("event_absolute_expiry must be at least event_sliding_expiry")]
    ExpiryOrder,
    #[error("channel_capacity must be greater than zero")]
    ZeroCapacity,
    #[error("allowed host may not be empty or contain '/'")]
    BadAllowedHost,
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("idle_timeout", self.idle_timeout),
            ("reap_interval", self.reap_interval),
            ("event_sliding_expiry", self.event_sliding_expiry),
            ("event_absolute_expiry", self.event_absolute_expiry),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { name });
            }
        }
        if self.event_absolute_expiry < self.event_sliding_expiry {
            return Err(ConfigError::ExpiryOrder);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self
            .allowed_hosts
            .iter()
            .any(|h| h.is_empty() || h.contains('/'))
        {
            return Err(ConfigError::BadAllowedHost);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_durations_and_inverted_expiry() {
        let mut config = SessionConfig {
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.idle_timeout = Duration::from_secs(1);
        config.event_sliding_expiry = Duration::from_secs(600);
        config.event_absolute_expiry = Duration::from_secs(60);
        assert!(matches!(config.validate(), Err(ConfigError::ExpiryOrder)));
    }

    #[test]
    fn rejects_bad_allowed_host() {
        let config = SessionConfig {
            allowed_hosts: vec!["http://example".into()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadAllowedHost)
        ));
    }
}
