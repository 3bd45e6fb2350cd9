use std::env;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CONTROL_LABEL: &str = "control";
pub const DEFAULT_HIGH_WATER_MARK: usize = 1024 * 1024;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_READ_CAPACITY: usize = 16;
pub const DEFAULT_MAX_CHUNK: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// ICE server entry handed to the engine when a peer connection is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// A channel whose outbound buffer holds at least this many bytes is not
    /// sent on until it drains below it.
    pub high_water_mark: usize,
    /// Fallback re-check interval while waiting for a low-buffer notification.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Received chunks the consumer may have outstanding before the remote
    /// sender is told to stop.
    pub read_capacity: usize,
    /// Largest payload a single stream write hands to the dispatcher.
    pub max_chunk: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_capacity: DEFAULT_READ_CAPACITY,
            max_chunk: DEFAULT_MAX_CHUNK,
        }
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub ice_servers: Vec<IceServer>,
    /// Label of the side channel carrying flow-control frames
    pub control_label: String,
    pub dispatcher: DispatcherConfig,
    pub stream: StreamConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::new(DEFAULT_STUN_SERVER)],
            control_label: DEFAULT_CONTROL_LABEL.to_string(),
            dispatcher: DispatcherConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if lookup("RTC_TUNNEL_LOCALHOST_ONLY").is_some() {
            config.ice_servers.clear();
        }
        if let Some(value) = lookup("RTC_TUNNEL_HIGH_WATER") {
            config.dispatcher.high_water_mark = parse_positive("RTC_TUNNEL_HIGH_WATER", &value)?;
        }
        if let Some(value) = lookup("RTC_TUNNEL_POLL_MS") {
            let millis = parse_positive("RTC_TUNNEL_POLL_MS", &value)?;
            config.dispatcher.poll_interval = Duration::from_millis(millis as u64);
        }
        Ok(config)
    }

    /// A configuration without STUN/TURN servers
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_control_label(mut self, label: impl Into<String>) -> Self {
        self.control_label = label.into();
        self
    }

    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.dispatcher.high_water_mark = bytes;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.dispatcher.poll_interval = interval;
        self
    }

    pub fn with_read_capacity(mut self, chunks: usize) -> Self {
        self.stream.read_capacity = chunks.max(1);
        self
    }

    pub fn with_max_chunk(mut self, bytes: usize) -> Self {
        self.stream.max_chunk = bytes.max(1);
        self
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason,
    };
    let parsed: usize = value
        .trim()
        .parse()
        .map_err(|err: std::num::ParseIntError| invalid(err.to_string()))?;
    if parsed == 0 {
        return Err(invalid("must be greater than zero".into()));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.control_label, "control");
        assert_eq!(config.ice_servers, vec![IceServer::new(DEFAULT_STUN_SERVER)]);
        assert_eq!(config.dispatcher.high_water_mark, 1024 * 1024);
        assert_eq!(config.stream.max_chunk, 16 * 1024);
    }

    #[test]
    fn env_overrides_dispatcher_settings() {
        let config = TunnelConfig::from_lookup(lookup(&[
            ("RTC_TUNNEL_HIGH_WATER", "4096"),
            ("RTC_TUNNEL_POLL_MS", "20"),
            ("RTC_TUNNEL_LOCALHOST_ONLY", "1"),
        ]))
        .expect("valid env");
        assert_eq!(config.dispatcher.high_water_mark, 4096);
        assert_eq!(config.dispatcher.poll_interval, Duration::from_millis(20));
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn rejects_invalid_values() {
        let err = TunnelConfig::from_lookup(lookup(&[("RTC_TUNNEL_POLL_MS", "soon")]))
            .expect_err("non-numeric poll interval");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: "RTC_TUNNEL_POLL_MS",
                ..
            }
        ));
        assert!(TunnelConfig::from_lookup(lookup(&[("RTC_TUNNEL_HIGH_WATER", "0")])).is_err());
    }

    #[test]
    fn builder_clamps_stream_sizes() {
        let config = TunnelConfig::localhost()
            .with_read_capacity(0)
            .with_max_chunk(0)
            .with_control_label("ctl");
        assert_eq!(config.stream.read_capacity, 1);
        assert_eq!(config.stream.max_chunk, 1);
        assert_eq!(config.control_label, "ctl");
        assert!(config.ice_servers.is_empty());
    }
}
