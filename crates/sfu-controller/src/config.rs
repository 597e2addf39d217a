//! SFU controller configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default; malformed values are rejected instead of silently replaced.

use crate::media::LoopbackSettings;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default maximum concurrent rooms.
pub const DEFAULT_MAX_ROOMS: usize = 1000;

/// Default maximum peers in one room.
pub const DEFAULT_MAX_PEERS_PER_ROOM: usize = 50;

/// Default bound on a single media engine call, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Default lifetime of a room nobody ever joined, in seconds.
pub const DEFAULT_EMPTY_ROOM_TTL_SECONDS: u64 = 300;

/// Default IP announced in ICE candidates.
pub const DEFAULT_ANNOUNCED_IP: &str = "127.0.0.1";

/// Default RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 40000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 49999;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sfu";

/// SFU controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this instance.
    pub instance_id: String,

    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: SocketAddr,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: SocketAddr,

    /// Maximum concurrent rooms.
    pub max_rooms: usize,

    /// Maximum peers per room.
    pub max_peers_per_room: usize,

    /// Bound on each media engine call.
    pub request_timeout: Duration,

    /// Rooms nobody joined within this window are closed.
    pub empty_room_ttl: Duration,

    /// IP announced in ICE candidates.
    pub announced_ip: String,

    /// Lowest RTC port.
    pub rtc_min_port: u16,

    /// Highest RTC port.
    pub rtc_max_port: u16,

    /// Whether consumers start paused until the client resumes them.
    pub consumers_start_paused: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse `key` from `vars`, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

fn parse_bool_var(
    vars: &HashMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(key).map(|raw| raw.trim().to_ascii_lowercase()) {
        Some(value) => match value.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue(format!("{key}={value}"))),
        },
        None => Ok(default),
    }
}

fn require_positive<T: PartialEq + Default>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let default_signaling: SocketAddr = DEFAULT_SIGNALING_BIND_ADDRESS
            .parse()
            .map_err(|_| ConfigError::InvalidValue("default signaling address".to_string()))?;
        let default_health: SocketAddr = DEFAULT_HEALTH_BIND_ADDRESS
            .parse()
            .map_err(|_| ConfigError::InvalidValue("default health address".to_string()))?;

        let signaling_bind_address =
            parse_var(vars, "SFU_SIGNALING_BIND_ADDRESS", default_signaling)?;
        let health_bind_address = parse_var(vars, "SFU_HEALTH_BIND_ADDRESS", default_health)?;

        let max_rooms = require_positive(
            "SFU_MAX_ROOMS",
            parse_var(vars, "SFU_MAX_ROOMS", DEFAULT_MAX_ROOMS)?,
        )?;
        let max_peers_per_room = require_positive(
            "SFU_MAX_PEERS_PER_ROOM",
            parse_var(vars, "SFU_MAX_PEERS_PER_ROOM", DEFAULT_MAX_PEERS_PER_ROOM)?,
        )?;

        let request_timeout_seconds = require_positive(
            "SFU_REQUEST_TIMEOUT_SECONDS",
            parse_var(
                vars,
                "SFU_REQUEST_TIMEOUT_SECONDS",
                DEFAULT_REQUEST_TIMEOUT_SECONDS,
            )?,
        )?;
        let empty_room_ttl_seconds = require_positive(
            "SFU_EMPTY_ROOM_TTL_SECONDS",
            parse_var(
                vars,
                "SFU_EMPTY_ROOM_TTL_SECONDS",
                DEFAULT_EMPTY_ROOM_TTL_SECONDS,
            )?,
        )?;

        let announced_ip = vars
            .get("SFU_ANNOUNCED_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ANNOUNCED_IP.to_string());
        if announced_ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_ANNOUNCED_IP={announced_ip}"
            )));
        }

        let rtc_min_port = parse_var(vars, "SFU_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_var(vars, "SFU_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port == 0 || rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RTC port range {rtc_min_port}-{rtc_max_port}"
            )));
        }

        let consumers_start_paused = parse_bool_var(vars, "SFU_CONSUMERS_START_PAUSED", true)?;

        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{short_suffix}")
        });

        Ok(Config {
            instance_id,
            signaling_bind_address,
            health_bind_address,
            max_rooms,
            max_peers_per_room,
            request_timeout: Duration::from_secs(request_timeout_seconds),
            empty_room_ttl: Duration::from_secs(empty_room_ttl_seconds),
            announced_ip,
            rtc_min_port,
            rtc_max_port,
            consumers_start_paused,
        })
    }

    /// Loopback engine settings derived from this configuration.
    #[must_use]
    pub fn loopback_settings(&self) -> LoopbackSettings {
        LoopbackSettings {
            announced_ip: self.announced_ip.clone(),
            min_port: self.rtc_min_port,
            max_port: self.rtc_max_port,
            ..LoopbackSettings::default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load");

        assert_eq!(
            config.signaling_bind_address.to_string(),
            DEFAULT_SIGNALING_BIND_ADDRESS
        );
        assert_eq!(
            config.health_bind_address.to_string(),
            DEFAULT_HEALTH_BIND_ADDRESS
        );
        assert_eq!(config.max_rooms, DEFAULT_MAX_ROOMS);
        assert_eq!(config.max_peers_per_room, DEFAULT_MAX_PEERS_PER_ROOM);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.empty_room_ttl, Duration::from_secs(300));
        assert_eq!(config.announced_ip, "127.0.0.1");
        assert_eq!((config.rtc_min_port, config.rtc_max_port), (40000, 49999));
        assert!(config.consumers_start_paused);
        assert!(config.instance_id.starts_with("sfu-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let config = Config::from_vars(&vars(&[
            ("SFU_INSTANCE_ID", "sfu-eu-1"),
            ("SFU_SIGNALING_BIND_ADDRESS", "127.0.0.1:3100"),
            ("SFU_HEALTH_BIND_ADDRESS", "127.0.0.1:8082"),
            ("SFU_MAX_ROOMS", "20"),
            ("SFU_MAX_PEERS_PER_ROOM", "4"),
            ("SFU_REQUEST_TIMEOUT_SECONDS", "3"),
            ("SFU_EMPTY_ROOM_TTL_SECONDS", "60"),
            ("SFU_ANNOUNCED_IP", "203.0.113.10"),
            ("SFU_RTC_MIN_PORT", "50000"),
            ("SFU_RTC_MAX_PORT", "50100"),
            ("SFU_CONSUMERS_START_PAUSED", "false"),
        ]))
        .expect("Config should load");

        assert_eq!(config.instance_id, "sfu-eu-1");
        assert_eq!(config.signaling_bind_address.port(), 3100);
        assert_eq!(config.health_bind_address.port(), 8082);
        assert_eq!(config.max_rooms, 20);
        assert_eq!(config.max_peers_per_room, 4);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.empty_room_ttl, Duration::from_secs(60));
        assert!(!config.consumers_start_paused);

        let loopback = config.loopback_settings();
        assert_eq!(loopback.announced_ip, "203.0.113.10");
        assert_eq!((loopback.min_port, loopback.max_port), (50000, 50100));
        assert!(!loopback.media_codecs.is_empty());
    }

    #[test]
    fn test_malformed_number_is_rejected() {
        let result = Config::from_vars(&vars(&[("SFU_MAX_ROOMS", "lots")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("SFU_MAX_ROOMS")));
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let result = Config::from_vars(&vars(&[("SFU_REQUEST_TIMEOUT_SECONDS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_inverted_port_range_is_rejected() {
        let result = Config::from_vars(&vars(&[
            ("SFU_RTC_MIN_PORT", "50000"),
            ("SFU_RTC_MAX_PORT", "40000"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_bind_address_is_rejected() {
        let result = Config::from_vars(&vars(&[("SFU_SIGNALING_BIND_ADDRESS", "not-an-addr")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_bool_is_rejected() {
        let result = Config::from_vars(&vars(&[("SFU_CONSUMERS_START_PAUSED", "maybe")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
