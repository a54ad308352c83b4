//! Application configuration.
//!
//! Settings are layered with figment: compiled-in defaults, then an optional
//! TOML file (`config/default.toml`, or an explicit path which must exist),
//! then `CHAMBER_GUARD_*` environment variables (`__` separates nesting, so
//! `CHAMBER_GUARD_DEVICE__HOST` overrides `device.host`).
//!
//! Semantic validation runs after extraction; values that parse but are
//! logically unsafe (a step cap at or above the shock rating, a zero safety
//! margin) are refused at startup rather than discovered at the device.

use crate::error::{GuardError, GuardResult};
use crate::link::RetryPolicy;
use crate::wear::Thresholds;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Connection parameters for the instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Instrument host name or address.
    pub host: String,
    /// Instrument TCP port.
    pub port: u16,
    /// Deadline for establishing the TCP connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Deadline for one command/response round trip.
    #[serde(with = "humantime_serde")]
    pub round_trip_timeout: Duration,
    /// Bounded reconnect attempts after a connection fault.
    pub reconnect_attempts: u32,
    /// Base delay between reconnect attempts (grows linearly).
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            connect_timeout: Duration::from_secs(2),
            round_trip_timeout: Duration::from_secs(3),
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(100),
        }
    }
}

impl DeviceSettings {
    /// `host:port` for the TCP connector.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reconnect policy for the device link.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.reconnect_attempts,
            backoff_delay: self.reconnect_backoff,
        }
    }
}

/// Proxy actor parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Capacity of the actor's command channel; callers beyond it queue on
    /// send.
    pub command_channel_capacity: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            command_channel_capacity: 32,
        }
    }
}

/// Root settings object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceSettings,
    pub proxy: ProxySettings,
    pub thresholds: Thresholds,
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file, and environment
    /// variables. An explicitly given path must exist.
    pub fn new(config_path: Option<&Path>) -> GuardResult<Self> {
        let base = Figment::from(Serialized::defaults(Settings::default()));
        let with_file = match config_path {
            Some(path) => base.merge(Toml::file_exact(path)),
            None => base.merge(Toml::file("config/default.toml")),
        };
        let settings: Settings = with_file
            .merge(Env::prefixed("CHAMBER_GUARD_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> GuardResult<()> {
        let t = &self.thresholds;
        if t.temp_min >= t.temp_max {
            return Err(GuardError::InvalidConfig(format!(
                "temp_min ({}) must be below temp_max ({})",
                t.temp_min, t.temp_max
            )));
        }
        if t.rapid_step_cap <= 0.0 || t.rapid_step_cap >= t.thermal_shock_delta {
            return Err(GuardError::InvalidConfig(format!(
                "rapid_step_cap ({}) must be positive and stay under thermal_shock_delta ({})",
                t.rapid_step_cap, t.thermal_shock_delta
            )));
        }
        if t.safety_margin < 1 {
            return Err(GuardError::InvalidConfig(
                "safety_margin must be at least 1 to absorb shadow drift".to_string(),
            ));
        }
        if self.device.reconnect_attempts == 0 {
            return Err(GuardError::InvalidConfig(
                "reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.proxy.command_channel_capacity == 0 {
            return Err(GuardError::InvalidConfig(
                "command_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
