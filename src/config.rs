//! Environment configuration for the monitor binary

use bandi_shared::gatt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// How outbound relay frames get their coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationMode {
    /// Read the background-refreshed last known location
    #[default]
    Cached,
    /// Bounded lookup before every frame
    PerMessage,
}

impl FromStr for LocationMode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cached" => Ok(LocationMode::Cached),
            "per-message" => Ok(LocationMode::PerMessage),
            _ => Err("expected `cached` or `per-message`"),
        }
    }
}

/// Monitor configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Advertised name of the sensor
    pub device_name: String,
    /// Relay-facing device id; the link address when unset
    pub device_id: Option<String>,
    pub relay_url: String,
    /// gpsd address (`host:port`)
    pub gpsd_addr: Option<String>,
    /// Static (latitude, longitude), used when no gpsd is configured
    pub fixed_location: Option<(f64, f64)>,
    pub location_mode: LocationMode,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device_name: gatt::DEVICE_NAME.into(),
            device_id: None,
            relay_url: "ws://127.0.0.1:8080".into(),
            gpsd_addr: None,
            fixed_location: None,
            location_mode: LocationMode::Cached,
        }
    }
}

impl MonitorConfig {
    /// Load from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(name) = get("BANDI_DEVICE_NAME") {
            config.device_name = name;
        }
        config.device_id = get("BANDI_DEVICE_ID");
        if let Some(url) = get("BANDI_RELAY_URL") {
            // The WebSocket client is built without TLS support
            if !url.starts_with("ws://") {
                return Err(ConfigError::Invalid {
                    var: "BANDI_RELAY_URL",
                    value: url,
                    reason: "expected a ws:// URL (TLS is not supported)",
                });
            }
            config.relay_url = url;
        }
        config.gpsd_addr = get("BANDI_GPSD_ADDR");

        if let Some(value) = get("BANDI_FIXED_LOCATION") {
            config.fixed_location = Some(parse_coordinates(&value).map_err(|reason| {
                ConfigError::Invalid {
                    var: "BANDI_FIXED_LOCATION",
                    value: value.clone(),
                    reason,
                }
            })?);
        }

        if let Some(value) = get("BANDI_LOCATION_MODE") {
            config.location_mode =
                value
                    .trim()
                    .parse()
                    .map_err(|reason| ConfigError::Invalid {
                        var: "BANDI_LOCATION_MODE",
                        value: value.clone(),
                        reason,
                    })?;
        }

        Ok(config)
    }
}

/// Parse `lat,lon`
fn parse_coordinates(value: &str) -> Result<(f64, f64), &'static str> {
    let (lat, lon) = value.split_once(',').ok_or("expected `lat,lon`")?;
    let lat: f64 = lat.trim().parse().map_err(|_| "latitude is not a number")?;
    let lon: f64 = lon.trim().parse().map_err(|_| "longitude is not a number")?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err("latitude out of range");
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err("longitude out of range");
    }
    Ok((lat, lon))
}
