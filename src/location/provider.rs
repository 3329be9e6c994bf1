//! Geolocation provider
//!
//! Wraps a [`PositionSource`] with a bounded one-shot lookup that never
//! fails: every error degrades to unknown coordinates.

use anyhow::Result;
use async_trait::async_trait;
use bandi_shared::timing;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A position fix reported by a source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// Coordinates attached to relay payloads, `null` when unknown
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct Location {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Location {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_known(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

impl From<Position> for Location {
    fn from(pos: Position) -> Self {
        Self {
            latitude: Some(pos.latitude),
            longitude: Some(pos.longitude),
        }
    }
}

/// Hints passed to a position source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRequest {
    /// Prefer the most accurate fix the source can give
    pub high_accuracy: bool,
    /// Oldest cached fix the caller accepts; zero means a fresh fix
    pub max_age: Duration,
}

/// Something that can produce a single position fix
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Request one fix
    async fn position(&self, request: &PositionRequest) -> Result<Position>;

    /// Human-readable name for this source
    fn name(&self) -> &'static str;
}

/// Configuration for geolocation lookups
#[derive(Debug, Clone)]
pub struct LocationConfig {
    /// Upper bound on a single lookup
    pub timeout: Duration,
    pub high_accuracy: bool,
    pub max_age: Duration,
    /// How often the last-known location cache refreshes
    pub refresh_interval: Duration,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(timing::LOCATION_TIMEOUT_MS),
            high_accuracy: true,
            max_age: Duration::ZERO,
            refresh_interval: Duration::from_millis(timing::LOCATION_REFRESH_MS),
        }
    }
}

/// Resolves the current location from a position source
pub struct GeolocationProvider {
    source: Arc<dyn PositionSource>,
    config: LocationConfig,
}

impl GeolocationProvider {
    pub fn new(source: Arc<dyn PositionSource>, config: LocationConfig) -> Self {
        Self { source, config }
    }

    /// One bounded lookup; failures and timeouts yield unknown coordinates
    pub async fn get_current_location(&self) -> Location {
        let request = PositionRequest {
            high_accuracy: self.config.high_accuracy,
            max_age: self.config.max_age,
        };

        match timeout(self.config.timeout, self.source.position(&request)).await {
            Ok(Ok(pos)) => {
                debug!(
                    "[GEO] Location found - Lat: {}, Lng: {}",
                    pos.latitude, pos.longitude
                );
                pos.into()
            }
            Ok(Err(e)) => {
                warn!("[GEO] Error fetching location from {}: {}", self.source.name(), e);
                Location::unknown()
            }
            Err(_) => {
                warn!(
                    "[GEO] {} lookup timed out after {:?}",
                    self.source.name(),
                    self.config.timeout
                );
                Location::unknown()
            }
        }
    }
}

/// Supplies the coordinates stamped onto each outbound relay frame
#[async_trait]
pub trait LocationStamp: Send + Sync {
    async fn location(&self) -> Location;
}

/// Fresh lookup per frame
#[async_trait]
impl LocationStamp for GeolocationProvider {
    async fn location(&self) -> Location {
        self.get_current_location().await
    }
}

/// Never stamps coordinates
pub struct NoLocation;

#[async_trait]
impl LocationStamp for NoLocation {
    async fn location(&self) -> Location {
        Location::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::sources::{FixedSource, UnavailableSource};

    struct StalledSource;

    #[async_trait]
    impl PositionSource for StalledSource {
        async fn position(&self, _request: &PositionRequest) -> Result<Position> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Position {
                latitude: 0.0,
                longitude: 0.0,
            })
        }

        fn name(&self) -> &'static str {
            "Stalled"
        }
    }

    fn provider(source: Arc<dyn PositionSource>) -> GeolocationProvider {
        GeolocationProvider::new(
            source,
            LocationConfig {
                timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_default_config() {
        let config = LocationConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.high_accuracy);
        assert_eq!(config.max_age, Duration::ZERO);
    }

    #[test]
    fn test_unknown_location_serializes_nulls() {
        let json = serde_json::to_value(Location::unknown()).unwrap();
        assert_eq!(json, serde_json::json!({"latitude": null, "longitude": null}));
    }

    #[tokio::test]
    async fn test_fix_is_returned() {
        let geo = provider(Arc::new(FixedSource::new(37.5665, 126.978)));
        let loc = geo.get_current_location().await;
        assert_eq!(loc.latitude, Some(37.5665));
        assert_eq!(loc.longitude, Some(126.978));
        assert!(loc.is_known());
    }

    #[tokio::test]
    async fn test_source_error_degrades_to_unknown() {
        let geo = provider(Arc::new(UnavailableSource));
        assert_eq!(geo.get_current_location().await, Location::unknown());
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_unknown() {
        let geo = provider(Arc::new(StalledSource));
        let started = tokio::time::Instant::now();
        assert_eq!(geo.location().await, Location::unknown());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
