//! Geolocation
//!
//! This module handles:
//! - One-shot position lookups with a bounded timeout
//! - Position sources (gpsd, fixed coordinate)
//! - A last-known location cache refreshed in the background

pub mod cache;
pub mod provider;
pub mod sources;

pub use cache::LocationCache;
pub use provider::{
    GeolocationProvider, Location, LocationConfig, LocationStamp, NoLocation, Position,
    PositionRequest, PositionSource,
};
pub use sources::{FixedSource, GpsdSource, UnavailableSource};
