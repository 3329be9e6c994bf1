//! Wireless link layer
//!
//! This module handles:
//! - Device discovery by advertised name
//! - GATT binding, characteristic reads/writes and notifications
//! - Unsolicited disconnect detection

pub mod bluez;
#[cfg(test)]
pub mod fake;
pub mod traits;

pub use bluez::{BluezConfig, BluezConnector, BluezLink};
pub use traits::{DeviceLink, DisconnectStream, DiscoveryFilter, LinkConnector, NotificationStream};
