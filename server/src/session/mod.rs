//! Client session management
//!
//! This module handles:
//! - Tracking connected relay clients
//! - Topic subscriptions
//! - Fanning SENSOR_DATA out to topic subscribers

mod connection;
mod manager;

pub use connection::{dispatch, ClientHandle, ClientSession, Routed};
pub use manager::SubscriptionManager;
