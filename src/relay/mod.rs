//! Realtime relay channel
//!
//! This module handles:
//! - One persistent WebSocket to the relay backend
//! - Topic subscriptions and inbound SENSOR_DATA routing
//! - Location-stamped outbound frames
//! - Fixed-delay, bounded reconnection after abnormal closes

mod channel;
#[cfg(test)]
pub(crate) mod testing;

pub use channel::{RelayChannel, RelayConfig, TopicHandler};
