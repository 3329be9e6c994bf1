//! Device session layer
//!
//! This module handles:
//! - Connecting to the sensor with bounded retries
//! - Sensor activation and notification delivery
//! - Liveness probing with silent reconnect

pub mod manager;
pub mod monitor;

pub use manager::{
    ConnectOutcome, DeviceInfo, DisconnectHandler, NotificationHandler, SessionConfig,
    SessionError, SessionManager,
};
pub use monitor::{start_monitoring, LivenessTarget, MonitorHandle, ProbeOutcome};
