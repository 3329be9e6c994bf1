//! Bandi Shared Protocol Types
//!
//! This crate provides the telemetry decoder, the relay wire protocol and the
//! link/channel state machines shared between the monitor client and the
//! relay hub.

pub mod protocol;
pub mod state_machine;
pub mod telemetry;

pub use protocol::{ControlPayload, InboundFrame, OutboundFrame, ProtocolError};
pub use telemetry::{decode, encode, DecodeError, Quantity, Reading, Sample, FRAME_LEN};

/// Build the relay topic for a device
pub fn device_topic(device_id: &str) -> String {
    format!("device/{}", device_id)
}

/// Timing parameters for the device link and the relay channel
pub mod timing {
    /// Liveness probe interval while a device link is believed connected
    pub const LIVENESS_INTERVAL_MS: u64 = 10_000;

    /// Delay between automatic link connection attempts
    pub const LINK_RETRY_DELAY_MS: u64 = 1_000;

    /// Settle time after tearing down a previous link
    pub const LINK_SETTLE_MS: u64 = 1_000;

    /// Automatic retries after the first failed link attempt
    pub const LINK_MAX_RETRIES: u32 = 3;

    /// Fixed delay before each relay reconnect attempt
    pub const RELAY_RECONNECT_DELAY_MS: u64 = 2_000;

    /// Relay reconnect attempts before giving up
    pub const RELAY_MAX_RECONNECTS: u32 = 5;

    /// One-shot geolocation lookup timeout
    pub const LOCATION_TIMEOUT_MS: u64 = 5_000;

    /// Refresh interval of the last-known location cache
    pub const LOCATION_REFRESH_MS: u64 = 30_000;
}

/// GATT identifiers exposed by the sensor firmware
pub mod gatt {
    use uuid::Uuid;

    /// Advertised name of the sensor device
    pub const DEVICE_NAME: &str = "Bandi-Pico";

    pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

    /// Custom service hosting the dust sensor control
    pub const DUST_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);
    pub const DUST_ENABLE: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

    /// Particulate sensor data service; its notify characteristic carries the 18-byte frame
    pub const SENSOR_DATA_SERVICE: Uuid = Uuid::from_u128(0x0000ffb0_0000_1000_8000_00805f9b34fb);
    pub const SENSOR_DATA: Uuid = Uuid::from_u128(0x0000ffb3_0000_1000_8000_00805f9b34fb);

    pub const GAS_SERVICE: Uuid = Uuid::from_u128(0x0000ffd0_0000_1000_8000_00805f9b34fb);
    pub const GAS_ENABLE: Uuid = Uuid::from_u128(0x0000ffd1_0000_1000_8000_00805f9b34fb);

    pub const TEMP_HUMIDITY_SERVICE: Uuid =
        Uuid::from_u128(0x0000ffc0_0000_1000_8000_00805f9b34fb);
    pub const TEMP_HUMIDITY_ENABLE: Uuid =
        Uuid::from_u128(0x0000ffc1_0000_1000_8000_00805f9b34fb);

    /// Enable command written to each sub-sensor control characteristic
    pub const ENABLE_COMMAND: [u8; 1] = [0x01];

    /// Services the client must be allowed to access
    pub const OPTIONAL_SERVICES: [Uuid; 5] = [
        DEVICE_INFO_SERVICE,
        DUST_SERVICE,
        SENSOR_DATA_SERVICE,
        GAS_SERVICE,
        TEMP_HUMIDITY_SERVICE,
    ];

    /// A sub-sensor feature group activated by writing [`ENABLE_COMMAND`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SensorGroup {
        pub name: &'static str,
        pub service: Uuid,
        pub control: Uuid,
    }

    /// The three independent sensor groups, in activation order
    pub const SENSOR_GROUPS: [SensorGroup; 3] = [
        SensorGroup {
            name: "dust",
            service: DUST_SERVICE,
            control: DUST_ENABLE,
        },
        SensorGroup {
            name: "gas",
            service: GAS_SERVICE,
            control: GAS_ENABLE,
        },
        SensorGroup {
            name: "temperature-humidity",
            service: TEMP_HUMIDITY_SERVICE,
            control: TEMP_HUMIDITY_ENABLE,
        },
    ];
}
