//! Telemetry Pipeline
//!
//! Decodes raw sensor notifications, keeps a short history and forwards
//! each sample to the relay.

use crate::relay::RelayChannel;
use bandi_shared::protocol;
use bandi_shared::{decode, DecodeError, Sample};
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Samples kept in the data log
pub const DATA_LOG_CAPACITY: usize = 100;

/// Current UTC time as RFC 3339
pub fn timestamp_now() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// SENSOR_DATA payload
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorReport {
    pub device_id: String,
    pub timestamp: String,
    pub data: Sample,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// DEVICE_STATUS payload
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub timestamp: String,
    pub connection_status: ConnectionStatus,
    pub firmware_version: String,
    pub battery_status: String,
    pub battery_level: u8,
    pub last_error_message: Option<String>,
    pub last_connected_at: Option<String>,
    pub last_disconnected_at: Option<String>,
    pub ip_address: Option<String>,
    pub rssi: i16,
}

impl DeviceStatus {
    fn new(device_id: &str, connection_status: ConnectionStatus) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: timestamp_now(),
            connection_status,
            firmware_version: "unknown".into(),
            battery_status: "UNKNOWN".into(),
            battery_level: 0,
            last_error_message: None,
            last_connected_at: None,
            last_disconnected_at: None,
            ip_address: None,
            rssi: 0,
        }
    }
}

/// Newest-first history of forwarded samples
#[derive(Debug, Clone)]
pub struct DataLog {
    entries: VecDeque<SensorReport>,
    capacity: usize,
}

impl DataLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, report: SensorReport) {
        self.entries.push_front(report);
        self.entries.truncate(self.capacity);
    }

    pub fn latest(&self) -> Option<&SensorReport> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorReport> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decodes notifications for one device and forwards them to the relay
pub struct TelemetryPipeline {
    /// Relay-facing device identity
    device_id: String,
    relay: Arc<RelayChannel>,
    /// Recent samples
    log: RwLock<DataLog>,
    /// When the device last connected, RFC 3339
    last_connected_at: RwLock<Option<String>>,
    decoded: AtomicU64,
    dropped: AtomicU64,
}

impl TelemetryPipeline {
    pub fn new(device_id: impl Into<String>, relay: Arc<RelayChannel>) -> Self {
        Self {
            device_id: device_id.into(),
            relay,
            log: RwLock::new(DataLog::new(DATA_LOG_CAPACITY)),
            last_connected_at: RwLock::new(None),
            decoded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Decode one notification, record it and forward it
    ///
    /// Incomplete frames are logged and dropped.
    pub async fn handle_frame(&self, raw: &[u8]) -> Result<Sample, DecodeError> {
        let sample = match decode(raw) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("[PIPE] Dropping frame: {}", e);
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.decoded.fetch_add(1, Ordering::SeqCst);
        debug!("[PIPE] Decoded frame {}", sample.raw_hex());

        let report = SensorReport {
            device_id: self.device_id.clone(),
            timestamp: timestamp_now(),
            data: sample.clone(),
        };
        self.log.write().await.push(report.clone());
        self.relay.send(protocol::SENSOR_DATA, &report).await;

        Ok(sample)
    }

    /// Process notifications in arrival order until the sender is dropped
    pub async fn run(self: Arc<Self>, mut notifications: mpsc::UnboundedReceiver<Bytes>) {
        while let Some(raw) = notifications.recv().await {
            let _ = self.handle_frame(&raw).await;
        }
        info!("[PIPE] Notification channel closed");
    }

    /// Report a new device connection
    pub async fn report_connected(&self) {
        let now = timestamp_now();
        *self.last_connected_at.write().await = Some(now.clone());

        let status = DeviceStatus {
            last_connected_at: Some(now),
            ..DeviceStatus::new(&self.device_id, ConnectionStatus::Connected)
        };
        self.relay.send(protocol::DEVICE_STATUS, &status).await;
    }

    /// Report that the device went away, with the reason if there is one
    pub async fn report_disconnected(&self, last_error: Option<String>) {
        let status = DeviceStatus {
            last_error_message: last_error,
            last_connected_at: self.last_connected_at.read().await.clone(),
            last_disconnected_at: Some(timestamp_now()),
            ..DeviceStatus::new(&self.device_id, ConnectionStatus::Disconnected)
        };
        self.relay.send(protocol::DEVICE_STATUS, &status).await;
    }

    /// Snapshot of the data log
    pub async fn log(&self) -> DataLog {
        self.log.read().await.clone()
    }

    pub fn decoded_count(&self) -> u64 {
        self.decoded.load(Ordering::SeqCst)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::fake::{FakeConnector, FakeDevice};
    use crate::location::{
        FixedSource, GeolocationProvider, LocationCache, LocationConfig, NoLocation,
    };
    use crate::relay::testing::{next_peer, start_server};
    use crate::relay::RelayConfig;
    use crate::session::{SessionConfig, SessionManager};
    use bandi_shared::{OutboundFrame, FRAME_LEN};
    use serde_json::json;
    use std::time::Duration;

    /// Frame with every quantity at a distinct value; temperature is `temp_tenths / 10`
    fn frame(temp_tenths: u16) -> [u8; FRAME_LEN] {
        let [hi, lo] = temp_tenths.to_be_bytes();
        [
            0x00, 0x23, 0x01, // pm25 35
            0x00, 0x32, 0x01, // pm10 50
            hi, lo, 0x00, // temperature
            0x01, 0xC2, 0x00, // humidity 45.0
            0x03, 0x20, 0x02, // co2 800
            0x00, 0x96, 0x01, // voc 150
        ]
    }

    fn closed_relay() -> Arc<RelayChannel> {
        Arc::new(RelayChannel::new(
            RelayConfig::default(),
            Arc::new(NoLocation),
        ))
    }

    fn report(n: usize) -> SensorReport {
        SensorReport {
            device_id: format!("d{}", n),
            timestamp: timestamp_now(),
            data: decode(&frame(200)).unwrap(),
        }
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let ts = timestamp_now();
        assert!(OffsetDateTime::parse(&ts, &Rfc3339).is_ok());
    }

    #[test]
    fn test_data_log_is_bounded_newest_first() {
        let mut log = DataLog::new(DATA_LOG_CAPACITY);
        for n in 0..105 {
            log.push(report(n));
        }
        assert_eq!(log.len(), 100);
        assert_eq!(log.latest().unwrap().device_id, "d104");
        assert_eq!(log.iter().last().unwrap().device_id, "d5");
    }

    #[test]
    fn test_device_status_shape() {
        let status = DeviceStatus::new("d1", ConnectionStatus::Connected);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["deviceId"], "d1");
        assert_eq!(json["connectionStatus"], "CONNECTED");
        assert_eq!(json["firmwareVersion"], "unknown");
        assert_eq!(json["batteryStatus"], "UNKNOWN");
        assert_eq!(json["batteryLevel"], 0);
        assert!(json["lastErrorMessage"].is_null());
        assert!(json["lastDisconnectedAt"].is_null());
        assert!(json["ipAddress"].is_null());
        assert_eq!(json["rssi"], 0);
    }

    #[tokio::test]
    async fn test_incomplete_frame_is_dropped() {
        let pipeline = TelemetryPipeline::new("d1", closed_relay());

        let result = pipeline.handle_frame(&[0u8; 17]).await;

        assert!(matches!(
            result,
            Err(DecodeError::IncompleteFrame { needed: 18, available: 17 })
        ));
        assert_eq!(pipeline.dropped_count(), 1);
        assert_eq!(pipeline.decoded_count(), 0);
        assert!(pipeline.log().await.is_empty());
    }

    #[tokio::test]
    async fn test_decoded_while_relay_closed_still_logged() {
        let pipeline = TelemetryPipeline::new("d1", closed_relay());

        let sample = pipeline.handle_frame(&frame(215)).await.unwrap();

        assert_eq!(sample.temperature.value, 21.5);
        assert_eq!(pipeline.log().await.len(), 1);
    }

    #[tokio::test]
    async fn test_session_to_relay_end_to_end() {
        let (url, mut peers) = start_server().await;

        let provider = Arc::new(GeolocationProvider::new(
            Arc::new(FixedSource::new(37.5665, 126.978)),
            LocationConfig::default(),
        ));
        let cache = Arc::new(LocationCache::start(provider, Duration::from_secs(3600)));
        let mut fix = cache.subscribe();
        tokio::time::timeout(Duration::from_secs(1), fix.wait_for(|loc| loc.is_known()))
            .await
            .unwrap()
            .unwrap();

        let relay = Arc::new(RelayChannel::new(
            RelayConfig {
                url,
                ..Default::default()
            },
            cache.clone(),
        ));
        relay.connect_channel().await;
        let mut peer = next_peer(&mut peers).await;

        let pipeline = Arc::new(TelemetryPipeline::new("bandi-001", relay.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pipeline.clone().run(rx));

        let device = FakeDevice::new();
        let session = SessionManager::new(
            FakeConnector::new(device.clone()),
            SessionConfig {
                liveness_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        session
            .connect(
                || {},
                move |value| {
                    let _ = tx.send(value);
                },
            )
            .await
            .unwrap();

        for temp in [200, 210, 220] {
            assert!(device.push_frame(&frame(temp)));
        }

        for expected in [20.0, 21.0, 22.0] {
            let text = peer.next_text().await.expect("frame not relayed");
            let frame = OutboundFrame::from_text(&text).unwrap();
            assert_eq!(frame.kind, "SENSOR_DATA");

            let payload = frame.payload_object().unwrap();
            let mut keys: Vec<_> = payload.keys().map(String::as_str).collect();
            keys.sort_unstable();
            assert_eq!(
                keys,
                vec!["data", "deviceId", "latitude", "longitude", "timestamp"]
            );
            assert_eq!(payload["deviceId"], "bandi-001");
            assert_eq!(payload["latitude"], json!(37.5665));
            assert_eq!(payload["longitude"], json!(126.978));

            let data = &payload["data"];
            assert_eq!(data["temperature"]["value"], json!(expected));
            assert_eq!(data["pm25"], json!({"value": 35.0, "level": 1}));
            assert_eq!(data["humidity"]["value"], json!(45.0));
            assert_eq!(data["co2"]["level"], json!(2));
            assert_eq!(data["_raw"].as_array().unwrap().len(), FRAME_LEN);
        }

        assert_eq!(pipeline.decoded_count(), 3);
        let log = pipeline.log().await;
        assert_eq!(log.len(), 3);
        assert_eq!(log.latest().unwrap().data.temperature.value, 22.0);

        session.disconnect().await;
        relay.disconnect().await;
    }
}
