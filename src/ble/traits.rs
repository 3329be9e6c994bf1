//! Link trait abstraction for pluggable wireless backends

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use uuid::Uuid;

/// Stream of raw characteristic notifications
pub type NotificationStream = BoxStream<'static, Bytes>;

/// Stream that yields once per unsolicited link drop
pub type DisconnectStream = BoxStream<'static, ()>;

/// Discovery filter for the sensor device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    /// Exact advertised device name
    pub name: String,
    /// Services the client needs access to
    pub optional_services: Vec<Uuid>,
}

/// A bound (or bindable) wireless link to one device
#[async_trait]
pub trait DeviceLink: Send + Sync + 'static {
    /// Human-readable identity of the device (address or platform id)
    fn id(&self) -> String;

    /// Advertised name, if known
    fn name(&self) -> Option<String>;

    /// Bind the GATT link
    async fn connect(&self) -> Result<()>;

    /// Release the GATT link
    async fn disconnect(&self) -> Result<()>;

    /// Whether the platform reports the link as connected
    async fn is_connected(&self) -> bool;

    /// Write a value to a characteristic
    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<()>;

    /// Read a characteristic value
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Bytes>;

    /// Start notifications on a characteristic
    async fn notifications(&self, service: Uuid, characteristic: Uuid)
        -> Result<NotificationStream>;

    /// Subscribe to unsolicited disconnect events
    async fn disconnect_events(&self) -> Result<DisconnectStream>;
}

/// Factory for discovering device links
#[async_trait]
pub trait LinkConnector: Send + Sync + 'static {
    /// The link type this connector produces
    type Link: DeviceLink;

    /// Find a device matching the filter
    async fn discover(&self, filter: &DiscoveryFilter) -> Result<Self::Link>;

    /// Human-readable name for this backend
    fn name(&self) -> &'static str;
}
