//! BlueZ link backend and device discovery

use crate::ble::traits::{
    DeviceLink, DisconnectStream, DiscoveryFilter, LinkConnector, NotificationStream,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Device, DeviceEvent, DeviceProperty};
use bytes::Bytes;
use futures::{future, StreamExt};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for BlueZ discovery and binding
#[derive(Debug, Clone)]
pub struct BluezConfig {
    /// How long to scan for the device
    pub scan_duration: Duration,
    /// How long to wait for GATT services to resolve after connecting
    pub services_timeout: Duration,
}

impl Default for BluezConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
            services_timeout: Duration::from_secs(15),
        }
    }
}

/// Discovers the sensor on the default BlueZ adapter
pub struct BluezConnector {
    config: BluezConfig,
}

impl BluezConnector {
    pub fn new(config: BluezConfig) -> Self {
        Self { config }
    }

    /// Get the default Bluetooth adapter
    pub async fn get_adapter() -> Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        Ok(adapter)
    }

    async fn name_matches(device: &Device, name: &str) -> bool {
        matches!(device.name().await, Ok(Some(n)) if n == name)
    }

    fn make_link(&self, device: Device, filter: &DiscoveryFilter) -> BluezLink {
        BluezLink {
            device,
            name: Some(filter.name.clone()),
            required_services: filter.optional_services.clone(),
            services_timeout: self.config.services_timeout,
        }
    }
}

#[async_trait]
impl LinkConnector for BluezConnector {
    type Link = BluezLink;

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<BluezLink> {
        let adapter = Self::get_adapter().await?;

        // Devices BlueZ already knows about (paired or seen recently)
        for addr in adapter.device_addresses().await? {
            if let Ok(device) = adapter.device(addr) {
                if Self::name_matches(&device, &filter.name).await {
                    info!("[BLE] Found known device {} ({})", filter.name, addr);
                    return Ok(self.make_link(device, filter));
                }
            }
        }

        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        let found = timeout(self.config.scan_duration, async {
            while let Some(evt) = discover.next().await {
                if let AdapterEvent::DeviceAdded(addr) = evt {
                    if let Ok(device) = adapter.device(addr) {
                        if Self::name_matches(&device, &filter.name).await {
                            return Some(device);
                        }
                    }
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(device)) => {
                info!("[BLE] Discovered {} ({})", filter.name, device.address());
                Ok(self.make_link(device, filter))
            }
            Ok(None) => Err(anyhow!("Discovery stream ended before {} was found", filter.name)),
            Err(_) => Err(anyhow!(
                "No device named {} found within {:?}",
                filter.name,
                self.config.scan_duration
            )),
        }
    }

    fn name(&self) -> &'static str {
        "BlueZ"
    }
}

/// GATT link to one BlueZ device
pub struct BluezLink {
    device: Device,
    name: Option<String>,
    required_services: Vec<Uuid>,
    services_timeout: Duration,
}

impl BluezLink {
    /// Wait for BlueZ to finish resolving GATT services
    async fn wait_services_resolved(&self) -> Result<()> {
        let deadline = Instant::now() + self.services_timeout;
        loop {
            if self.device.is_services_resolved().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("Timeout waiting for GATT services to be resolved"));
            }
            sleep(Duration::from_millis(250)).await;
        }
    }

    /// Resolve a characteristic by service and characteristic UUID
    async fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        for svc in self.device.services().await? {
            if svc.uuid().await? != service {
                continue;
            }
            for chr in svc.characteristics().await? {
                if chr.uuid().await? == characteristic {
                    return Ok(chr);
                }
            }
            return Err(anyhow!(
                "Characteristic {} not found in service {}",
                characteristic,
                service
            ));
        }
        Err(anyhow!("Service {} not found", service))
    }
}

#[async_trait]
impl DeviceLink for BluezLink {
    fn id(&self) -> String {
        self.device.address().to_string()
    }

    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<()> {
        if !self.device.is_connected().await? {
            self.device.connect().await?;
        }
        self.wait_services_resolved().await?;

        let mut present = Vec::new();
        for svc in self.device.services().await? {
            present.push(svc.uuid().await?);
        }
        for uuid in &self.required_services {
            if !present.contains(uuid) {
                debug!("[BLE] Service {} not exposed by {}", uuid, self.id());
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.device.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await.unwrap_or(false)
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<()> {
        let chr = self.characteristic(service, characteristic).await?;
        chr.write(value).await?;
        Ok(())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Bytes> {
        let chr = self.characteristic(service, characteristic).await?;
        Ok(Bytes::from(chr.read().await?))
    }

    async fn notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<NotificationStream> {
        let chr = self.characteristic(service, characteristic).await?;
        let stream = chr.notify().await?;
        Ok(stream.map(Bytes::from).boxed())
    }

    async fn disconnect_events(&self) -> Result<DisconnectStream> {
        let events = self.device.events().await?;
        let addr = self.device.address();
        Ok(events
            .filter_map(move |evt| {
                let dropped = matches!(
                    evt,
                    DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))
                );
                if dropped {
                    warn!("[BLE] Device {} dropped the link", addr);
                }
                future::ready(dropped.then_some(()))
            })
            .boxed())
    }
}
