//! In-memory link backend for tests

use crate::ble::traits::{
    DeviceLink, DisconnectStream, DiscoveryFilter, LinkConnector, NotificationStream,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

fn channel_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> futures::stream::BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) }).boxed()
}

/// Shared, scriptable state behind a fake device
#[derive(Default)]
pub struct FakeDevice {
    /// Number of upcoming discover calls that fail
    pub fail_discoveries: AtomicU32,
    /// Number of upcoming connect calls that fail
    pub fail_connects: AtomicU32,
    /// Fail every characteristic write
    pub fail_writes: AtomicBool,
    /// Fail every characteristic read
    pub fail_reads: AtomicBool,

    pub discover_calls: AtomicU32,
    pub connect_calls: AtomicU32,
    pub disconnect_calls: AtomicU32,
    pub read_calls: AtomicU32,
    pub notify_calls: AtomicU32,
    connected: AtomicBool,
    discover_delay: Mutex<Duration>,
    writes: Mutex<Vec<(Uuid, Uuid, Vec<u8>)>>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    drop_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_discover_delay(&self, delay: Duration) {
        *self.discover_delay.lock().unwrap() = delay;
    }

    pub fn writes(&self) -> Vec<(Uuid, Uuid, Vec<u8>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Deliver a notification on the current stream; false if nobody listens
    pub fn push_frame(&self, frame: &[u8]) -> bool {
        match self.notify_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(Bytes::copy_from_slice(frame)).is_ok(),
            None => false,
        }
    }

    /// Simulate the device dropping the link
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.drop_tx.lock().unwrap().as_ref() {
            let _ = tx.send(());
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct FakeConnector {
    pub device: Arc<FakeDevice>,
}

impl FakeConnector {
    pub fn new(device: Arc<FakeDevice>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl LinkConnector for FakeConnector {
    type Link = FakeLink;

    async fn discover(&self, filter: &DiscoveryFilter) -> Result<FakeLink> {
        self.device.discover_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.device.discover_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if FakeDevice::take_failure(&self.device.fail_discoveries) {
            return Err(anyhow!("User cancelled the requestDevice() chooser"));
        }
        Ok(FakeLink {
            device: self.device.clone(),
            name: filter.name.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "Fake"
    }
}

pub struct FakeLink {
    device: Arc<FakeDevice>,
    name: String,
}

#[async_trait]
impl DeviceLink for FakeLink {
    fn id(&self) -> String {
        "fa:ke:00:00:00:01".into()
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    async fn connect(&self) -> Result<()> {
        self.device.connect_calls.fetch_add(1, Ordering::SeqCst);
        if FakeDevice::take_failure(&self.device.fail_connects) {
            return Err(anyhow!("GATT connect failed"));
        }
        self.device.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.device.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.device.connected.store(false, Ordering::SeqCst);
        *self.device.notify_tx.lock().unwrap() = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<()> {
        if self.device.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("GATT write failed"));
        }
        self.device
            .writes
            .lock()
            .unwrap()
            .push((service, characteristic, value.to_vec()));
        Ok(())
    }

    async fn read(&self, _service: Uuid, _characteristic: Uuid) -> Result<Bytes> {
        self.device.read_calls.fetch_add(1, Ordering::SeqCst);
        if self.device.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("GATT read failed"));
        }
        Ok(Bytes::from_static(&[0u8; 18]))
    }

    async fn notifications(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<NotificationStream> {
        self.device.notify_calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.device.notify_tx.lock().unwrap() = Some(tx);
        Ok(channel_stream(rx))
    }

    async fn disconnect_events(&self) -> Result<DisconnectStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.device.drop_tx.lock().unwrap() = Some(tx);
        Ok(channel_stream(rx))
    }
}
