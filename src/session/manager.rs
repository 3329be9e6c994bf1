//! Device session manager with bounded retries and liveness monitoring

use crate::ble::{DeviceLink, DiscoveryFilter, LinkConnector};
use crate::session::monitor::{start_monitoring, LivenessTarget, MonitorHandle};
use anyhow::anyhow;
use async_trait::async_trait;
use bandi_shared::gatt;
use bandi_shared::state_machine::{LinkEvent, LinkState, LinkStateMachine, TransitionResult};
use bandi_shared::timing;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Called once per unsolicited disconnect, or after the monitor gives up
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Called with every raw notification payload, in arrival order
pub type NotificationHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Errors surfaced by the session manager
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Device discovery failed: {0}")]
    DiscoveryFailed(#[source] anyhow::Error),

    #[error("GATT bind failed: {0}")]
    BindFailed(#[source] anyhow::Error),

    #[error("Failed to enable {group} sensor: {source}")]
    ActivationFailed {
        group: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Notification setup failed: {0}")]
    NotifyFailed(#[source] anyhow::Error),

    #[error("Connection failed after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: Box<SessionError>,
    },
}

/// Configuration for the session manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Discovery filter for the sensor
    pub filter: DiscoveryFilter,
    /// Automatic retries after a failed connection attempt
    pub max_retries: u32,
    /// Delay between connection attempts
    pub retry_delay: Duration,
    /// Settle time after tearing down a previous link
    pub settle_delay: Duration,
    /// Liveness probe interval
    pub liveness_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            filter: DiscoveryFilter {
                name: gatt::DEVICE_NAME.into(),
                optional_services: gatt::OPTIONAL_SERVICES.to_vec(),
            },
            max_retries: timing::LINK_MAX_RETRIES,
            retry_delay: Duration::from_millis(timing::LINK_RETRY_DELAY_MS),
            settle_delay: Duration::from_millis(timing::LINK_SETTLE_MS),
            liveness_interval: Duration::from_millis(timing::LIVENESS_INTERVAL_MS),
        }
    }
}

/// Identity of a connected device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: Option<String>,
}

/// Result of a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(DeviceInfo),
    /// Another connection attempt is already running; nothing was started
    InProgress,
}

#[derive(Clone)]
struct SessionHandlers {
    on_disconnect: DisconnectHandler,
    on_notification: NotificationHandler,
}

/// Mutable session state, owned by one manager
struct Session<L> {
    link: Option<Arc<L>>,
    device: Option<DeviceInfo>,
    fsm: LinkStateMachine,
    handlers: Option<SessionHandlers>,
    notify_task: Option<JoinHandle<()>>,
    watch_task: Option<JoinHandle<()>>,
    monitor: Option<MonitorHandle>,
}

impl<L> Session<L> {
    fn new() -> Self {
        Self {
            link: None,
            device: None,
            fsm: LinkStateMachine::new(),
            handlers: None,
            notify_task: None,
            watch_task: None,
            monitor: None,
        }
    }

    fn transition(&mut self, event: LinkEvent) {
        if let TransitionResult::Invalid { from, event } = self.fsm.process_event(event) {
            debug!("[BLE] Ignoring {:?} in state {:?}", event, from);
        }
    }
}

struct Inner<C: LinkConnector> {
    connector: C,
    config: SessionConfig,
    connecting: AtomicBool,
    reconnect_attempts: AtomicU32,
    session: Mutex<Session<C::Link>>,
}

/// Owns the lifecycle of one wireless connection to the sensor
pub struct SessionManager<C: LinkConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: LinkConnector> SessionManager<C> {
    /// Create a new session manager
    pub fn new(connector: C, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                connecting: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                session: Mutex::new(Session::new()),
            }),
        }
    }

    /// Connect to the sensor, retrying discovery and activation failures
    ///
    /// Returns `ConnectOutcome::InProgress` without doing anything when a
    /// connection attempt is already running.
    pub async fn connect<D, N>(
        &self,
        on_disconnect: D,
        on_notification: N,
    ) -> Result<ConnectOutcome, SessionError>
    where
        D: Fn() + Send + Sync + 'static,
        N: Fn(Bytes) + Send + Sync + 'static,
    {
        if self.inner.connecting.swap(true, Ordering::SeqCst) {
            info!("[BLE] Connection already in progress");
            return Ok(ConnectOutcome::InProgress);
        }

        let handlers = SessionHandlers {
            on_disconnect: Arc::new(on_disconnect),
            on_notification: Arc::new(on_notification),
        };

        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
        self.inner
            .session
            .lock()
            .await
            .transition(LinkEvent::ConnectRequested);

        let result = self.inner.connect_with_retries(handlers).await;
        self.inner.connecting.store(false, Ordering::SeqCst);
        result.map(ConnectOutcome::Connected)
    }

    /// Tear the session down. Safe to call at any time, never fails.
    pub async fn disconnect(&self) {
        self.inner.teardown(true).await;
    }

    /// Current link state
    pub async fn state(&self) -> LinkState {
        self.inner.session.lock().await.fsm.state()
    }

    /// Identity of the connected device, if any
    pub async fn device(&self) -> Option<DeviceInfo> {
        self.inner.session.lock().await.device.clone()
    }

    pub fn is_connecting(&self) -> bool {
        self.inner.connecting.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }
}

impl<C: LinkConnector> Inner<C> {
    async fn connect_with_retries(
        self: &Arc<Self>,
        handlers: SessionHandlers,
    ) -> Result<DeviceInfo, SessionError> {
        loop {
            match self.try_connect(&handlers).await {
                Ok(device) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.start_monitor().await;
                    info!("[BLE] Connection successful: {}", device.id);
                    return Ok(device);
                }
                Err(e) => {
                    let attempt = self.reconnect_attempts.load(Ordering::SeqCst);
                    if attempt < self.config.max_retries {
                        self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                        warn!(
                            "[BLE] {}; reconnection attempt {}/{}",
                            e,
                            attempt + 1,
                            self.config.max_retries
                        );
                        sleep(self.config.retry_delay).await;
                        continue;
                    }

                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    self.session.lock().await.transition(LinkEvent::Failed);
                    self.teardown(true).await;
                    error!("[BLE] Giving up after {} attempts: {}", attempt + 1, e);
                    return Err(SessionError::ConnectionFailed {
                        attempts: attempt + 1,
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    async fn try_connect(
        self: &Arc<Self>,
        handlers: &SessionHandlers,
    ) -> Result<DeviceInfo, SessionError> {
        // Release whatever a previous attempt or session left behind
        let previous = {
            let mut session = self.session.lock().await;
            session.stop_tasks();
            session.link.take()
        };
        if let Some(link) = previous {
            if link.is_connected().await {
                if let Err(e) = link.disconnect().await {
                    warn!("[BLE] Failed to release previous link: {}", e);
                }
                sleep(self.config.settle_delay).await;
            }
        }

        info!("[BLE] Requesting device {}...", self.config.filter.name);
        let link = Arc::new(
            self.connector
                .discover(&self.config.filter)
                .await
                .map_err(SessionError::DiscoveryFailed)?,
        );
        let device = DeviceInfo {
            id: link.id(),
            name: link.name(),
        };
        info!("[BLE] Device selected: {:?} ({})", device.name, device.id);
        self.session.lock().await.link = Some(link.clone());

        link.connect().await.map_err(SessionError::BindFailed)?;
        info!("[BLE] Connected to GATT server");

        activate_sensors(link.as_ref()).await?;
        let notify_task = bind_notifications(link.as_ref(), handlers.on_notification.clone()).await?;

        let drops = match link.disconnect_events().await {
            Ok(drops) => drops,
            Err(e) => {
                notify_task.abort();
                return Err(SessionError::NotifyFailed(e));
            }
        };
        let watch_task = spawn_disconnect_watch(
            Arc::downgrade(self),
            drops,
            handlers.on_disconnect.clone(),
        );

        let mut session = self.session.lock().await;
        session.device = Some(device.clone());
        session.handlers = Some(handlers.clone());
        session.notify_task = Some(notify_task);
        session.watch_task = Some(watch_task);
        session.transition(LinkEvent::Bound);
        Ok(device)
    }

    async fn start_monitor(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = start_monitoring(weak, self.config.liveness_interval);
        let mut session = self.session.lock().await;
        if let Some(old) = session.monitor.replace(handle) {
            old.stop();
        }
        session.transition(LinkEvent::MonitorStarted);
    }

    /// Stop tasks, release the link and clear every session field
    async fn teardown(&self, stop_monitor: bool) {
        let (link, monitor) = {
            let mut session = self.session.lock().await;
            session.stop_tasks();
            session.handlers = None;
            session.device = None;
            session.transition(LinkEvent::TornDown);
            (session.link.take(), session.monitor.take())
        };

        if let Some(monitor) = monitor {
            if stop_monitor {
                monitor.stop();
            } else {
                monitor.detach();
            }
        }

        if let Some(link) = link {
            if link.is_connected().await {
                if let Err(e) = link.disconnect().await {
                    error!("[BLE] Disconnect error: {}", e);
                }
            }
        }
        debug!("[BLE] Session cleared");
    }
}

impl<L> Session<L> {
    /// Abort notification delivery and the disconnect watch
    fn stop_tasks(&mut self) {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl<C: LinkConnector> LivenessTarget for Inner<C> {
    async fn is_live(&self) -> bool {
        !self.connecting.load(Ordering::SeqCst) && self.session.lock().await.fsm.is_live()
    }

    async fn probe(&self) -> anyhow::Result<()> {
        let link = self.session.lock().await.link.clone();
        let link = link.ok_or_else(|| anyhow!("No bound link"))?;
        link.read(gatt::SENSOR_DATA_SERVICE, gatt::SENSOR_DATA).await?;
        Ok(())
    }

    async fn recover(&self) -> anyhow::Result<()> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.rebind().await;
        self.connecting.store(false, Ordering::SeqCst);

        let mut session = self.session.lock().await;
        match result {
            Ok((link, task)) => {
                // The session may have been torn down while we were rebinding
                let current = session.link.as_ref().is_some_and(|l| Arc::ptr_eq(l, &link));
                if !current {
                    task.abort();
                    return Err(anyhow!("Session closed during reconnect"));
                }
                if let Some(old) = session.notify_task.replace(task) {
                    old.abort();
                }
                session.transition(LinkEvent::ReconnectSucceeded);
                Ok(())
            }
            Err(e) => {
                session.transition(LinkEvent::Failed);
                Err(e)
            }
        }
    }

    async fn give_up(&self) {
        let handlers = self.session.lock().await.handlers.clone();
        self.teardown(false).await;
        if let Some(handlers) = handlers {
            (handlers.on_disconnect)();
        }
    }
}

impl<C: LinkConnector> Inner<C> {
    /// Silent reconnect: rebind link, reactivate sensors, rebind notifications
    async fn rebind(&self) -> anyhow::Result<(Arc<C::Link>, JoinHandle<()>)> {
        let (link, handlers) = {
            let mut session = self.session.lock().await;
            session.transition(LinkEvent::ProbeFailed);
            (session.link.clone(), session.handlers.clone())
        };
        let (Some(link), Some(handlers)) = (link, handlers) else {
            return Err(anyhow!("No session to reconnect"));
        };

        info!("[BLE] Attempting to reconnect...");
        link.connect().await?;
        activate_sensors(link.as_ref()).await?;
        let task = bind_notifications(link.as_ref(), handlers.on_notification).await?;
        Ok((link, task))
    }
}

/// Write the enable command to each sensor group's control characteristic
async fn activate_sensors<L: DeviceLink + ?Sized>(link: &L) -> Result<(), SessionError> {
    for group in gatt::SENSOR_GROUPS {
        link.write(group.service, group.control, &gatt::ENABLE_COMMAND)
            .await
            .map_err(|source| SessionError::ActivationFailed {
                group: group.name,
                source,
            })?;
        info!("[BLE] {} sensor enabled", group.name);
    }
    Ok(())
}

/// Start notifications and forward every payload to the handler
async fn bind_notifications<L: DeviceLink + ?Sized>(
    link: &L,
    on_notification: NotificationHandler,
) -> Result<JoinHandle<()>, SessionError> {
    let mut stream = link
        .notifications(gatt::SENSOR_DATA_SERVICE, gatt::SENSOR_DATA)
        .await
        .map_err(SessionError::NotifyFailed)?;

    Ok(tokio::spawn(async move {
        while let Some(value) = stream.next().await {
            debug!("[BLE] Notification: {} bytes", value.len());
            on_notification(value);
        }
        debug!("[BLE] Notification stream ended");
    }))
}

fn spawn_disconnect_watch<C: LinkConnector>(
    inner: Weak<Inner<C>>,
    mut drops: crate::ble::DisconnectStream,
    on_disconnect: DisconnectHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while drops.next().await.is_some() {
            if let Some(inner) = inner.upgrade() {
                inner.session.lock().await.transition(LinkEvent::LinkLost);
            }
            info!("[BLE] Device disconnected");
            on_disconnect();
        }
    })
}
