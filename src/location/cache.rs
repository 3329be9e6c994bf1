//! Last-known location cache
//!
//! Refreshed on its own timer so relay sends read coordinates without
//! waiting on a lookup.

use crate::location::provider::{GeolocationProvider, Location, LocationStamp};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

pub struct LocationCache {
    rx: watch::Receiver<Location>,
    task: JoinHandle<()>,
}

impl LocationCache {
    /// Start refreshing from `provider` every `period`, beginning immediately
    ///
    /// A failed refresh keeps the previous fix. Refreshing stops when the
    /// cache is dropped.
    pub fn start(provider: Arc<GeolocationProvider>, period: Duration) -> Self {
        let (tx, rx) = watch::channel(Location::unknown());

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let location = provider.get_current_location().await;
                if !location.is_known() {
                    debug!("[GEO] Refresh failed, keeping last known location");
                    continue;
                }
                tx.send_if_modified(|current| {
                    let changed = *current != location;
                    *current = location;
                    changed
                });
            }
        });

        Self { rx, task }
    }

    /// Last known location, unknown until the first successful refresh
    pub fn current(&self) -> Location {
        *self.rx.borrow()
    }

    /// Watch location changes
    pub fn subscribe(&self) -> watch::Receiver<Location> {
        self.rx.clone()
    }
}

impl Drop for LocationCache {
    fn drop(&mut self) {
        self.task.abort();
        info!("[GEO] Location cache stopped");
    }
}

#[async_trait]
impl LocationStamp for LocationCache {
    async fn location(&self) -> Location {
        self.current()
    }
}
