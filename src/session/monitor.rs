//! Liveness Monitor
//!
//! Runs a background task that periodically probes the device link and
//! escalates from a silent reconnect to a full teardown when probing fails.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Something the monitor can probe and recover
#[async_trait]
pub trait LivenessTarget: Send + Sync + 'static {
    /// Whether the link is believed connected and not mid-connect
    async fn is_live(&self) -> bool;

    /// Lightweight round-trip against the bound characteristic
    async fn probe(&self) -> Result<()>;

    /// Rebind the link without tearing down session state
    async fn recover(&self) -> Result<()>;

    /// Full teardown after recovery failed; notifies the owner
    async fn give_up(&self);
}

/// Outcome of one monitor tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Link not believed connected, nothing probed
    Skipped,
    Healthy,
    Recovered,
    GaveUp,
}

/// Run one probe cycle against a target
pub async fn check_once<T: LivenessTarget + ?Sized>(target: &T) -> ProbeOutcome {
    if !target.is_live().await {
        return ProbeOutcome::Skipped;
    }

    let Err(e) = target.probe().await else {
        return ProbeOutcome::Healthy;
    };
    warn!("[LIVENESS] Connection check failed: {}", e);

    match target.recover().await {
        Ok(()) => {
            info!("[LIVENESS] Reconnection successful");
            ProbeOutcome::Recovered
        }
        Err(e) => {
            error!("[LIVENESS] Reconnection failed: {}", e);
            target.give_up().await;
            ProbeOutcome::GaveUp
        }
    }
}

/// Handle to a running liveness monitor
pub struct MonitorHandle {
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor
    pub fn stop(self) {
        self.task.abort();
    }

    /// Let the monitor task finish on its own
    pub fn detach(self) {
        drop(self.task);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start probing `target` every `period`
///
/// The first probe happens one full period after start. The monitor ends
/// when the target is dropped or after it gives up.
pub fn start_monitoring<T: LivenessTarget>(target: Weak<T>, period: Duration) -> MonitorHandle {
    let task = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(target) = target.upgrade() else {
                break;
            };
            if check_once(target.as_ref()).await == ProbeOutcome::GaveUp {
                break;
            }
        }

        info!("[LIVENESS] Monitoring stopped");
    });

    MonitorHandle { task }
}
