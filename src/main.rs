mod ble;
mod config;
mod location;
mod pipeline;
mod relay;
mod session;

use anyhow::{anyhow, Result};
use bandi_shared::{device_topic, gatt};
use ble::{BluezConfig, BluezConnector, DiscoveryFilter};
use bytes::Bytes;
use config::{LocationMode, MonitorConfig};
use location::{
    FixedSource, GeolocationProvider, GpsdSource, LocationCache, LocationConfig, LocationStamp,
    PositionSource, UnavailableSource,
};
use pipeline::TelemetryPipeline;
use relay::{RelayChannel, RelayConfig};
use session::{ConnectOutcome, DeviceInfo, SessionConfig, SessionManager};
use std::sync::Arc;
use tokio::sync::mpsc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = MonitorConfig::from_env()?;

    info!("Bandi monitor starting");
    info!("  Device name: {}", config.device_name);
    info!("  Relay: {}", config.relay_url);

    let location = location_stamp(&config);

    let relay = Arc::new(RelayChannel::new(
        RelayConfig {
            url: config.relay_url.clone(),
            ..Default::default()
        },
        location,
    ));
    relay.connect_channel().await;
    if !relay.is_connected() {
        warn!("Relay not reachable yet, retrying in the background");
    }

    let session = SessionManager::new(
        BluezConnector::new(BluezConfig::default()),
        SessionConfig {
            filter: DiscoveryFilter {
                name: config.device_name.clone(),
                optional_services: gatt::OPTIONAL_SERVICES.to_vec(),
            },
            ..Default::default()
        },
    );

    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Bytes>();
    let (drops_tx, mut drops_rx) = mpsc::unbounded_channel::<()>();

    let device = match connect_device(&session, &frames_tx, &drops_tx).await {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to connect: {}", e);
            relay.disconnect().await;
            return Err(e);
        }
    };

    let device_id = config.device_id.clone().unwrap_or_else(|| device.id.clone());
    let topic = device_topic(&device_id);
    info!("Streaming {} as {}", device.id, topic);

    relay
        .subscribe(&topic, |data| debug!("[MAIN] Relay echo: {}", data))
        .await;

    let pipeline = Arc::new(TelemetryPipeline::new(device_id, relay.clone()));
    pipeline.report_connected().await;
    let worker = tokio::spawn(pipeline.clone().run(frames_rx));

    // Main event loop
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break Ok(());
            }
            Some(()) = drops_rx.recv() => {
                warn!("[MAIN] Device disconnected, reconnecting");
                pipeline
                    .report_disconnected(Some("Device disconnected".into()))
                    .await;

                match connect_device(&session, &frames_tx, &drops_tx).await {
                    Ok(device) => {
                        info!("[MAIN] Reconnected to {}", device.id);
                        pipeline.report_connected().await;
                    }
                    Err(e) => {
                        error!("[MAIN] Reconnect failed: {}", e);
                        break Err(e);
                    }
                }
            }
        }
    };

    session.disconnect().await;
    pipeline.report_disconnected(None).await;
    relay.unsubscribe(&topic).await;
    relay.disconnect().await;
    worker.abort();

    info!(
        "Forwarded {} samples, dropped {} frames",
        pipeline.decoded_count(),
        pipeline.dropped_count()
    );
    result
}

/// Pick the position source and stamping strategy from the configuration
fn location_stamp(config: &MonitorConfig) -> Arc<dyn LocationStamp> {
    let source: Arc<dyn PositionSource> = match (&config.gpsd_addr, config.fixed_location) {
        (Some(addr), _) => Arc::new(GpsdSource::new(addr.clone())),
        (None, Some((lat, lon))) => Arc::new(FixedSource::new(lat, lon)),
        (None, None) => Arc::new(UnavailableSource),
    };
    info!("  Location source: {}", source.name());

    let location_config = LocationConfig::default();
    let refresh = location_config.refresh_interval;
    let provider = Arc::new(GeolocationProvider::new(source, location_config));

    match config.location_mode {
        LocationMode::Cached => Arc::new(LocationCache::start(provider, refresh)),
        LocationMode::PerMessage => provider,
    }
}

/// Connect the session, feeding notifications and drops into the given channels
async fn connect_device(
    session: &SessionManager<BluezConnector>,
    frames: &mpsc::UnboundedSender<Bytes>,
    drops: &mpsc::UnboundedSender<()>,
) -> Result<DeviceInfo> {
    let frames = frames.clone();
    let drops = drops.clone();

    let outcome = session
        .connect(
            move || {
                let _ = drops.send(());
            },
            move |value| {
                let _ = frames.send(value);
            },
        )
        .await?;

    match outcome {
        ConnectOutcome::Connected(device) => Ok(device),
        ConnectOutcome::InProgress => Err(anyhow!("Connection already in progress")),
    }
}
