mod session;

use session::{dispatch, ClientSession, SubscriptionManager};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let addr = std::env::var("HUB_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.into());
    let listener = TcpListener::bind(&addr).await?;
    info!("Relay hub listening on {}", addr);

    let manager = Arc::new(SubscriptionManager::new());
    let next_id = AtomicU64::new(1);

    loop {
        let (socket, addr) = listener.accept().await?;
        let id = next_id.fetch_add(1, Ordering::SeqCst);
        let manager = manager.clone();

        tokio::spawn(async move {
            handle_client(socket, addr, id, manager).await;
        });
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    id: u64,
    manager: Arc<SubscriptionManager>,
) {
    let ws = match accept_async(socket).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };
    info!("[{}] Connection from: {}", id, addr);

    let mut session = ClientSession::new(ws, id, addr);
    let connected_at = session.handle.connected_at;
    manager.register(session.get_handle()).await;

    while let Some(frame) = session.recv().await {
        dispatch(&frame, id, &manager).await;
    }

    manager.unregister(id).await;
    info!(
        "[{}] Client disconnected: {} after {:?} ({} clients left)",
        id,
        addr,
        connected_at.elapsed(),
        manager.count().await
    );
}
