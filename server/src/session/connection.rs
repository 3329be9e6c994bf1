//! Individual client connection handling

use super::manager::SubscriptionManager;
use anyhow::{anyhow, Result};
use bandi_shared::protocol::{self, ControlPayload};
use bandi_shared::{device_topic, InboundFrame, OutboundFrame};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

/// Handle to send frames to a specific client
#[derive(Clone, Debug)]
pub struct ClientHandle {
    pub id: u64,
    pub addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    pub connected_at: Instant,
}

impl ClientHandle {
    pub fn new(id: u64, addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            addr,
            outbound,
            connected_at: Instant::now(),
        }
    }

    /// Queue a frame for this client
    pub fn send(&self, frame: &InboundFrame) -> Result<()> {
        let text = frame.to_text()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| anyhow!("Client {} writer closed", self.id))
    }
}

/// Active client connection
pub struct ClientSession {
    pub handle: ClientHandle,
    reader: SplitStream<WebSocketStream<TcpStream>>,
}

impl ClientSession {
    /// Wrap an accepted WebSocket and start its writer task
    pub fn new(ws: WebSocketStream<TcpStream>, id: u64, addr: SocketAddr) -> Self {
        let (mut sink, reader) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!("Write error to {}: {}", addr, e);
                    break;
                }
            }
        });

        Self {
            handle: ClientHandle::new(id, addr, outbound),
            reader,
        }
    }

    /// Get a cloneable handle for sending frames
    pub fn get_handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Read the next frame from this client
    /// Returns None once the connection is closed
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        loop {
            match self.reader.next().await? {
                Ok(Message::Text(text)) => match OutboundFrame::from_text(&text) {
                    Ok(frame) => return Some(frame),
                    Err(e) => warn!("Decode error from {}: {}", self.handle.addr, e),
                },
                Ok(Message::Close(frame)) => {
                    debug!("Close from {}: {:?}", self.handle.addr, frame);
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Read error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }
        }
    }
}

/// What the hub did with a client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Subscribed(String),
    Unsubscribed(String),
    Published { topic: String, delivered: usize },
    Ignored,
}

/// Apply one client frame to the subscription registry
pub async fn dispatch(frame: &OutboundFrame, client_id: u64, manager: &SubscriptionManager) -> Routed {
    match frame.kind.as_str() {
        protocol::SUBSCRIBE | protocol::UNSUBSCRIBE => {
            let control: ControlPayload = match serde_json::from_value(frame.payload.clone()) {
                Ok(control) => control,
                Err(e) => {
                    warn!("[{}] Bad {} payload: {}", client_id, frame.kind, e);
                    return Routed::Ignored;
                }
            };
            if frame.kind == protocol::SUBSCRIBE {
                manager.subscribe(client_id, &control.topic).await;
                info!("[{}] SUBSCRIBE {}", client_id, control.topic);
                Routed::Subscribed(control.topic)
            } else {
                manager.unsubscribe(client_id, &control.topic).await;
                info!("[{}] UNSUBSCRIBE {}", client_id, control.topic);
                Routed::Unsubscribed(control.topic)
            }
        }
        protocol::SENSOR_DATA => {
            let device_id = frame
                .payload_object()
                .and_then(|p| p.get("deviceId"))
                .and_then(|v| v.as_str());
            let Some(device_id) = device_id else {
                warn!("[{}] SENSOR_DATA without deviceId", client_id);
                return Routed::Ignored;
            };

            let topic = device_topic(device_id);
            let delivered = manager
                .publish(&topic, &InboundFrame::sensor_data(topic.clone(), frame.payload.clone()))
                .await;
            debug!("[{}] SENSOR_DATA {} -> {} subscribers", client_id, topic, delivered);
            Routed::Published { topic, delivered }
        }
        protocol::DEVICE_STATUS => {
            let payload = frame.payload_object();
            info!(
                "[{}] DEVICE_STATUS: device={} status={}",
                client_id,
                payload.and_then(|p| p.get("deviceId")).unwrap_or(&serde_json::Value::Null),
                payload.and_then(|p| p.get("connectionStatus")).unwrap_or(&serde_json::Value::Null),
            );
            Routed::Ignored
        }
        other => {
            debug!("[{}] Unhandled frame type {}", client_id, other);
            Routed::Ignored
        }
    }
}
