//! Relay channel with topic routing and bounded reconnection

use crate::location::LocationStamp;
use bandi_shared::protocol::{self, InboundFrame, OutboundFrame};
use bandi_shared::state_machine::{
    ChannelEvent, ChannelState, ChannelStateMachine, TransitionResult,
};
use bandi_shared::timing;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Called with the `data` of every SENSOR_DATA frame routed to a topic
pub type TopicHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Configuration for the relay channel
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket URL of the relay
    pub url: String,
    /// Reconnect attempts after an abnormal close before giving up
    pub max_reconnects: u32,
    /// Fixed delay before each reconnect attempt
    pub reconnect_delay: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".into(),
            max_reconnects: timing::RELAY_MAX_RECONNECTS,
            reconnect_delay: Duration::from_millis(timing::RELAY_RECONNECT_DELAY_MS),
        }
    }
}

/// How a socket ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    /// We closed it
    Local,
    /// Peer closed with code 1000
    Normal,
    /// Any other close code, a transport error or EOF
    Abnormal(Option<CloseCode>),
}

struct Link {
    outbound: mpsc::UnboundedSender<Message>,
}

/// Socket lifecycle, guarded by one lock
struct SocketState {
    fsm: ChannelStateMachine,
    link: Option<Link>,
    /// Bumped whenever the current socket is replaced; stale sockets compare against it
    generation: u64,
    reconnect_task: Option<JoinHandle<()>>,
}

impl SocketState {
    fn transition(&mut self, event: ChannelEvent) {
        if let TransitionResult::Invalid { from, event } = self.fsm.process_event(event) {
            debug!("[RELAY] Ignoring {:?} in state {:?}", event, from);
        }
    }

    /// Close the current socket from our side, if any
    fn close_link(&mut self) {
        self.generation += 1;
        if let Some(link) = self.link.take() {
            info!("[RELAY] Closing WebSocket");
            let _ = link.outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })));
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
    }
}

struct Inner {
    config: RelayConfig,
    connected: AtomicBool,
    reconnect_attempts: AtomicU32,
    frames_sent: AtomicU64,
    subscriptions: RwLock<HashMap<String, TopicHandler>>,
    state: Mutex<SocketState>,
    location: Arc<dyn LocationStamp>,
}

/// One persistent channel to the relay backend
pub struct RelayChannel {
    inner: Arc<Inner>,
}

impl RelayChannel {
    /// Create a closed channel; `location` stamps every outbound payload
    pub fn new(config: RelayConfig, location: Arc<dyn LocationStamp>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connected: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                frames_sent: AtomicU64::new(0),
                subscriptions: RwLock::new(HashMap::new()),
                state: Mutex::new(SocketState {
                    fsm: ChannelStateMachine::new(),
                    link: None,
                    generation: 0,
                    reconnect_task: None,
                }),
                location,
            }),
        }
    }

    /// Open the socket, replacing any existing one
    ///
    /// Returns once the attempt finished. A failed open is logged and hands
    /// over to the bounded reconnect loop, so check [`is_connected`] before
    /// relying on the channel.
    ///
    /// [`is_connected`]: RelayChannel::is_connected
    pub async fn connect_channel(&self) {
        let generation = {
            let mut state = self.inner.state.lock().await;
            state.cancel_reconnect();
            state.close_link();
            state.transition(ChannelEvent::OpenRequested);
            state.generation
        };
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.reconnect_attempts.store(0, Ordering::SeqCst);

        info!("[RELAY] Connecting to WebSocket: {}", self.inner.config.url);
        match connect_async(self.inner.config.url.as_str()).await {
            Ok((socket, _)) => {
                install(&self.inner, generation, socket).await;
            }
            Err(e) => {
                warn!("[RELAY] WebSocket error: {}", e);
                let mut state = self.inner.state.lock().await;
                if state.generation == generation {
                    state.transition(ChannelEvent::OpenFailed);
                    schedule_reconnect(&self.inner, &mut state);
                }
            }
        }
    }

    /// Register the handler for `topic`, replacing any previous one
    ///
    /// Sends a SUBSCRIBE control frame when the channel is open.
    pub async fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner
            .subscriptions
            .write()
            .await
            .insert(topic.to_string(), Arc::new(handler));
        if self.is_connected() {
            self.inner.write_frame(&OutboundFrame::subscribe(topic)).await;
        }
    }

    /// Remove the handler for `topic`; sends UNSUBSCRIBE when open
    pub async fn unsubscribe(&self, topic: &str) {
        self.inner.subscriptions.write().await.remove(topic);
        if self.is_connected() {
            self.inner.write_frame(&OutboundFrame::unsubscribe(topic)).await;
        }
    }

    /// Send `{type, payload}` stamped with the current location
    ///
    /// Does nothing while the channel is not open.
    pub async fn send<T: Serialize>(&self, kind: &str, payload: &T) {
        if !self.is_connected() {
            debug!("[RELAY] Not connected, dropping {} frame", kind);
            return;
        }

        let frame = match OutboundFrame::new(kind, payload) {
            Ok(frame) => frame,
            Err(e) => {
                error!("[RELAY] Error building {} frame: {}", kind, e);
                return;
            }
        };

        let location = self.inner.location.location().await;
        let frame = frame.with_location(location.latitude, location.longitude);

        // The socket may have closed during the lookup
        if !self.is_connected() {
            debug!("[RELAY] Closed during location lookup, dropping {} frame", kind);
            return;
        }
        self.inner.write_frame(&frame).await;
    }

    /// Close the socket normally
    ///
    /// Registered topic handlers are kept for the next connection.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.cancel_reconnect();
        state.close_link();
        self.inner.connected.store(false, Ordering::SeqCst);
        state.transition(ChannelEvent::ClosedNormally);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Whether a reconnect loop is pending
    pub async fn is_reconnecting(&self) -> bool {
        self.inner.state.lock().await.reconnect_task.is_some()
    }

    pub async fn state(&self) -> ChannelState {
        self.inner.state.lock().await.fsm.state()
    }

    /// Frames written to a socket since creation
    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::SeqCst)
    }

    /// Topics with a registered handler
    pub async fn topics(&self) -> Vec<String> {
        self.inner.subscriptions.read().await.keys().cloned().collect()
    }
}

impl Inner {
    async fn write_frame(&self, frame: &OutboundFrame) {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("[RELAY] Error encoding {} frame: {}", frame.kind, e);
                return;
            }
        };

        let state = self.state.lock().await;
        match &state.link {
            Some(link) => {
                debug!("[RELAY] Sending: {}", text);
                if link.outbound.send(Message::Text(text)).is_err() {
                    warn!("[RELAY] Socket task gone, {} frame dropped", frame.kind);
                }
            }
            None => debug!("[RELAY] No socket, {} frame dropped", frame.kind),
        }
    }

    /// Route one inbound text frame to its topic handler
    async fn route_inbound(&self, text: &str) {
        let frame = match InboundFrame::from_text(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("[RELAY] Dropping unparseable frame: {}", e);
                return;
            }
        };

        if frame.is_noise() {
            return;
        }
        if frame.kind != protocol::SENSOR_DATA {
            debug!("[RELAY] Ignoring {} frame", frame.kind);
            return;
        }

        let Some(topic) = frame.topic.as_deref() else {
            debug!("[RELAY] SENSOR_DATA frame without topic");
            return;
        };
        let handler = self.subscriptions.read().await.get(topic).cloned();
        match handler {
            Some(handler) => handler(frame.data),
            None => debug!("[RELAY] No handler for topic {}", topic),
        }
    }
}

/// Make `socket` the current link unless another open superseded it
async fn install(inner: &Arc<Inner>, generation: u64, socket: Socket) -> bool {
    let mut state = inner.state.lock().await;
    if state.generation != generation {
        debug!("[RELAY] Dropping superseded socket");
        return false;
    }

    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    state.link = Some(Link { outbound });
    // A reconnect loop that reaches here is finishing; release its handle
    state.reconnect_task = None;
    inner.connected.store(true, Ordering::SeqCst);
    inner.reconnect_attempts.store(0, Ordering::SeqCst);
    state.transition(ChannelEvent::Opened);

    tokio::spawn(run_socket(Arc::downgrade(inner), generation, socket, outbound_rx));
    info!("[RELAY] WebSocket connected successfully");
    true
}

/// Pump one socket until it closes
async fn run_socket(
    inner: Weak<Inner>,
    generation: u64,
    socket: Socket,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    let (mut sink, mut stream) = socket.split();

    let close = loop {
        tokio::select! {
            msg = outbound_rx.recv() => match msg {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break CloseKind::Local;
                }
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        warn!("[RELAY] Write error: {}", e);
                        break CloseKind::Abnormal(None);
                    }
                    if let Some(inner) = inner.upgrade() {
                        inner.frames_sent.fetch_add(1, Ordering::SeqCst);
                    }
                }
                // Channel dropped
                None => break CloseKind::Local,
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.route_inbound(&text).await;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| f.code);
                    break if code == Some(CloseCode::Normal) {
                        CloseKind::Normal
                    } else {
                        CloseKind::Abnormal(code)
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[RELAY] Read error: {}", e);
                    break CloseKind::Abnormal(None);
                }
                None => break CloseKind::Abnormal(None),
            },
        }
    };

    if let Some(inner) = inner.upgrade() {
        on_closed(&inner, generation, close).await;
    }
}

async fn on_closed(inner: &Arc<Inner>, generation: u64, close: CloseKind) {
    if close == CloseKind::Local {
        return;
    }

    let mut state = inner.state.lock().await;
    if state.generation != generation {
        return;
    }
    state.link = None;
    inner.connected.store(false, Ordering::SeqCst);

    match close {
        CloseKind::Normal => {
            info!("[RELAY] WebSocket closed normally");
            state.transition(ChannelEvent::ClosedNormally);
        }
        _ => {
            warn!("[RELAY] WebSocket disconnected: {:?}", close);
            state.transition(ChannelEvent::ClosedAbnormally);
            schedule_reconnect(inner, &mut state);
        }
    }
}

/// Start the reconnect loop unless one is already pending
fn schedule_reconnect(inner: &Arc<Inner>, state: &mut SocketState) {
    if state.reconnect_task.is_some() {
        return;
    }
    state.reconnect_task = Some(tokio::spawn(reconnect_loop(Arc::downgrade(inner))));
}

/// Fixed-delay reconnect, bounded by `max_reconnects`
async fn reconnect_loop(inner: Weak<Inner>) {
    loop {
        let delay = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().await;
            let attempts = inner.reconnect_attempts.load(Ordering::SeqCst);
            if attempts >= inner.config.max_reconnects {
                warn!("[RELAY] Giving up after {} reconnect attempts", attempts);
                state.transition(ChannelEvent::RetriesExhausted);
                state.reconnect_task = None;
                return;
            }

            let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            state.transition(ChannelEvent::ReconnectScheduled);
            info!(
                "[RELAY] Attempting to reconnect ({}/{})...",
                attempt, inner.config.max_reconnects
            );
            inner.config.reconnect_delay
        };

        sleep(delay).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let generation = {
            let mut state = inner.state.lock().await;
            state.generation += 1;
            state.transition(ChannelEvent::OpenRequested);
            state.generation
        };

        match connect_async(inner.config.url.as_str()).await {
            Ok((socket, _)) => {
                install(&inner, generation, socket).await;
                return;
            }
            Err(e) => {
                warn!("[RELAY] Reconnection failed: {}", e);
                let mut state = inner.state.lock().await;
                if state.generation != generation {
                    return;
                }
                state.transition(ChannelEvent::OpenFailed);
            }
        }
    }
}
