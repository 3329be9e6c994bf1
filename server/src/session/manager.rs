//! Subscription manager for tracking connected clients and their topics

use super::connection::ClientHandle;
use bandi_shared::InboundFrame;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Manages all connected clients and the topics they follow
pub struct SubscriptionManager {
    /// Map of client id -> handle
    clients: Arc<RwLock<HashMap<u64, ClientHandle>>>,
    /// Map of topic -> subscribed client ids
    topics: Arc<RwLock<HashMap<String, HashSet<u64>>>>,
}

impl SubscriptionManager {
    /// Create a new subscription manager
    pub fn new() -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a newly connected client
    pub async fn register(&self, handle: ClientHandle) {
        let mut clients = self.clients.write().await;
        clients.insert(handle.id, handle);
    }

    /// Remove a client and all of its subscriptions
    pub async fn unregister(&self, client_id: u64) {
        self.clients.write().await.remove(&client_id);

        let mut topics = self.topics.write().await;
        topics.retain(|_, subscribers| {
            subscribers.remove(&client_id);
            !subscribers.is_empty()
        });
    }

    /// Subscribe a client to a topic
    pub async fn subscribe(&self, client_id: u64, topic: &str) {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .insert(client_id);
    }

    /// Unsubscribe a client from a topic
    pub async fn unsubscribe(&self, client_id: u64, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&client_id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Deliver a frame to every subscriber of `topic`, returning how many got it
    pub async fn publish(&self, topic: &str, frame: &InboundFrame) -> usize {
        let subscribers = self.subscribers(topic).await;
        let clients = self.clients.read().await;

        let mut delivered = 0;
        for client_id in subscribers {
            let Some(handle) = clients.get(&client_id) else {
                continue;
            };
            match handle.send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to send to client {}: {}", client_id, e),
            }
        }
        debug!("Published to {} ({} subscribers)", topic, delivered);
        delivered
    }

    /// Client ids subscribed to a topic
    pub async fn subscribers(&self, topic: &str) -> Vec<u64> {
        let topics = self.topics.read().await;
        topics
            .get(topic)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Topics with at least one subscriber
    pub async fn topics(&self) -> Vec<String> {
        self.topics.read().await.keys().cloned().collect()
    }

    /// Get the number of connected clients
    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}
