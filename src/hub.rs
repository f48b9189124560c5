//! Fan-out of live readings to connected subscribers.
//!
//! Each subscriber owns a bounded queue. Broadcasting serializes the message
//! once and `try_send`s it to every queue, so a slow consumer only loses its
//! own messages and a dead one is dropped from the set on the spot. Nothing
//! is replayed to late joiners.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::models::LiveReading;

// ---

/// Messages on the live push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Connected { message: String },
    LiveReading { data: LiveReading },
}

impl HubMessage {
    // ---
    pub fn connected() -> Self {
        HubMessage::Connected {
            message: "Live feed active".to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

type Subscribers = Arc<DashMap<Uuid, mpsc::Sender<Arc<str>>>>;

#[derive(Debug, Clone)]
pub struct BroadcastHub {
    // ---
    subscribers: Subscribers,
    buffer: usize,
}

/// A registered subscriber. Dropping it unregisters it.
#[derive(Debug)]
pub struct Subscription {
    // ---
    id: Uuid,
    rx: mpsc::Receiver<Arc<str>>,
    subscribers: Subscribers,
}

impl BroadcastHub {
    // ---
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    pub fn register(&self) -> Subscription {
        // ---
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.subscribers.insert(id, tx);
        debug!(
            "Subscriber {} registered ({} open)",
            id,
            self.subscribers.len()
        );

        Subscription {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Send `message` to every open subscriber; returns how many accepted it.
    pub fn broadcast(&self, message: &HubMessage) -> usize {
        // ---
        let payload: Arc<str> = match message.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to serialize hub message: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        self.subscribers
            .retain(|id, tx| match tx.try_send(Arc::clone(&payload)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is lagging, dropping message", id);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} is gone, removing", id);
                    false
                }
            });

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Subscription {
    // ---
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next serialized message, or `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.subscribers.remove(&self.id).is_some() {
            debug!("Subscriber {} unregistered", self.id);
        }
    }
}
