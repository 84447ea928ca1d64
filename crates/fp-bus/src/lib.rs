// SPDX-License-Identifier: MIT OR Apache-2.0
//! Topic-tagged reliable messaging link abstraction.
//!
//! The plane assumes a reliable, ordered-per-publisher, at-least-once,
//! topic-tagged message link; the actual transport lives outside the core.
//! [`MessageBus`] is the seam, [`LocalBus`] the in-process implementation
//! used by tests and single-host deployments.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tracing::warn;

/// One message on the link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// JSON payload.
    pub payload: Value,
}

/// Errors surfaced by a bus implementation.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The link is down or the publish was refused.
    #[error("publish failed: {0}")]
    Publish(String),
    /// Subscription could not be established.
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// The reliable topic-tagged link every component talks through.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError>;

    /// Subscribe to a set of topics.
    async fn subscribe(&self, topics: &[&str]) -> Result<Subscription, BusError>;
}

/// A live subscription; messages for non-subscribed topics are filtered out.
pub struct Subscription {
    topics: BTreeSet<String>,
    rx: broadcast::Receiver<BusMessage>,
}

impl Subscription {
    /// Next message on any subscribed topic, or `None` when the bus closed.
    ///
    /// A lagged receiver (slow consumer) skips the overwritten messages and
    /// keeps going; at-least-once delivery is the transport's concern, not
    /// this in-process stand-in's.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.topics.contains(&msg.topic) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process bus backed by a single broadcast channel.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    /// Create a bus with the given per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        // A bus with no subscribers is fine; drop like a real broker with
        // no bound consumers.
        let _ = self.tx.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topics: &[&str]) -> Result<Subscription, BusError> {
        Ok(Subscription {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            rx: self.tx.subscribe(),
        })
    }
}
