#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Event bus seam. The engine publishes one envelope per settled
//! transaction, keyed by receipt code; embedders subscribe to fan the
//! stream out to whatever transport they run.

use std::sync::Arc;

use async_trait::async_trait;
use pesa_protocol::EventEnvelope;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

pub type EventsResult<T> = Result<T, EventsError>;

#[derive(Debug, thiserror::Error)]
pub enum EventsError {
    #[error("publish failed: {0}")]
    Publish(String),
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope) -> EventsResult<()>;
}

/// Broadcast-backed bus. Publishing without subscribers is not an
/// error; the envelope is simply dropped.
pub struct BroadcastEventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> EventsResult<()> {
        match self.sender.send(envelope) {
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(receipt_code = %err.0.receipt_code, "event published with no subscribers");
                Ok(())
            }
        }
    }
}

/// Records every published envelope; used by tests to assert on the
/// stream.
#[derive(Default)]
pub struct RecordingEventBus {
    events: RwLock<Vec<EventEnvelope>>,
}

impl RecordingEventBus {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<EventEnvelope> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, envelope: EventEnvelope) -> EventsResult<()> {
        self.events.write().await.push(envelope);
        Ok(())
    }
}
