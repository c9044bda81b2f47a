#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Notification fan-out. The engine enqueues one notification per
//! non-system owner touched by a transaction; the batcher coalesces
//! them by `(owner_type, owner_id)` inside each flush window and sends
//! one bulk call downstream. Notifications are a degraded side effect:
//! a failed send is logged and dropped, never retried into the commit
//! path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use pesa_protocol::DrCr;
use pesa_protocol::ExternalId;
use pesa_protocol::OwnerType;
use pesa_protocol::ReceiptCode;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification service error: {0}")]
    Client(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub owner_type: OwnerType,
    pub owner_id: ExternalId,
    pub receipt_code: ReceiptCode,
    /// Side observed from the owner's account: credits read as money
    /// in, debits as money out.
    pub dr_cr: DrCr,
    pub amount_minor: i64,
    pub currency: String,
    pub body: String,
}

impl Notification {
    #[must_use]
    pub fn coalesce_key(&self) -> (OwnerType, &str) {
        (self.owner_type, self.owner_id.as_str())
    }
}

#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn send_batch(&self, notifications: Vec<Notification>) -> NotifyResult<()>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub rpc_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            batch_size: 50,
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

/// Coalescing batcher over the downstream notification service.
pub struct NotificationBatcher {
    client: Arc<dyn NotificationClient>,
    config: NotifierConfig,
    pending: Mutex<IndexMap<(OwnerType, ExternalId), Notification>>,
    kick: Notify,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationBatcher {
    #[must_use]
    pub fn new(client: Arc<dyn NotificationClient>, config: NotifierConfig) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            pending: Mutex::new(IndexMap::new()),
            kick: Notify::new(),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let batcher = Arc::clone(self);
        *worker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(batcher.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = batcher.cancel.cancelled() => break,
                    _ = ticker.tick() => batcher.flush().await,
                    _ = batcher.kick.notified() => batcher.flush().await,
                }
            }
        }));
    }

    /// Queues a notification. A newer notification for the same owner
    /// within the flush window replaces the older one.
    pub async fn enqueue(&self, notification: Notification) {
        let kick = {
            let mut pending = self.pending.lock().await;
            let key = (notification.owner_type, notification.owner_id.clone());
            pending.insert(key, notification);
            pending.len() >= self.config.batch_size
        };
        if kick {
            self.kick.notify_one();
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = { self.worker.lock().await.take() };
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        self.flush().await;
    }

    async fn flush(&self) {
        let batch: Vec<Notification> = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending).into_values().collect()
        };
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let outcome =
            tokio::time::timeout(self.config.rpc_timeout, self.client.send_batch(batch)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(error = %err, count, "notification batch failed; dropping");
            }
            Err(_) => {
                warn!(count, "notification batch timed out; dropping");
            }
        }
    }
}

/// Records batches instead of delivering them; used in tests.
#[derive(Default)]
pub struct RecordingNotificationClient {
    batches: Mutex<Vec<Vec<Notification>>>,
}

impl RecordingNotificationClient {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn batches(&self) -> Vec<Vec<Notification>> {
        self.batches.lock().await.clone()
    }

    pub async fn all(&self) -> Vec<Notification> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl NotificationClient for RecordingNotificationClient {
    async fn send_batch(&self, notifications: Vec<Notification>) -> NotifyResult<()> {
        self.batches.lock().await.push(notifications);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn notification(owner_id: &str, amount_minor: i64) -> Notification {
        Notification {
            owner_type: OwnerType::User,
            owner_id: owner_id.into(),
            receipt_code: "RCPT-1".into(),
            dr_cr: DrCr::Cr,
            amount_minor,
            currency: "USD".into(),
            body: format!("You received {amount_minor} minor units"),
        }
    }

    fn quick_config() -> NotifierConfig {
        NotifierConfig {
            flush_interval: Duration::from_millis(10),
            batch_size: 50,
            rpc_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn flushes_on_tick() {
        let client = RecordingNotificationClient::shared();
        let batcher = NotificationBatcher::new(client.clone(), quick_config());
        batcher.start().await;

        batcher.enqueue(notification("u1", 100)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.all().await.len(), 1);
        batcher.shutdown().await;
    }

    #[tokio::test]
    async fn coalesces_by_owner_within_window() {
        let client = RecordingNotificationClient::shared();
        let batcher = NotificationBatcher::new(
            client.clone(),
            NotifierConfig {
                flush_interval: Duration::from_secs(30),
                ..quick_config()
            },
        );
        batcher.start().await;

        batcher.enqueue(notification("u1", 100)).await;
        batcher.enqueue(notification("u1", 250)).await;
        batcher.enqueue(notification("u2", 300)).await;
        assert_eq!(batcher.pending_count().await, 2);

        batcher.shutdown().await;
        let sent = client.all().await;
        assert_eq!(sent.len(), 2);
        // The later notification for u1 replaced the earlier one.
        assert_eq!(sent[0].owner_id, "u1");
        assert_eq!(sent[0].amount_minor, 250);
        assert_eq!(sent[1].owner_id, "u2");
    }

    #[tokio::test]
    async fn batch_size_triggers_immediate_flush() {
        let client = RecordingNotificationClient::shared();
        let batcher = NotificationBatcher::new(
            client.clone(),
            NotifierConfig {
                flush_interval: Duration::from_secs(30),
                batch_size: 2,
                ..quick_config()
            },
        );
        batcher.start().await;

        batcher.enqueue(notification("u1", 100)).await;
        batcher.enqueue(notification("u2", 200)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.all().await.len(), 2);
        batcher.shutdown().await;
    }

    struct FailingClient;

    #[async_trait]
    impl NotificationClient for FailingClient {
        async fn send_batch(&self, _notifications: Vec<Notification>) -> NotifyResult<()> {
            Err(NotifyError::Client("downstream unavailable".into()))
        }
    }

    #[tokio::test]
    async fn failed_batches_are_dropped_not_requeued() {
        let batcher = NotificationBatcher::new(Arc::new(FailingClient), quick_config());
        batcher.start().await;

        batcher.enqueue(notification("u1", 100)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(batcher.pending_count().await, 0);

        batcher.shutdown().await;
    }
}
