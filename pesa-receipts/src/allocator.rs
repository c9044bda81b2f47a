use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::NewReceipt;
use crate::ReceiptClient;
use crate::ReceiptUpdate;
use crate::ReceiptsError;
use crate::ReceiptsResult;
use pesa_protocol::ReceiptCode;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    /// Periodic flush tick for both batchers.
    pub flush_interval: Duration,
    /// Reaching this many pending creates triggers an immediate flush.
    pub create_batch_size: usize,
    /// Reaching this many pending updates triggers an immediate flush.
    pub update_batch_size: usize,
    /// Deadline for one downstream batch RPC.
    pub rpc_timeout: Duration,
    /// How long a caller waits for its receipt code.
    pub allocation_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            create_batch_size: 50,
            update_batch_size: 50,
            rpc_timeout: Duration::from_secs(5),
            allocation_timeout: Duration::from_secs(2),
        }
    }
}

struct PendingCreate {
    request: NewReceipt,
    reply: oneshot::Sender<ReceiptsResult<ReceiptCode>>,
}

/// Owns the CREATE and UPDATE batchers over the downstream receipt
/// service. Submissions append under a mutex; a flush swaps the slice
/// out and issues one batch RPC. Every submitted create receives its
/// code or an error exactly once; updates are idempotent by receipt
/// code and re-queued on failure for the next tick.
pub struct ReceiptAllocator {
    client: Arc<dyn ReceiptClient>,
    config: BatcherConfig,
    creates: Mutex<Vec<PendingCreate>>,
    updates: Mutex<Vec<ReceiptUpdate>>,
    create_kick: Notify,
    update_kick: Notify,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReceiptAllocator {
    #[must_use]
    pub fn new(client: Arc<dyn ReceiptClient>, config: BatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            creates: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            create_kick: Notify::new(),
            update_kick: Notify::new(),
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the two flush workers, one per direction.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }

        let create_side = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(create_side.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = create_side.cancel.cancelled() => break,
                    _ = ticker.tick() => create_side.flush_creates().await,
                    _ = create_side.create_kick.notified() => create_side.flush_creates().await,
                }
            }
        }));

        let update_side = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(update_side.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = update_side.cancel.cancelled() => break,
                    _ = ticker.tick() => update_side.flush_updates().await,
                    _ = update_side.update_kick.notified() => update_side.flush_updates().await,
                }
            }
        }));
    }

    /// Requests one receipt code. Blocks until the batcher delivers the
    /// code or an error, bounded by the allocation timeout.
    pub async fn allocate(&self, request: NewReceipt) -> ReceiptsResult<ReceiptCode> {
        if self.cancel.is_cancelled() {
            return Err(ReceiptsError::ShuttingDown);
        }

        let (reply, result) = oneshot::channel();
        let kick = {
            let mut pending = self.creates.lock().await;
            pending.push(PendingCreate { request, reply });
            pending.len() >= self.config.create_batch_size
        };
        if kick {
            self.create_kick.notify_one();
        }

        match tokio::time::timeout(self.config.allocation_timeout, result).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ReceiptsError::Client(
                "allocator dropped the pending request".into(),
            )),
            Err(_) => Err(ReceiptsError::Timeout),
        }
    }

    /// Queues a receipt status update for the next flush.
    pub async fn enqueue_update(&self, update: ReceiptUpdate) {
        let kick = {
            let mut pending = self.updates.lock().await;
            pending.push(update);
            pending.len() >= self.config.update_batch_size
        };
        if kick {
            self.update_kick.notify_one();
        }
    }

    pub async fn pending_updates(&self) -> usize {
        self.updates.lock().await.len()
    }

    /// Stops the workers and drains both batchers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().await;
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
        self.flush_creates().await;
        self.flush_updates().await;
    }

    async fn flush_creates(&self) {
        let batch: Vec<PendingCreate> = {
            let mut pending = self.creates.lock().await;
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return;
        }

        let requests: Vec<NewReceipt> = batch.iter().map(|item| item.request.clone()).collect();
        let outcome =
            tokio::time::timeout(self.config.rpc_timeout, self.client.create_batch(requests)).await;

        match outcome {
            Ok(Ok(codes)) if codes.len() == batch.len() => {
                for (item, code) in batch.into_iter().zip(codes) {
                    let _ = item.reply.send(Ok(code));
                }
            }
            Ok(Ok(codes)) => {
                warn!(
                    expected = batch.len(),
                    received = codes.len(),
                    "receipt create batch returned a mismatched result size"
                );
                for item in batch {
                    let _ = item.reply.send(Err(ReceiptsError::Client(
                        "create batch returned a mismatched result size".into(),
                    )));
                }
            }
            Ok(Err(err)) => {
                warn!(error = %err, "receipt create batch failed");
                let message = err.to_string();
                for item in batch {
                    let _ = item.reply.send(Err(ReceiptsError::Client(message.clone())));
                }
            }
            Err(_) => {
                warn!("receipt create batch timed out");
                for item in batch {
                    let _ = item
                        .reply
                        .send(Err(ReceiptsError::Client("create batch timed out".into())));
                }
            }
        }
    }

    async fn flush_updates(&self) {
        let batch: Vec<ReceiptUpdate> = {
            let mut pending = self.updates.lock().await;
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return;
        }

        let outcome = tokio::time::timeout(
            self.config.rpc_timeout,
            self.client.update_batch(batch.clone()),
        )
        .await;

        let failed = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => {
                warn!(error = %err, count = batch.len(), "receipt update batch failed; re-queueing");
                batch
            }
            Err(_) => {
                warn!(count = batch.len(), "receipt update batch timed out; re-queueing");
                batch
            }
        };

        // Updates are idempotent by receipt code, so the whole batch is
        // retried at the next tick ahead of newer submissions.
        let mut pending = self.updates.lock().await;
        let newer: Vec<ReceiptUpdate> = pending.drain(..).collect();
        *pending = failed;
        pending.extend(newer);
    }
}
