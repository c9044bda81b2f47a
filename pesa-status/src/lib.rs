#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Per-receipt status tracking across three tiers: an in-process map
//! (owner of truth while the receipt is hot), the shared store (24-hour
//! TTL), and the database (journal by external reference, then the
//! receipt service). Reads consult the tiers in order and promote what
//! they find upward; writes land in the map synchronously and are
//! batched into pipelined shared-store writes by a background worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use pesa_cache::SharedStore;
use pesa_cache::StoreEntry;
use pesa_cache::keys;
use pesa_cache::ttl;
use pesa_ledger::JournalStore;
use pesa_protocol::ReceiptCode;
use pesa_protocol::TransactionStatus;
use pesa_receipts::ReceiptClient;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

pub type StatusResult<T> = Result<T, StatusError>;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub receipt_code: ReceiptCode,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusRecord {
    fn new(receipt_code: impl Into<ReceiptCode>, status: TransactionStatus) -> Self {
        Self {
            receipt_code: receipt_code.into(),
            status,
            transaction_id: None,
            message: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub channel_capacity: usize,
    pub batch_threshold: usize,
    pub flush_interval: Duration,
    pub shared_ttl: Duration,
    /// How long an entry stays in the in-process map after its last
    /// update.
    pub local_retention: Duration,
    pub janitor_interval: Duration,
    /// Deadline for the direct shared-store write taken when the
    /// update channel is full.
    pub direct_write_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_000,
            batch_threshold: 100,
            flush_interval: Duration::from_millis(200),
            shared_ttl: ttl::STATUS,
            local_retention: Duration::from_secs(10 * 60),
            janitor_interval: Duration::from_secs(60),
            direct_write_timeout: Duration::from_secs(2),
        }
    }
}

pub struct StatusTracker {
    local: RwLock<HashMap<ReceiptCode, StatusRecord>>,
    shared: Arc<dyn SharedStore>,
    journals: Arc<dyn JournalStore>,
    receipts: Arc<dyn ReceiptClient>,
    sender: mpsc::Sender<StatusRecord>,
    receiver: Mutex<Option<mpsc::Receiver<StatusRecord>>>,
    config: TrackerConfig,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StatusTracker {
    #[must_use]
    pub fn new(
        shared: Arc<dyn SharedStore>,
        journals: Arc<dyn JournalStore>,
        receipts: Arc<dyn ReceiptClient>,
        config: TrackerConfig,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        Arc::new(Self {
            local: RwLock::new(HashMap::new()),
            shared,
            journals,
            receipts,
            sender,
            receiver: Mutex::new(Some(receiver)),
            config,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the write-back worker and the janitor.
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }

        let Some(mut receiver) = self.receiver.lock().await.take() else {
            return;
        };
        let write_back = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            let mut buffer: Vec<StatusRecord> = Vec::new();
            let mut ticker = tokio::time::interval(write_back.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = write_back.cancel.cancelled() => break,
                    _ = ticker.tick() => write_back.flush(&mut buffer).await,
                    received = receiver.recv() => match received {
                        Some(record) => {
                            buffer.push(record);
                            if buffer.len() >= write_back.config.batch_threshold {
                                write_back.flush(&mut buffer).await;
                            }
                        }
                        None => break,
                    },
                }
            }
            // Drain whatever arrived before the stop signal.
            while let Ok(record) = receiver.try_recv() {
                buffer.push(record);
            }
            write_back.flush(&mut buffer).await;
        }));

        let janitor = Arc::clone(self);
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(janitor.config.janitor_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = janitor.cancel.cancelled() => break,
                    _ = ticker.tick() => janitor.sweep().await,
                }
            }
        }));
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().await;
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Starts tracking a receipt at the given status.
    pub async fn track(&self, receipt_code: impl Into<ReceiptCode>, status: TransactionStatus) {
        self.write(StatusRecord::new(receipt_code, status)).await;
    }

    pub async fn update(
        &self,
        receipt_code: impl Into<ReceiptCode>,
        status: TransactionStatus,
        transaction_id: Option<i64>,
        message: Option<String>,
    ) {
        let mut record = StatusRecord::new(receipt_code, status);
        record.transaction_id = transaction_id;
        record.message = message;
        self.write(record).await;
    }

    pub async fn get(&self, receipt_code: &str) -> StatusResult<Option<TransactionStatus>> {
        Ok(self
            .get_full(receipt_code)
            .await?
            .map(|record| record.status))
    }

    pub async fn exists(&self, receipt_code: &str) -> StatusResult<bool> {
        Ok(self.get_full(receipt_code).await?.is_some())
    }

    /// Reads through the tiers, promoting whatever is found upward.
    pub async fn get_full(&self, receipt_code: &str) -> StatusResult<Option<StatusRecord>> {
        if let Some(record) = self.local.read().await.get(receipt_code) {
            return Ok(Some(record.clone()));
        }

        let key = keys::transaction_status(receipt_code);
        match pesa_cache::get_json::<StatusRecord>(self.shared.as_ref(), &key).await {
            Ok(Some(record)) => {
                self.promote_local(record.clone()).await;
                return Ok(Some(record));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(receipt_code, error = %err, "shared status read failed; falling through");
            }
        }

        self.read_authoritative(receipt_code).await
    }

    /// Database tier: a durable journal means the transaction
    /// completed; otherwise the receipt service holds the last word.
    async fn read_authoritative(&self, receipt_code: &str) -> StatusResult<Option<StatusRecord>> {
        let journal = self
            .journals
            .journal_by_external_reference(receipt_code)
            .await
            .map_err(|err| StatusError::Lookup(err.to_string()))?;
        if let Some(journal) = journal {
            let mut record = StatusRecord::new(receipt_code, TransactionStatus::Completed);
            record.transaction_id = Some(journal.id);
            self.promote_shared(&record).await;
            self.promote_local(record.clone()).await;
            return Ok(Some(record));
        }

        let receipt = self
            .receipts
            .receipt(receipt_code)
            .await
            .map_err(|err| StatusError::Lookup(err.to_string()))?;
        if let Some(receipt) = receipt {
            let mut record = StatusRecord::new(receipt_code, receipt.status);
            record.message = receipt.failure_reason;
            self.promote_shared(&record).await;
            self.promote_local(record.clone()).await;
            return Ok(Some(record));
        }

        Ok(None)
    }

    async fn write(&self, record: StatusRecord) {
        self.promote_local(record.clone()).await;

        if let Err(err) = self.sender.try_send(record) {
            let record = match err {
                mpsc::error::TrySendError::Full(record) => record,
                mpsc::error::TrySendError::Closed(record) => record,
            };
            // Channel under pressure (or already stopped): fall back to
            // a bounded direct write so the shared tier stays close.
            let key = keys::transaction_status(&record.receipt_code);
            let write = pesa_cache::set_json(
                self.shared.as_ref(),
                &key,
                &record,
                Some(self.config.shared_ttl),
            );
            match tokio::time::timeout(self.config.direct_write_timeout, write).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(receipt_code = %record.receipt_code, error = %err, "direct status write failed");
                }
                Err(_) => {
                    warn!(receipt_code = %record.receipt_code, "direct status write timed out");
                }
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<StatusRecord>) {
        if buffer.is_empty() {
            return;
        }
        let mut entries = Vec::with_capacity(buffer.len());
        for record in buffer.iter() {
            match serde_json::to_string(record) {
                Ok(value) => entries.push(StoreEntry {
                    key: keys::transaction_status(&record.receipt_code),
                    value,
                    ttl: Some(self.config.shared_ttl),
                }),
                Err(err) => {
                    warn!(receipt_code = %record.receipt_code, error = %err, "failed to encode status record");
                }
            }
        }
        buffer.clear();
        if let Err(err) = self.shared.set_many(entries).await {
            // The map still holds these records and the database stays
            // authoritative; the shared tier will catch up on the next
            // write for each receipt.
            warn!(error = %err, "pipelined status write-back failed");
        }
    }

    async fn sweep(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.local_retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let mut local = self.local.write().await;
        let before = local.len();
        local.retain(|_, record| record.updated_at > cutoff);
        let removed = before - local.len();
        if removed > 0 {
            debug!(removed, remaining = local.len(), "status janitor sweep");
        }
    }

    async fn promote_local(&self, record: StatusRecord) {
        let mut local = self.local.write().await;
        local.insert(record.receipt_code.clone(), record);
    }

    async fn promote_shared(&self, record: &StatusRecord) {
        let key = keys::transaction_status(&record.receipt_code);
        if let Err(err) = pesa_cache::set_json(
            self.shared.as_ref(),
            &key,
            record,
            Some(self.config.shared_ttl),
        )
        .await
        {
            warn!(receipt_code = %record.receipt_code, error = %err, "status promotion to shared store failed");
        }
    }

    pub async fn local_len(&self) -> usize {
        self.local.read().await.len()
    }
}
