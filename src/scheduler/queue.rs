//! Bounded insert queue and the batch writer draining it into the sink.

use crate::db::{Record, Sink, SinkError};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};

/// Queue error types.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("insert queue full ({limit} records pending)")]
    Full { limit: usize },
}

/// Records waiting to be inserted, shared by every poller.
///
/// Never holds more than `limit` records. When full, new records are
/// rejected so the older ones already queued are kept.
///
/// The limit covers queued records only. A batch being delivered (or
/// retried) has already been drained, so up to `limit + batch_size` records
/// can be held in memory at once.
pub struct InsertQueue {
    pending: Mutex<VecDeque<Record>>,
    limit: usize,
    batch_size: usize,
    ready: Notify,
}

impl InsertQueue {
    pub fn new(limit: usize, batch_size: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::with_capacity(limit)),
            limit,
            batch_size: batch_size.max(1),
            ready: Notify::new(),
        }
    }

    /// Append a record without blocking.
    pub fn enqueue(&self, record: Record) -> Result<(), QueueError> {
        let len = {
            let mut pending = self.lock();
            if pending.len() >= self.limit {
                drop(pending);
                tracing::warn!(
                    "Insert queue full ({} records), dropping record for {}",
                    self.limit,
                    record.name
                );
                return Err(QueueError::Full { limit: self.limit });
            }
            pending.push_back(record);
            pending.len()
        };

        if len >= self.batch_size {
            self.ready.notify_one();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Remove up to `max` records from the front of the queue.
    pub fn drain(&self, max: usize) -> Vec<Record> {
        let mut pending = self.lock();
        let n = max.min(pending.len());
        pending.drain(..n).collect()
    }

    /// Wait until a full batch is pending.
    async fn batch_ready(&self) {
        self.ready.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Record>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How the batch writer talks to the sink.
#[derive(Debug, Clone)]
pub struct InsertPolicy {
    pub table: String,
    pub batch_size: usize,
    /// Retries after the first failed attempt.
    pub retries: u32,
    pub retry_delay: Duration,
    pub insert_timeout: Duration,
    pub flush_interval: Duration,
}

/// Outcome of handing one batch to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered { attempts: u32 },
    Dropped { attempts: u32 },
}

/// Run the batch writer until `stop_rx` fires, then flush what's left.
pub async fn run_batch_writer(
    queue: Arc<InsertQueue>,
    sink: Arc<dyn Sink>,
    policy: InsertPolicy,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(policy.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {}
            _ = queue.batch_ready() => {}
        }
        flush_queue(&queue, sink.as_ref(), &policy).await;
    }

    let remaining = queue.len();
    if remaining > 0 {
        tracing::info!("Flushing {} queued records before exit", remaining);
        let final_policy = InsertPolicy {
            retries: 0,
            ..policy.clone()
        };
        flush_queue(&queue, sink.as_ref(), &final_policy).await;
    }
}

/// Deliver the records queued right now, one batch at a time.
async fn flush_queue(queue: &InsertQueue, sink: &dyn Sink, policy: &InsertPolicy) {
    let mut remaining = queue.len();
    while remaining > 0 {
        let batch = queue.drain(policy.batch_size.min(remaining));
        if batch.is_empty() {
            break;
        }
        remaining -= batch.len();
        deliver(sink, policy, &batch).await;
    }
}

/// Insert one batch, retrying transient failures up to `policy.retries` times.
pub async fn deliver(sink: &dyn Sink, policy: &InsertPolicy, batch: &[Record]) -> Delivery {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let insert = sink.insert(&policy.table, batch);
        let result = match tokio::time::timeout(policy.insert_timeout, insert).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Transient(format!(
                "insert timed out after {:?}",
                policy.insert_timeout
            ))),
        };

        match result {
            Ok(()) => {
                tracing::debug!("Inserted {} records into {}", batch.len(), policy.table);
                return Delivery::Delivered { attempts };
            }
            Err(e) if e.is_retriable() && attempts <= policy.retries => {
                tracing::warn!(
                    "Insert of {} records failed (attempt {}/{}): {}",
                    batch.len(),
                    attempts,
                    policy.retries + 1,
                    e
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(e) => {
                tracing::error!(
                    "Dropping batch of {} records after {} attempt(s): {}",
                    batch.len(),
                    attempts,
                    e
                );
                return Delivery::Dropped { attempts };
            }
        }
    }
}
