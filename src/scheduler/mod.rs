//! Scheduler module for polling targets and writing their records.

mod queue;

pub use queue::*;

use crate::db::{Record, Sink, Target};
use crate::probe::{fetch_once, ModelAdapter};

use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Consecutive failures after which fetch errors are logged as errors.
pub const FAILURE_ESCALATION_THRESHOLD: u32 = 3;

/// Polling settings used when a target doesn't override them.
#[derive(Debug, Clone, Copy)]
pub struct PollDefaults {
    pub interval: Duration,
    pub timeout: Duration,
    /// Upper bound of the random delay before a poller's first cycle.
    pub start_jitter: Duration,
}

/// What one poll cycle produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Probing is off for the target.
    Skipped,
    Enqueued,
    /// Fetched, but the insert queue was full.
    Rejected,
    Failed,
}

/// Runs one poller task per target plus the batch writer.
pub struct Scheduler {
    queue: Arc<InsertQueue>,
    stop_tx: broadcast::Sender<()>,
    writer_stop_tx: broadcast::Sender<()>,
    pollers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler and start its batch writer.
    pub fn new(queue: Arc<InsertQueue>, sink: Arc<dyn Sink>, policy: InsertPolicy) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        let (writer_stop_tx, writer_stop_rx) = broadcast::channel(1);

        let writer = tokio::spawn(run_batch_writer(queue.clone(), sink, policy, writer_stop_rx));

        Self {
            queue,
            stop_tx,
            writer_stop_tx,
            pollers: Vec::new(),
            writer: Some(writer),
        }
    }

    /// Start polling a target with its own adapter.
    pub fn add_target(
        &mut self,
        target: Target,
        adapter: Box<dyn ModelAdapter>,
        defaults: PollDefaults,
    ) {
        tracing::info!(
            "Scheduler: Adding target {} at {} (probe: {})",
            target.name,
            target.address,
            target.fetch_probes
        );

        let stop_rx = self.stop_tx.subscribe();
        let queue = self.queue.clone();
        self.pollers.push(tokio::spawn(run_poll_loop(
            target, adapter, queue, defaults, stop_rx,
        )));
    }

    pub fn target_count(&self) -> usize {
        self.pollers.len()
    }

    /// Stop all pollers, then let the writer flush what's queued and exit.
    pub async fn shutdown(mut self) {
        let _ = self.stop_tx.send(());
        for poller in self.pollers.drain(..) {
            if let Err(e) = poller.await {
                tracing::error!("Poller task failed: {}", e);
            }
        }

        let _ = self.writer_stop_tx.send(());
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                tracing::error!("Batch writer task failed: {}", e);
            }
        }
    }
}

/// Run the poll loop for a single target.
///
/// Cycles start every effective interval; a slow or failed fetch never
/// shifts the schedule and never overlaps the next cycle.
async fn run_poll_loop(
    target: Target,
    mut adapter: Box<dyn ModelAdapter>,
    queue: Arc<InsertQueue>,
    defaults: PollDefaults,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let interval_duration = target.effective_interval(defaults.interval);
    let timeout = target.effective_timeout(defaults.timeout);

    let jitter = random_jitter(defaults.start_jitter);
    let start = tokio::time::Instant::now() + jitter;
    let mut interval = tokio::time::interval_at(start, interval_duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut failures = 0;

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = interval.tick() => {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = poll_cycle(&target, adapter.as_mut(), &queue, timeout, &mut failures) => {}
                }
            }
        }
    }

    tracing::debug!("Poller for {} stopped", target.name);
}

/// Fetch, normalize and enqueue one snapshot of `target`.
async fn poll_cycle(
    target: &Target,
    adapter: &mut dyn ModelAdapter,
    queue: &InsertQueue,
    timeout: Duration,
    failures: &mut u32,
) -> CycleOutcome {
    tracing::debug!("Starting fetch for {} at {}", target.name, target.address);

    let fields = match fetch_once(adapter, target, timeout).await {
        Ok(Some(fields)) => fields,
        Ok(None) => {
            tracing::debug!("Probing is off for {}, skipping cycle", target.name);
            return CycleOutcome::Skipped;
        }
        Err(e) => {
            *failures += 1;
            if *failures >= FAILURE_ESCALATION_THRESHOLD {
                tracing::error!(
                    "Failed to fetch {} at {} ({} consecutive failures): {}",
                    target.name,
                    target.address,
                    failures,
                    e
                );
            } else {
                tracing::warn!("Failed to fetch {} at {}: {}", target.name, target.address, e);
            }
            return CycleOutcome::Failed;
        }
    };

    if *failures > 0 {
        tracing::info!(
            "Fetch for {} recovered after {} failed attempt(s)",
            target.name,
            failures
        );
        *failures = 0;
    }

    let record = Record::from_fields(&target.name, &fields, &target.overrides, Utc::now());
    tracing::debug!("Fetched {} fields from {}", fields.len(), target.name);

    match queue.enqueue(record) {
        Ok(()) => CycleOutcome::Enqueued,
        Err(_) => CycleOutcome::Rejected,
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[cfg(test)]
mod tests {
    use super::queue::testing::ScriptedSink;
    use super::*;
    use crate::db::{test_target, FetchProbes};
    use crate::probe::testing::StaticAdapter;
    use crate::probe::FieldMap;
    use std::sync::atomic::Ordering;

    fn defaults() -> PollDefaults {
        PollDefaults {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(15),
            start_jitter: Duration::ZERO,
        }
    }

    fn policy() -> InsertPolicy {
        InsertPolicy {
            table: "apc_ups".to_string(),
            batch_size: 100,
            retries: 0,
            retry_delay: Duration::from_millis(10),
            insert_timeout: Duration::from_secs(1),
            flush_interval: Duration::from_secs(3600),
        }
    }

    fn ups_fields() -> FieldMap {
        [
            ("upsBasicIdentModel.0", "Smart-UPS 1500"),
            ("upsHighPrecBatteryCapacity.0", "1000"),
        ]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_poll_cycle_enqueues_record() {
        let queue = InsertQueue::new(10, 100);
        let mut adapter = StaticAdapter::new(ups_fields());
        let target = test_target("ups-a");
        let mut failures = 2;

        let outcome = poll_cycle(&target, &mut adapter, &queue, Duration::from_secs(1), &mut failures).await;

        assert_eq!(outcome, CycleOutcome::Enqueued);
        assert_eq!(failures, 0);
        let records = queue.drain(10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "ups-a");
        assert_eq!(records[0].model.as_deref(), Some("Smart-UPS 1500"));
        assert_eq!(records[0].battery_capacity_percent, Some(100.0));
    }

    #[tokio::test]
    async fn test_poll_cycle_counts_failures() {
        let queue = InsertQueue::new(10, 100);
        let mut adapter = StaticAdapter::new(FieldMap::new());
        adapter.fail = true;
        let target = test_target("ups-a");
        let mut failures = 0;

        for expected in 1..=4 {
            let outcome = poll_cycle(&target, &mut adapter, &queue, Duration::from_secs(1), &mut failures).await;
            assert_eq!(outcome, CycleOutcome::Failed);
            assert_eq!(failures, expected);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_poll_cycle_skips_when_off() {
        let queue = InsertQueue::new(10, 100);
        let mut adapter = StaticAdapter::new(ups_fields());
        let mut target = test_target("ups-a");
        target.fetch_probes = FetchProbes::Off;
        let mut failures = 0;

        let outcome = poll_cycle(&target, &mut adapter, &queue, Duration::from_secs(1), &mut failures).await;
        assert_eq!(outcome, CycleOutcome::Skipped);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_poll_cycle_rejected_when_queue_full() {
        let queue = InsertQueue::new(1, 100);
        queue.enqueue(Record::empty("older", Utc::now())).unwrap();
        let mut adapter = StaticAdapter::new(ups_fields());
        let target = test_target("ups-a");
        let mut failures = 0;

        let outcome = poll_cycle(&target, &mut adapter, &queue, Duration::from_secs(1), &mut failures).await;
        assert_eq!(outcome, CycleOutcome::Rejected);
        assert_eq!(queue.drain(10)[0].name, "older");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_target_keeps_its_schedule() {
        let queue = Arc::new(InsertQueue::new(10, 100));
        let mut adapter = StaticAdapter::new(ups_fields());
        adapter.delay = Duration::from_secs(3600);
        let calls = adapter.calls.clone();
        let started = adapter.started.clone();

        let mut target = test_target("ups-core-1");
        target.interval = Some(Duration::from_secs(60));
        let (stop_tx, stop_rx) = broadcast::channel(1);

        let poller = tokio::spawn(run_poll_loop(
            target,
            Box::new(adapter),
            queue.clone(),
            defaults(),
            stop_rx,
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
        {
            let started = started.lock().unwrap();
            assert_eq!(started[1] - started[0], Duration::from_secs(60));
        }

        stop_tx.send(()).unwrap();
        poller.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_delivers_and_flushes_on_shutdown() {
        let queue = Arc::new(InsertQueue::new(10, 100));
        let sink = Arc::new(ScriptedSink::ok());
        let mut scheduler = Scheduler::new(queue.clone(), sink.clone(), policy());

        for name in ["ups-a", "ups-b"] {
            scheduler.add_target(
                test_target(name),
                Box::new(StaticAdapter::new(ups_fields())),
                defaults(),
            );
        }
        assert_eq!(scheduler.target_count(), 2);

        // First cycles run immediately; the next ones are 30s away.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(queue.len() <= 2);

        scheduler.shutdown().await;

        assert!(queue.is_empty());
        let mut delivered = sink.delivered_names();
        delivered.sort();
        assert_eq!(delivered, vec!["ups-a", "ups-b"]);
    }

    #[test]
    fn test_random_jitter_bounds() {
        assert_eq!(random_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(random_jitter(Duration::from_millis(500)) <= Duration::from_millis(500));
        }
    }
}
