use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::flow::FlowRecord;
use crate::health::HealthMetrics;

use super::queue::RecordQueue;

/// Interval of the committed-records summary log.
const LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Durable destination for flow records.
pub trait FlowStore: Send + Sync + 'static {
    type Tx: FlowTransaction;

    /// Opens a transaction for one batch.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// A batch of inserts that becomes visible all at once.
pub trait FlowTransaction: Send {
    /// Adds one record to the transaction.
    fn exec(&mut self, record: &FlowRecord) -> Result<()>;

    /// Makes every added record durable.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;

    /// Discards every added record.
    fn rollback(self);
}

struct Shared<S> {
    store: S,
    queue: Arc<RecordQueue>,
    health: Arc<HealthMetrics>,
}

impl<S: FlowStore> Shared<S> {
    async fn commit_batch(&self) -> Result<usize> {
        let batch = self.queue.snapshot();
        if batch.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let result = self.write(&batch.records).await;
        self.health
            .commit_duration
            .observe(started.elapsed().as_secs_f64());

        if let Err(e) = result {
            self.health.commit_errors.inc();
            return Err(e);
        }

        self.queue.confirm(&batch);
        self.health.records_committed.inc_by(batch.len() as f64);
        tracing::debug!(records = batch.len(), "committed flow records");

        Ok(batch.len())
    }

    async fn write(&self, records: &[Arc<FlowRecord>]) -> Result<()> {
        let mut tx = self.store.begin().await.context("beginning transaction")?;

        for (idx, record) in records.iter().enumerate() {
            if let Err(e) = tx.exec(record) {
                tx.rollback();
                return Err(e).with_context(|| format!("adding record {idx} of {}", records.len()));
            }
        }

        tx.commit().await.context("committing transaction")
    }
}

/// BatchCommitter periodically moves buffered records into a [`FlowStore`].
///
/// Each tick snapshots the queue and writes the snapshot in one transaction.
/// Records leave the queue only after a successful commit; a failed batch is
/// rolled back and retried in full on the next tick.
pub struct BatchCommitter<S: FlowStore> {
    shared: Arc<Shared<S>>,
    interval: Duration,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl<S: FlowStore> BatchCommitter<S> {
    pub fn new(
        store: S,
        queue: Arc<RecordQueue>,
        interval: Duration,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                queue,
                health,
            }),
            interval,
            cancel: None,
            task: None,
        }
    }

    /// Commits everything currently buffered. Returns the number of records
    /// committed.
    pub async fn commit_batch(&self) -> Result<usize> {
        self.shared.commit_batch().await
    }

    /// Spawns the commit loop. The loop ends when `ctx` or [`Self::stop`]
    /// cancels it, after one final commit.
    pub fn start(&mut self, ctx: &CancellationToken) {
        let cancel = ctx.child_token();
        self.cancel = Some(cancel.clone());

        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        self.task = Some(tokio::spawn(async move {
            run(shared, interval, cancel).await;
        }));

        tracing::info!(interval = ?self.interval, "batch committer started");
    }

    /// Stops the commit loop and waits for its final commit. Safe to call
    /// more than once.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        if let Some(task) = self.task.take() {
            task.await.context("joining batch committer task")?;
        }

        Ok(())
    }
}

async fn run<S: FlowStore>(shared: Arc<Shared<S>>, interval: Duration, ctx: CancellationToken) {
    let mut commit_ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    commit_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut log_ticker = tokio::time::interval_at(Instant::now() + LOG_INTERVAL, LOG_INTERVAL);
    log_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut committed = 0usize;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => {
                tracing::info!("stopping batch committer");
                match shared.commit_batch().await {
                    Ok(n) => {
                        committed += n;
                        tracing::info!(records = committed, "final commit completed");
                    }
                    Err(e) => tracing::error!(error = %e, "final commit failed"),
                }
                return;
            }

            _ = commit_ticker.tick() => {
                match shared.commit_batch().await {
                    Ok(n) => committed += n,
                    Err(e) => tracing::warn!(
                        error = ?e,
                        queued = shared.queue.len(),
                        "batch commit failed, will retry",
                    ),
                }
            }

            _ = log_ticker.tick() => {
                tracing::info!(records = committed, "records committed in the last minute");
                committed = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Records committed rows and can be told to fail at a given record or
    /// to push more records into the queue while committing.
    #[derive(Default)]
    struct MockState {
        fail_at: Mutex<Option<usize>>,
        fail_commit: AtomicBool,
        rollbacks: AtomicUsize,
        committed: Mutex<Vec<u64>>,
        arrivals_during_commit: Mutex<Vec<FlowRecord>>,
        queue: Mutex<Option<Arc<RecordQueue>>>,
    }

    #[derive(Clone, Default)]
    struct MockStore(Arc<MockState>);

    struct MockTx {
        state: Arc<MockState>,
        rows: Vec<u64>,
    }

    impl FlowStore for MockStore {
        type Tx = MockTx;

        async fn begin(&self) -> Result<MockTx> {
            Ok(MockTx {
                state: Arc::clone(&self.0),
                rows: Vec::new(),
            })
        }
    }

    impl FlowTransaction for MockTx {
        fn exec(&mut self, record: &FlowRecord) -> Result<()> {
            if *self.state.fail_at.lock() == Some(self.rows.len()) {
                anyhow::bail!("insert failed");
            }
            self.rows.push(record.octet_total_count);
            Ok(())
        }

        async fn commit(self) -> Result<()> {
            let arrivals: Vec<FlowRecord> =
                std::mem::take(&mut *self.state.arrivals_during_commit.lock());
            if let Some(queue) = self.state.queue.lock().as_ref() {
                for record in arrivals {
                    queue.push(record);
                }
            }

            if self.state.fail_commit.load(Ordering::SeqCst) {
                anyhow::bail!("commit failed");
            }
            self.state.committed.lock().extend(self.rows);
            Ok(())
        }

        fn rollback(self) {
            self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(n: u64) -> FlowRecord {
        FlowRecord {
            octet_total_count: n,
            ..Default::default()
        }
    }

    type Fixture = (
        BatchCommitter<MockStore>,
        MockStore,
        Arc<RecordQueue>,
        Arc<HealthMetrics>,
    );

    fn setup(capacity: usize) -> Fixture {
        let store = MockStore::default();
        let queue = Arc::new(RecordQueue::new(capacity));
        *store.0.queue.lock() = Some(Arc::clone(&queue));
        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let committer = BatchCommitter::new(
            store.clone(),
            Arc::clone(&queue),
            Duration::from_secs(1),
            Arc::clone(&health),
        );
        (committer, store, queue, health)
    }

    fn queued(queue: &RecordQueue) -> Vec<u64> {
        queue
            .snapshot()
            .records
            .iter()
            .map(|r| r.octet_total_count)
            .collect()
    }

    #[tokio::test]
    async fn test_failed_record_rolls_back_whole_batch() {
        let (committer, store, queue, health) = setup(100);
        for n in 0..5 {
            queue.push(record(n));
        }

        *store.0.fail_at.lock() = Some(3);
        assert!(committer.commit_batch().await.is_err());
        assert!(store.0.committed.lock().is_empty());
        assert_eq!(store.0.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(queued(&queue), vec![0, 1, 2, 3, 4]);
        assert_eq!(health.commit_errors.get(), 1.0);

        *store.0.fail_at.lock() = None;
        assert_eq!(committer.commit_batch().await.unwrap(), 5);
        assert_eq!(*store.0.committed.lock(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(health.records_committed.get(), 5.0);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_queue() {
        let (committer, store, queue, _) = setup(100);
        queue.push(record(1));

        store.0.fail_commit.store(true, Ordering::SeqCst);
        assert!(committer.commit_batch().await.is_err());
        assert_eq!(queued(&queue), vec![1]);
    }

    #[tokio::test]
    async fn test_arrivals_during_commit_stay_queued() {
        let (committer, store, queue, _) = setup(100);
        for n in 0..4 {
            queue.push(record(n));
        }
        *store.0.arrivals_during_commit.lock() = (10..13).map(record).collect();

        assert_eq!(committer.commit_batch().await.unwrap(), 4);
        assert_eq!(*store.0.committed.lock(), vec![0, 1, 2, 3]);
        assert_eq!(queued(&queue), vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_eviction_during_commit_is_not_double_removed() {
        let (committer, store, queue, _) = setup(4);
        for n in 0..4 {
            queue.push(record(n));
        }
        // Two arrivals evict records 0 and 1 while the batch is in flight.
        *store.0.arrivals_during_commit.lock() = vec![record(10), record(11)];

        assert_eq!(committer.commit_batch().await.unwrap(), 4);
        assert_eq!(queued(&queue), vec![10, 11]);
    }

    #[tokio::test]
    async fn test_empty_queue_does_not_begin() {
        let (committer, store, _, health) = setup(4);
        assert_eq!(committer.commit_batch().await.unwrap(), 0);
        assert!(store.0.committed.lock().is_empty());
        assert_eq!(health.commit_errors.get(), 0.0);
    }

    #[tokio::test]
    async fn test_stop_commits_remaining_and_is_idempotent() {
        let (mut committer, store, queue, _) = setup(100);
        let ctx = CancellationToken::new();
        committer.start(&ctx);

        queue.push(record(7));
        committer.stop().await.unwrap();
        committer.stop().await.unwrap();

        assert_eq!(*store.0.committed.lock(), vec![7]);
        assert!(queue.is_empty());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_tick_commits_periodically() {
        let store = MockStore::default();
        let queue = Arc::new(RecordQueue::new(100));
        let mut committer = BatchCommitter::new(
            store.clone(),
            Arc::clone(&queue),
            Duration::from_millis(20),
            Arc::new(HealthMetrics::new(":0").unwrap()),
        );
        let ctx = CancellationToken::new();
        committer.start(&ctx);

        queue.push(record(1));
        queue.push(record(2));
        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*store.0.committed.lock(), vec![1, 2]);

        ctx.cancel();
        committer.stop().await.unwrap();
    }
}
