use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use prometheus::{Counter, Gauge};

use crate::flow::FlowRecord;

/// A prefix of the queue captured for one commit attempt.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Sequence number of the first record in `records`.
    pub start_seq: u64,
    pub records: Vec<Arc<FlowRecord>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct Inner {
    records: VecDeque<Arc<FlowRecord>>,
    /// Sequence number of `records.front()`.
    head_seq: u64,
    dropped: u64,
}

/// Bounded FIFO of flow records awaiting commit.
///
/// Every pushed record gets the next sequence number. When full, the oldest
/// record is evicted to make room. Snapshots are cheap `Arc` clones and the
/// lock is never held while a batch is being committed.
pub struct RecordQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    length: Option<Gauge>,
    dropped: Option<Counter>,
}

impl RecordQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(capacity.min(4096)),
                head_seq: 0,
                dropped: 0,
            }),
            length: None,
            dropped: None,
        }
    }

    /// Reports queue length and evictions through the given metrics.
    pub fn with_metrics(mut self, length: Gauge, dropped: Counter) -> Self {
        self.length = Some(length);
        self.dropped = Some(dropped);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a record, evicting the oldest one when full.
    pub fn push(&self, record: FlowRecord) {
        let mut inner = self.inner.lock();

        if inner.records.len() >= self.capacity {
            inner.records.pop_front();
            inner.head_seq += 1;
            inner.dropped += 1;
            if let Some(dropped) = &self.dropped {
                dropped.inc();
            }
            if inner.dropped.is_power_of_two() {
                tracing::warn!(
                    dropped = inner.dropped,
                    capacity = self.capacity,
                    "record queue full, dropping oldest records",
                );
            }
        }

        inner.records.push_back(Arc::new(record));
        self.publish_len(&inner);
    }

    /// Captures every queued record.
    pub fn snapshot(&self) -> Batch {
        let inner = self.inner.lock();
        Batch {
            start_seq: inner.head_seq,
            records: inner.records.iter().cloned().collect(),
        }
    }

    /// Removes the records of `batch` that are still queued.
    ///
    /// Records evicted since the snapshot are not removed twice, and records
    /// pushed after the snapshot are kept.
    pub fn confirm(&self, batch: &Batch) {
        let mut inner = self.inner.lock();

        let end_seq = batch.start_seq + batch.records.len() as u64;
        if end_seq <= inner.head_seq {
            return;
        }

        let remove = ((end_seq - inner.head_seq) as usize).min(inner.records.len());
        inner.records.drain(..remove);
        inner.head_seq += remove as u64;
        self.publish_len(&inner);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Total records evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    fn publish_len(&self, inner: &Inner) {
        if let Some(length) = &self.length {
            length.set(inner.records.len() as f64);
        }
    }
}
