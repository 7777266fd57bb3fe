//! Periodic export of due connections as flow records.

pub mod http;
pub mod transport;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

use crate::connections::{ConnectionStore, DueConnection};
use crate::flow::FlowRecord;
use crate::health::HealthMetrics;

pub use http::HttpTransport;
pub use transport::{AnyTransport, LocalTransport, Transport};

/// Upper bound on the final flush at shutdown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// FlowExporter renders due connections and ships them through a transport.
///
/// One tick walks every store: due connections are taken, rendered, sent as
/// one batch per store and then settled according to the send outcome.
pub struct FlowExporter<T: Transport> {
    stores: Vec<Arc<ConnectionStore>>,
    transport: T,
    node_name: String,
    interval: Duration,
    health: Arc<HealthMetrics>,
}

impl<T: Transport> FlowExporter<T> {
    pub fn new(
        stores: Vec<Arc<ConnectionStore>>,
        transport: T,
        node_name: &str,
        interval: Duration,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            stores,
            transport,
            node_name: node_name.to_string(),
            interval,
            health,
        }
    }

    /// Runs the export loop until `ctx` is cancelled, then force-exports
    /// everything still tracked.
    pub async fn run(&self, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            transport = self.transport.name(),
            interval = ?self.interval,
            stores = self.stores.len(),
            "flow exporter started",
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    let flushed = self.flush(SystemTime::now()).await;
                    tracing::info!(records = flushed, "flow exporter stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.export_due(SystemTime::now()).await;
                }
            }
        }
    }

    /// Exports every connection due at `now`. Returns the number of records
    /// delivered.
    pub async fn export_due(&self, now: SystemTime) -> usize {
        let mut exported = 0;
        for store in &self.stores {
            let due = store.take_due(now);
            exported += self.export_batch(store, due, now, self.interval).await;
        }
        exported
    }

    /// Exports every tracked connection with a forced end reason.
    pub async fn flush(&self, now: SystemTime) -> usize {
        let mut exported = 0;
        for store in &self.stores {
            let due = store.take_all(now);
            exported += self.export_batch(store, due, now, FLUSH_TIMEOUT).await;
        }
        exported
    }

    async fn export_batch(
        &self,
        store: &ConnectionStore,
        due: Vec<DueConnection>,
        now: SystemTime,
        timeout: Duration,
    ) -> usize {
        if due.is_empty() {
            return 0;
        }

        let records: Vec<FlowRecord> = due
            .iter()
            .map(|d| FlowRecord::from_connection(&d.connection, d.reason, &self.node_name, now))
            .collect();

        let started = Instant::now();
        let result = self.send_bounded(&records, timeout).await;
        self.health
            .export_duration
            .with_label_values(&[store.name()])
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                store.complete_export(&due, true, now);
                self.health
                    .records_exported
                    .with_label_values(&[store.name()])
                    .inc_by(records.len() as f64);
                tracing::debug!(store = store.name(), records = records.len(), "exported flows");
                records.len()
            }
            Err(e) => {
                store.complete_export(&due, false, now);
                self.health
                    .export_errors
                    .with_label_values(&[store.name()])
                    .inc();
                tracing::warn!(
                    store = store.name(),
                    transport = self.transport.name(),
                    records = records.len(),
                    error = %e,
                    "flow export failed, will retry",
                );
                0
            }
        }
    }

    async fn send_bounded(&self, records: &[FlowRecord], timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.transport.send(records)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("transport send timed out after {timeout:?}")),
        }
    }
}
