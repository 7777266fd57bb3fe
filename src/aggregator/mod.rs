//! Aggregator side: ingest endpoint, record buffer and batched ClickHouse
//! commits.

pub mod clickhouse;
pub mod collector;
pub mod committer;
pub mod queue;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::AggregatorConfig;
use crate::health::HealthMetrics;
use crate::migrate::{ClickHouseMigrator, Migrator};

pub use clickhouse::ClickHouseStore;
pub use collector::{ingest_ndjson, Collector, IngestError, IngestStats};
pub use committer::{BatchCommitter, FlowStore, FlowTransaction};
pub use queue::{Batch, RecordQueue};

/// Aggregator owns the record buffer and moves it into ClickHouse.
pub struct Aggregator {
    cfg: AggregatorConfig,
    health: Arc<HealthMetrics>,
    queue: Arc<RecordQueue>,
    collector: Option<Collector>,
    committer: Option<BatchCommitter<ClickHouseStore>>,
}

impl Aggregator {
    pub fn new(cfg: AggregatorConfig, health: Arc<HealthMetrics>) -> Self {
        let queue = Arc::new(
            RecordQueue::new(cfg.queue_capacity).with_metrics(
                health.record_queue_length.clone(),
                health.queue_dropped.clone(),
            ),
        );

        Self {
            cfg,
            health,
            queue,
            collector: None,
            committer: None,
        }
    }

    /// The buffer records are committed from.
    pub fn queue(&self) -> Arc<RecordQueue> {
        Arc::clone(&self.queue)
    }

    /// Connects to ClickHouse and starts committing. With `serve_ingest`, the
    /// HTTP ingest endpoint is started as well.
    pub async fn start(&mut self, ctx: &CancellationToken, serve_ingest: bool) -> Result<()> {
        let ch_cfg = &self.cfg.clickhouse;

        if ch_cfg.migrations.enabled {
            info!("running ClickHouse migrations");
            ClickHouseMigrator::new(clickhouse_rs::Pool::new(ch_cfg.dsn()?))
                .up()
                .await
                .context("applying ClickHouse migrations")?;
        }

        let store = ClickHouseStore::connect(ch_cfg, &self.health)
            .await
            .context("connecting to ClickHouse")?;
        store.prepare().await?;

        let mut committer = BatchCommitter::new(
            store,
            Arc::clone(&self.queue),
            ch_cfg.commit_interval,
            Arc::clone(&self.health),
        );
        committer.start(ctx);
        self.committer = Some(committer);

        if serve_ingest {
            let collector = Collector::new(
                &self.cfg.listen_addr,
                Arc::clone(&self.queue),
                Arc::clone(&self.health),
            );
            collector
                .start(ctx)
                .await
                .context("starting flow collector")?;
            self.collector = Some(collector);
        }

        info!(
            queue_capacity = self.queue.capacity(),
            commit_interval = ?ch_cfg.commit_interval,
            ingest = serve_ingest,
            "aggregator started",
        );

        Ok(())
    }

    /// Stops ingesting, then commits what is left.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(collector) = self.collector.take() {
            if let Err(e) = collector.stop().await {
                error!(error = %e, "error stopping flow collector");
            }
        }

        if let Some(committer) = &mut self.committer {
            committer.stop().await?;
        }

        if !self.queue.is_empty() {
            error!(records = self.queue.len(), "records left uncommitted at shutdown");
        }

        Ok(())
    }
}
