use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::connections::{ConntrackConnectionStore, DenyConnectionStore, FlowTimeouts};
use crate::datapath::{EventDispatcher, EventSource, UdpEventSource};
use crate::exporter::{AnyTransport, FlowExporter, HttpTransport, LocalTransport};
use crate::health::HealthMetrics;
use crate::metadata::StaticRegistry;

/// Delay before a connection whose export failed is offered again.
const EXPORT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Track connections and ship records to a remote aggregator over HTTP.
    Agent,
    /// Receive records over HTTP and commit them to ClickHouse.
    Aggregator,
    /// Both halves in one process, connected by an in-memory queue.
    Standalone,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Aggregator => "aggregator",
            Self::Standalone => "standalone",
        }
    }

    fn tracks_connections(&self) -> bool {
        !matches!(self, Self::Aggregator)
    }

    fn runs_aggregator(&self) -> bool {
        !matches!(self, Self::Agent)
    }
}

/// Agent is the top-level orchestrator wiring all components together.
pub struct Agent {
    cfg: Config,
    mode: Mode,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    source: Option<UdpEventSource>,
    exporter: Option<JoinHandle<()>>,
    aggregator: Option<Aggregator>,
}

impl Agent {
    pub fn new(cfg: Config, mode: Mode) -> Result<Self> {
        let health = Arc::new(
            HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
        );

        Ok(Self {
            cfg,
            mode,
            health,
            cancel: CancellationToken::new(),
            source: None,
            exporter: None,
            aggregator: None,
        })
    }

    /// Starts every component the mode needs.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        info!(mode = self.mode.as_str(), "starting flowkeeper");

        if self.mode.runs_aggregator() {
            let mut aggregator = Aggregator::new(self.cfg.aggregator.clone(), Arc::clone(&self.health));
            aggregator
                .start(&self.cancel, self.mode == Mode::Aggregator)
                .await
                .context("starting aggregator")?;
            self.aggregator = Some(aggregator);
        }

        if self.mode.tracks_connections() {
            let transport = match &self.aggregator {
                Some(aggregator) => AnyTransport::Local(LocalTransport::new(aggregator.queue())),
                None => AnyTransport::Http(
                    HttpTransport::new(&self.cfg.agent.transport)
                        .context("creating flow transport")?,
                ),
            };
            self.start_tracking(transport).await?;
        }

        info!(mode = self.mode.as_str(), "flowkeeper fully started");

        Ok(())
    }

    /// Builds the connection stores, the event source and the exporter.
    async fn start_tracking(&mut self, transport: AnyTransport) -> Result<()> {
        let agent_cfg = &self.cfg.agent;

        let registry = Arc::new(StaticRegistry::from_config(&agent_cfg.metadata));
        let timeouts = FlowTimeouts {
            active: agent_cfg.active_flow_timeout,
            inactive: agent_cfg.inactive_flow_timeout,
            retry: EXPORT_RETRY_INTERVAL,
        };

        let conntrack = Arc::new(ConntrackConnectionStore::new(
            timeouts,
            registry.clone(),
            registry.clone(),
            registry.clone(),
            self.health.connection_count.clone(),
        ));
        let deny = Arc::new(DenyConnectionStore::new(
            timeouts,
            registry.clone(),
            registry.clone(),
            registry,
            self.health.denied_connection_count.clone(),
        ));

        let exporter = FlowExporter::new(
            vec![Arc::clone(conntrack.store()), Arc::clone(deny.store())],
            transport,
            &self.cfg.node_name,
            agent_cfg.export_interval,
            Arc::clone(&self.health),
        );
        let exporter_ctx = self.cancel.child_token();
        self.exporter = Some(tokio::spawn(async move {
            exporter.run(exporter_ctx).await;
        }));

        let dispatcher = Arc::new(EventDispatcher::new(
            conntrack,
            deny,
            Arc::clone(&self.health),
        ));
        let mut source = UdpEventSource::new(&agent_cfg.listen_addr, dispatcher);
        source
            .start(self.cancel.child_token())
            .await
            .context("starting datapath event source")?;
        self.source = Some(source);

        info!(
            active_timeout = ?timeouts.active,
            inactive_timeout = ?timeouts.inactive,
            export_interval = ?agent_cfg.export_interval,
            "connection tracking started",
        );

        Ok(())
    }

    /// Gracefully shuts down all components. Tracked connections are flushed
    /// before the aggregator commits its last batch.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping flowkeeper");

        self.cancel.cancel();

        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.stop().await {
                error!(error = %e, "error stopping event source");
            }
        }

        if let Some(exporter) = self.exporter.take() {
            if let Err(e) = exporter.await {
                error!(error = %e, "flow exporter task failed");
            }
        }

        if let Some(mut aggregator) = self.aggregator.take() {
            if let Err(e) = aggregator.stop().await {
                error!(error = %e, "error stopping aggregator");
            }
        }

        if let Err(e) = self.health.stop().await {
            error!(error = %e, "error stopping health server");
        }

        info!("flowkeeper stopped");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_components() {
        assert!(Mode::Agent.tracks_connections());
        assert!(!Mode::Agent.runs_aggregator());
        assert!(!Mode::Aggregator.tracks_connections());
        assert!(Mode::Aggregator.runs_aggregator());
        assert!(Mode::Standalone.tracks_connections());
        assert!(Mode::Standalone.runs_aggregator());
    }

    #[tokio::test]
    async fn test_agent_mode_start_stop() {
        let mut cfg: Config = serde_yaml::from_str(
            r#"
health:
  addr: "127.0.0.1:0"
agent:
  listen_addr: "127.0.0.1:0"
  transport:
    address: "http://127.0.0.1:1/v1/flows"
"#,
        )
        .unwrap();
        cfg.node_name = "node-a".to_string();

        let mut agent = Agent::new(cfg, Mode::Agent).unwrap();
        agent.start().await.unwrap();
        assert!(agent.source.as_ref().and_then(|s| s.local_addr()).is_some());
        assert!(agent.aggregator.is_none());

        agent.stop().await.unwrap();
        assert!(agent.exporter.is_none());
    }
}
