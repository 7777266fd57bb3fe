use std::collections::HashSet;
use std::fmt::{Display, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clickhouse_rs::Pool;

use crate::config::ClickHouseConfig;
use crate::flow::record::FLOW_RECORD_COLUMNS;
use crate::flow::FlowRecord;
use crate::health::HealthMetrics;

use super::committer::{FlowStore, FlowTransaction};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the flow table.
pub const FLOWS_TABLE: &str = "flows";

/// Columns of the flow table in insert order.
pub const FLOW_COLUMNS: [&str; FLOW_RECORD_COLUMNS] = [
    "flowStartSeconds",
    "flowEndSeconds",
    "flowEndSecondsFromSourceNode",
    "flowEndSecondsFromDestinationNode",
    "flowEndReason",
    "sourceIP",
    "destinationIP",
    "sourceTransportPort",
    "destinationTransportPort",
    "protocolIdentifier",
    "packetTotalCount",
    "octetTotalCount",
    "packetDeltaCount",
    "octetDeltaCount",
    "reversePacketTotalCount",
    "reverseOctetTotalCount",
    "reversePacketDeltaCount",
    "reverseOctetDeltaCount",
    "sourcePodName",
    "sourcePodNamespace",
    "sourceNodeName",
    "destinationPodName",
    "destinationPodNamespace",
    "destinationNodeName",
    "destinationClusterIP",
    "destinationServicePort",
    "destinationServicePortName",
    "ingressNetworkPolicyName",
    "ingressNetworkPolicyNamespace",
    "ingressNetworkPolicyRuleName",
    "ingressNetworkPolicyRuleAction",
    "ingressNetworkPolicyType",
    "egressNetworkPolicyName",
    "egressNetworkPolicyNamespace",
    "egressNetworkPolicyRuleName",
    "egressNetworkPolicyRuleAction",
    "egressNetworkPolicyType",
    "tcpState",
    "flowType",
    "sourcePodLabels",
    "destinationPodLabels",
    "throughput",
    "reverseThroughput",
    "throughputFromSourceNode",
    "throughputFromDestinationNode",
    "reverseThroughputFromSourceNode",
    "reverseThroughputFromDestinationNode",
];

/// ClickHouse-backed [`FlowStore`] writing to the `flows` table.
pub struct ClickHouseStore {
    pool: Pool,
    database: String,
    debug: bool,
}

impl ClickHouseStore {
    /// Opens the pool and waits until the server answers a ping.
    ///
    /// Retries every second and gives up after ten seconds.
    pub async fn connect(cfg: &ClickHouseConfig, health: &HealthMetrics) -> Result<Self> {
        let pool = Pool::new(cfg.dsn()?);
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;

        loop {
            match tokio::time::timeout(CONNECT_RETRY_INTERVAL, ping(&pool)).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => {
                    health.clickhouse_connected.set(0.0);
                    if tokio::time::Instant::now() + CONNECT_RETRY_INTERVAL > deadline {
                        return Err(e).with_context(|| {
                            format!("failed to connect to ClickHouse after {CONNECT_TIMEOUT:?}")
                        });
                    }
                    tracing::debug!(error = %e, "ClickHouse not reachable yet, retrying");
                }
                Err(_) => {
                    health.clickhouse_connected.set(0.0);
                    if tokio::time::Instant::now() + CONNECT_RETRY_INTERVAL > deadline {
                        bail!("failed to connect to ClickHouse after {CONNECT_TIMEOUT:?}: ping timed out");
                    }
                }
            }
            tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
        }

        health.clickhouse_connected.set(1.0);
        tracing::info!(url = %cfg.database_url, database = %cfg.database, "ClickHouse connected");

        Ok(Self {
            pool,
            database: cfg.database.clone(),
            debug: cfg.debug,
        })
    }

    /// Verifies that the flow table accepts the insert statement.
    pub async fn prepare(&self) -> Result<()> {
        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for schema check")?;

        let sql = format!(
            "SELECT name FROM system.columns WHERE database = '{}' AND table = '{FLOWS_TABLE}'",
            escape_sql(&self.database),
        );
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying flow table columns")?;

        let mut columns = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let name: String = row.get("name").context("reading column name")?;
            columns.push(name);
        }

        check_columns(&self.database, &columns).context("preparing insert statement")?;
        tracing::info!(table = %self.table(), "insert statement prepared");

        Ok(())
    }

    fn table(&self) -> String {
        format!("{}.{FLOWS_TABLE}", self.database)
    }
}

impl FlowStore for ClickHouseStore {
    type Tx = ClickHouseTransaction;

    async fn begin(&self) -> Result<ClickHouseTransaction> {
        Ok(ClickHouseTransaction {
            pool: self.pool.clone(),
            sql: insert_prefix(&self.table()),
            rows: 0,
            debug: self.debug,
        })
    }
}

/// One multi-row `INSERT` built up record by record.
pub struct ClickHouseTransaction {
    pool: Pool,
    sql: String,
    rows: usize,
    debug: bool,
}

impl FlowTransaction for ClickHouseTransaction {
    fn exec(&mut self, record: &FlowRecord) -> Result<()> {
        if self.rows > 0 {
            self.sql.push_str(", ");
        }
        push_row(&mut self.sql, record);
        self.rows += 1;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        if self.rows == 0 {
            return Ok(());
        }

        if self.debug {
            tracing::debug!(rows = self.rows, sql = %self.sql, "executing flow insert");
        }

        let mut handle = self
            .pool
            .get_handle()
            .await
            .context("getting handle for flow insert")?;

        handle
            .execute(self.sql.as_str())
            .await
            .with_context(|| format!("inserting {} flow records", self.rows))?;

        Ok(())
    }

    fn rollback(self) {
        tracing::debug!(rows = self.rows, "discarding flow insert");
    }
}

async fn ping(pool: &Pool) -> Result<()> {
    let mut handle = pool
        .get_handle()
        .await
        .context("opening ClickHouse connection")?;
    handle.ping().await.context("pinging ClickHouse")?;
    Ok(())
}

fn check_columns(database: &str, columns: &[String]) -> Result<()> {
    if columns.is_empty() {
        bail!("table {database}.{FLOWS_TABLE} does not exist");
    }

    let present: HashSet<&str> = columns.iter().map(String::as_str).collect();
    let missing: Vec<&str> = FLOW_COLUMNS
        .iter()
        .copied()
        .filter(|c| !present.contains(c))
        .collect();

    if !missing.is_empty() {
        bail!(
            "table {database}.{FLOWS_TABLE} is missing columns: {}",
            missing.join(", ")
        );
    }

    Ok(())
}

fn insert_prefix(table: &str) -> String {
    let columns = FLOW_COLUMNS.join(", ");
    let mut sql = String::with_capacity(64 + table.len() + columns.len());
    let _ = write!(sql, "INSERT INTO {table} ({columns}) VALUES ");
    sql
}

/// Appends one value tuple in [`FLOW_COLUMNS`] order.
fn push_row(sql: &mut String, r: &FlowRecord) {
    let mut row = RowWriter::new(sql);

    row.datetime(r.flow_start_seconds);
    row.datetime(r.flow_end_seconds);
    row.datetime(r.flow_end_seconds_from_source_node);
    row.datetime(r.flow_end_seconds_from_destination_node);
    row.number(r.flow_end_reason);
    row.string(&r.source_ip);
    row.string(&r.destination_ip);
    row.number(r.source_transport_port);
    row.number(r.destination_transport_port);
    row.number(r.protocol_identifier);
    row.number(r.packet_total_count);
    row.number(r.octet_total_count);
    row.number(r.packet_delta_count);
    row.number(r.octet_delta_count);
    row.number(r.reverse_packet_total_count);
    row.number(r.reverse_octet_total_count);
    row.number(r.reverse_packet_delta_count);
    row.number(r.reverse_octet_delta_count);
    row.string(&r.source_pod_name);
    row.string(&r.source_pod_namespace);
    row.string(&r.source_node_name);
    row.string(&r.destination_pod_name);
    row.string(&r.destination_pod_namespace);
    row.string(&r.destination_node_name);
    row.string(&r.destination_cluster_ip);
    row.number(r.destination_service_port);
    row.string(&r.destination_service_port_name);
    row.string(&r.ingress_network_policy_name);
    row.string(&r.ingress_network_policy_namespace);
    row.string(&r.ingress_network_policy_rule_name);
    row.number(r.ingress_network_policy_rule_action);
    row.number(r.ingress_network_policy_type);
    row.string(&r.egress_network_policy_name);
    row.string(&r.egress_network_policy_namespace);
    row.string(&r.egress_network_policy_rule_name);
    row.number(r.egress_network_policy_rule_action);
    row.number(r.egress_network_policy_type);
    row.string(&r.tcp_state);
    row.number(r.flow_type);
    row.string(&r.source_pod_labels);
    row.string(&r.destination_pod_labels);
    row.number(r.throughput);
    row.number(r.reverse_throughput);
    row.number(r.throughput_from_source_node);
    row.number(r.throughput_from_destination_node);
    row.number(r.reverse_throughput_from_source_node);
    row.number(r.reverse_throughput_from_destination_node);

    row.finish();
}

struct RowWriter<'a> {
    sql: &'a mut String,
    first: bool,
}

impl<'a> RowWriter<'a> {
    fn new(sql: &'a mut String) -> Self {
        sql.push('(');
        Self { sql, first: true }
    }

    fn separator(&mut self) {
        if !self.first {
            self.sql.push_str(", ");
        }
        self.first = false;
    }

    fn number(&mut self, v: impl Display) {
        self.separator();
        let _ = write!(self.sql, "{v}");
    }

    fn string(&mut self, v: &str) {
        self.separator();
        let _ = write!(self.sql, "'{}'", escape_sql(v));
    }

    fn datetime(&mut self, unix_seconds: u32) {
        self.separator();
        self.sql.push_str(&format_datetime(
            UNIX_EPOCH + Duration::from_secs(u64::from(unix_seconds)),
        ));
    }

    fn finish(self) {
        self.sql.push(')');
    }
}

/// Formats a SystemTime as a ClickHouse DateTime literal.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
