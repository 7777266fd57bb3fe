use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::connection::{Connection, EndReason};

/// Number of columns in a flow record.
pub const FLOW_RECORD_COLUMNS: usize = 47;

/// Flat, exporter-facing projection of a [`Connection`].
///
/// Field order is the contractual column order of the `flows` table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_start_seconds: u32,
    pub flow_end_seconds: u32,
    pub flow_end_seconds_from_source_node: u32,
    pub flow_end_seconds_from_destination_node: u32,
    pub flow_end_reason: u8,
    pub source_ip: String,
    pub destination_ip: String,
    pub source_transport_port: u16,
    pub destination_transport_port: u16,
    pub protocol_identifier: u8,
    pub packet_total_count: u64,
    pub octet_total_count: u64,
    pub packet_delta_count: u64,
    pub octet_delta_count: u64,
    pub reverse_packet_total_count: u64,
    pub reverse_octet_total_count: u64,
    pub reverse_packet_delta_count: u64,
    pub reverse_octet_delta_count: u64,
    pub source_pod_name: String,
    pub source_pod_namespace: String,
    pub source_node_name: String,
    pub destination_pod_name: String,
    pub destination_pod_namespace: String,
    pub destination_node_name: String,
    pub destination_cluster_ip: String,
    pub destination_service_port: u16,
    pub destination_service_port_name: String,
    pub ingress_network_policy_name: String,
    pub ingress_network_policy_namespace: String,
    pub ingress_network_policy_rule_name: String,
    pub ingress_network_policy_rule_action: u8,
    pub ingress_network_policy_type: u8,
    pub egress_network_policy_name: String,
    pub egress_network_policy_namespace: String,
    pub egress_network_policy_rule_name: String,
    pub egress_network_policy_rule_action: u8,
    pub egress_network_policy_type: u8,
    pub tcp_state: String,
    pub flow_type: u8,
    pub source_pod_labels: String,
    pub destination_pod_labels: String,
    pub throughput: u64,
    pub reverse_throughput: u64,
    pub throughput_from_source_node: u64,
    pub throughput_from_destination_node: u64,
    pub reverse_throughput_from_source_node: u64,
    pub reverse_throughput_from_destination_node: u64,
}

impl FlowRecord {
    /// Renders a connection snapshot as seen by the agent on `node_name`.
    ///
    /// Delta columns are relative to the counters recorded at the last
    /// successful export. Throughput is in bits per second over the time since
    /// that export, or since flow start for a first export.
    pub fn from_connection(
        conn: &Connection,
        end_reason: EndReason,
        node_name: &str,
        now: SystemTime,
    ) -> Self {
        let since = conn.last_export_time.unwrap_or(conn.start_time);
        let elapsed = now.duration_since(since).unwrap_or(Duration::ZERO);
        let throughput = bits_per_second(conn.delta_bytes(), elapsed);
        let reverse_throughput = bits_per_second(conn.reverse_delta_bytes(), elapsed);

        let end_seconds = unix_seconds(conn.stop_time);
        let from_source = !node_name.is_empty() && conn.source_pod.node_name == node_name;
        let from_destination =
            !node_name.is_empty() && conn.destination_pod.node_name == node_name;
        let ingress = conn.ingress_policy.clone().unwrap_or_default();
        let egress = conn.egress_policy.clone().unwrap_or_default();

        Self {
            flow_start_seconds: unix_seconds(conn.start_time),
            flow_end_seconds: end_seconds,
            flow_end_seconds_from_source_node: if from_source { end_seconds } else { 0 },
            flow_end_seconds_from_destination_node: if from_destination {
                end_seconds
            } else {
                0
            },
            flow_end_reason: end_reason as u8,
            source_ip: conn.flow_key.source_address.to_string(),
            destination_ip: conn.flow_key.destination_address.to_string(),
            source_transport_port: conn.flow_key.source_port,
            destination_transport_port: conn.flow_key.destination_port,
            protocol_identifier: conn.flow_key.protocol,
            packet_total_count: conn.original_packets,
            octet_total_count: conn.original_bytes,
            packet_delta_count: conn.delta_packets(),
            octet_delta_count: conn.delta_bytes(),
            reverse_packet_total_count: conn.reverse_packets,
            reverse_octet_total_count: conn.reverse_bytes,
            reverse_packet_delta_count: conn.reverse_delta_packets(),
            reverse_octet_delta_count: conn.reverse_delta_bytes(),
            source_pod_name: conn.source_pod.name.clone(),
            source_pod_namespace: conn.source_pod.namespace.clone(),
            source_node_name: conn.source_pod.node_name.clone(),
            destination_pod_name: conn.destination_pod.name.clone(),
            destination_pod_namespace: conn.destination_pod.namespace.clone(),
            destination_node_name: conn.destination_pod.node_name.clone(),
            destination_cluster_ip: conn
                .destination_service_address
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            destination_service_port: conn.destination_service_port,
            destination_service_port_name: conn.destination_service_port_name.clone(),
            ingress_network_policy_name: ingress.name,
            ingress_network_policy_namespace: ingress.namespace,
            ingress_network_policy_rule_name: ingress.rule_name,
            ingress_network_policy_rule_action: ingress.action as u8,
            ingress_network_policy_type: ingress.policy_type as u8,
            egress_network_policy_name: egress.name,
            egress_network_policy_namespace: egress.namespace,
            egress_network_policy_rule_name: egress.rule_name,
            egress_network_policy_rule_action: egress.action as u8,
            egress_network_policy_type: egress.policy_type as u8,
            tcp_state: conn.tcp_state.clone(),
            flow_type: conn.flow_type as u8,
            source_pod_labels: conn.source_pod.labels.clone(),
            destination_pod_labels: conn.destination_pod.labels.clone(),
            throughput,
            reverse_throughput,
            throughput_from_source_node: if from_source { throughput } else { 0 },
            throughput_from_destination_node: if from_destination { throughput } else { 0 },
            reverse_throughput_from_source_node: if from_source {
                reverse_throughput
            } else {
                0
            },
            reverse_throughput_from_destination_node: if from_destination {
                reverse_throughput
            } else {
                0
            },
        }
    }
}

/// Converts a timestamp to whole Unix seconds, saturating at the `u32` range.
pub fn unix_seconds(t: SystemTime) -> u32 {
    let secs = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs();
    u32::try_from(secs).unwrap_or(u32::MAX)
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> u64 {
    let millis = elapsed.as_millis();
    if millis == 0 {
        return 0;
    }

    let bits_per_sec = u128::from(bytes) * 8 * 1000 / millis;
    u64::try_from(bits_per_sec).unwrap_or(u64::MAX)
}
