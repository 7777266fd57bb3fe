use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tuple::{ConnectionKey, Tuple};

/// Classification of a flow relative to the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FlowType {
    #[default]
    Unspecified = 0,
    IntraNode = 1,
    InterNode = 2,
    ToExternal = 3,
    FromExternal = 4,
}

impl FlowType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Unspecified),
            1 => Some(Self::IntraNode),
            2 => Some(Self::InterNode),
            3 => Some(Self::ToExternal),
            4 => Some(Self::FromExternal),
            _ => None,
        }
    }
}

/// Action taken by the network policy rule a flow was attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RuleAction {
    #[default]
    NoAction = 0,
    Allow = 1,
    Drop = 2,
    Reject = 3,
}

impl RuleAction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::NoAction),
            1 => Some(Self::Allow),
            2 => Some(Self::Drop),
            3 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Kind of network policy a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PolicyType {
    #[default]
    Unspecified = 0,
    K8sNetworkPolicy = 1,
    NetworkPolicy = 2,
    ClusterNetworkPolicy = 3,
}

/// Why a flow record was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EndReason {
    IdleTimeout = 1,
    ActiveTimeout = 2,
    EndOfFlow = 3,
    ForcedEnd = 4,
}

/// Pod identity resolved for one side of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PodIdentity {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    /// Pod labels rendered as a JSON object string.
    pub labels: String,
}

/// Network policy rule a flow was attributed to.
///
/// The datapath only reports `uuid` and `action`; the remaining fields are
/// filled in by the policy rule resolver at first insertion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyAttribution {
    pub uuid: Option<Uuid>,
    pub name: String,
    pub namespace: String,
    pub rule_name: String,
    pub action: RuleAction,
    pub policy_type: PolicyType,
}

/// Mutable tracked state of one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub flow_key: Tuple,
    pub start_time: SystemTime,
    pub stop_time: SystemTime,
    /// Time of the last successful export, if any.
    pub last_export_time: Option<SystemTime>,
    pub is_active: bool,

    pub original_bytes: u64,
    pub original_packets: u64,
    pub reverse_bytes: u64,
    pub reverse_packets: u64,

    // Counter values at the last successful export.
    pub prev_bytes: u64,
    pub prev_packets: u64,
    pub prev_reverse_bytes: u64,
    pub prev_reverse_packets: u64,

    pub tcp_state: String,
    pub flow_type: FlowType,

    // Enrichment, set once at first insertion.
    pub destination_service_address: Option<IpAddr>,
    pub destination_service_port: u16,
    pub destination_service_port_name: String,
    pub source_pod: PodIdentity,
    pub destination_pod: PodIdentity,
    pub ingress_policy: Option<PolicyAttribution>,
    pub egress_policy: Option<PolicyAttribution>,
}

impl Connection {
    /// Creates an active connection first seen at `time` with zero counters.
    pub fn new(flow_key: Tuple, time: SystemTime) -> Self {
        Self {
            flow_key,
            start_time: time,
            stop_time: time,
            last_export_time: None,
            is_active: true,
            original_bytes: 0,
            original_packets: 0,
            reverse_bytes: 0,
            reverse_packets: 0,
            prev_bytes: 0,
            prev_packets: 0,
            prev_reverse_bytes: 0,
            prev_reverse_packets: 0,
            tcp_state: String::new(),
            flow_type: FlowType::Unspecified,
            destination_service_address: None,
            destination_service_port: 0,
            destination_service_port_name: String::new(),
            source_pod: PodIdentity::default(),
            destination_pod: PodIdentity::default(),
            ingress_policy: None,
            egress_policy: None,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::from(&self.flow_key)
    }

    pub fn delta_bytes(&self) -> u64 {
        self.original_bytes.saturating_sub(self.prev_bytes)
    }

    pub fn delta_packets(&self) -> u64 {
        self.original_packets.saturating_sub(self.prev_packets)
    }

    pub fn reverse_delta_bytes(&self) -> u64 {
        self.reverse_bytes.saturating_sub(self.prev_reverse_bytes)
    }

    pub fn reverse_delta_packets(&self) -> u64 {
        self.reverse_packets.saturating_sub(self.prev_reverse_packets)
    }

    /// Records the counters of an exported snapshot as the new delta baseline.
    pub(crate) fn mark_exported(&mut self, exported: &Connection, at: SystemTime) {
        self.prev_bytes = exported.original_bytes;
        self.prev_packets = exported.original_packets;
        self.prev_reverse_bytes = exported.reverse_bytes;
        self.prev_reverse_packets = exported.reverse_packets;
        self.last_export_time = Some(at);
    }
}
