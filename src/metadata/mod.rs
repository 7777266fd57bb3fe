//! Out-of-band metadata used to enrich newly tracked connections.
//!
//! The stores only depend on the resolver traits; [`StaticRegistry`] is the
//! configuration-backed implementation used by the agent.

mod static_registry;

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use uuid::Uuid;

use crate::flow::tuple::{PROTOCOL_SCTP, PROTOCOL_TCP, PROTOCOL_UDP};
use crate::flow::{PodIdentity, PolicyType};

pub use static_registry::StaticRegistry;

/// Identifies one port of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServicePortName {
    pub namespace: String,
    pub name: String,
    pub port: String,
    pub protocol: String,
}

impl fmt::Display for ServicePortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

/// Pod owning a local interface address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterfaceMetadata {
    pub pod_name: String,
    pub pod_namespace: String,
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
}

impl InterfaceMetadata {
    /// Converts to the identity stored on a connection, rendering labels as JSON.
    pub fn to_identity(&self) -> PodIdentity {
        let labels = if self.labels.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&self.labels).unwrap_or_default()
        };

        PodIdentity {
            name: self.pod_name.clone(),
            namespace: self.pod_namespace.clone(),
            node_name: self.node_name.clone(),
            labels,
        }
    }
}

/// Network policy rule metadata looked up by UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub uuid: Uuid,
    pub name: String,
    pub namespace: String,
    pub rule_name: String,
    pub policy_type: PolicyType,
}

/// Resolves a service frontend to its port name.
pub trait ServiceResolver: Send + Sync {
    fn service_by_address(
        &self,
        address: IpAddr,
        port: u16,
        protocol: &str,
    ) -> Option<ServicePortName>;
}

/// Resolves an IP address to the local pod that owns it.
pub trait InterfaceResolver: Send + Sync {
    fn interface_by_ip(&self, address: IpAddr) -> Option<InterfaceMetadata>;
}

/// Resolves a policy rule UUID reported by the datapath.
pub trait PolicyRuleResolver: Send + Sync {
    fn rule_by_uuid(&self, uuid: Uuid) -> Option<PolicyRule>;
}

/// Parses a service protocol name into its IANA number.
pub fn protocol_number(name: &str) -> Option<u8> {
    match name.to_ascii_uppercase().as_str() {
        "TCP" => Some(PROTOCOL_TCP),
        "UDP" => Some(PROTOCOL_UDP),
        "SCTP" => Some(PROTOCOL_SCTP),
        _ => None,
    }
}
