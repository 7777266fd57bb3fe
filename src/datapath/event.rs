use std::net::IpAddr;
use std::time::SystemTime;

use uuid::Uuid;

use crate::connections::Delta;
use crate::flow::{Connection, FlowType, PolicyAttribution, RuleAction, Tuple};

/// Datagram format version understood by this build.
pub const EVENT_VERSION: u8 = 1;

/// EventKind identifies what a datapath datagram reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Counter update for an allowed connection.
    ConntrackUpdate = 1,
    /// An allowed connection was removed from conntrack.
    ConntrackEnd = 2,
    /// A packet was dropped or rejected by policy.
    Deny = 3,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConntrackUpdate => "conntrack_update",
            Self::ConntrackEnd => "conntrack_end",
            Self::Deny => "deny",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ConntrackUpdate),
            2 => Some(Self::ConntrackEnd),
            3 => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Linux conntrack TCP states, in kernel order.
pub const TCP_STATES: [&str; 10] = [
    "",
    "SYN_SENT",
    "SYN_RECV",
    "ESTABLISHED",
    "FIN_WAIT",
    "CLOSE_WAIT",
    "LAST_ACK",
    "TIME_WAIT",
    "CLOSE",
    "SYN_SENT2",
];

/// Policy rule reported by the datapath for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleRef {
    pub uuid: Uuid,
    pub action: RuleAction,
}

impl RuleRef {
    fn attribution(self) -> PolicyAttribution {
        PolicyAttribution {
            uuid: Some(self.uuid),
            action: self.action,
            ..Default::default()
        }
    }
}

/// A decoded datapath datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEvent {
    pub kind: EventKind,
    pub tuple: Tuple,
    pub timestamp: SystemTime,
    pub flow_type: FlowType,
    pub tcp_state: &'static str,
    pub bytes: u64,
    pub packets: u64,
    pub reverse_bytes: u64,
    pub reverse_packets: u64,
    /// Service frontend the connection was addressed to, if any.
    pub service: Option<(IpAddr, u16)>,
    pub ingress_rule: Option<RuleRef>,
    pub egress_rule: Option<RuleRef>,
}

impl FlowEvent {
    /// Builds the observed connection for this event. Counters hold the
    /// event's increments, which become the totals on first insertion.
    pub fn to_connection(&self) -> Connection {
        let mut conn = Connection::new(self.tuple, self.timestamp);
        conn.original_bytes = self.bytes;
        conn.original_packets = self.packets;
        conn.reverse_bytes = self.reverse_bytes;
        conn.reverse_packets = self.reverse_packets;
        conn.flow_type = self.flow_type;
        conn.tcp_state = self.tcp_state.to_string();
        if let Some((address, port)) = self.service {
            conn.destination_service_address = Some(address);
            conn.destination_service_port = port;
        }
        conn.ingress_policy = self.ingress_rule.map(RuleRef::attribution);
        conn.egress_policy = self.egress_rule.map(RuleRef::attribution);
        conn
    }

    pub fn delta(&self) -> Delta {
        Delta {
            bytes: self.bytes,
            packets: self.packets,
            reverse_bytes: self.reverse_bytes,
            reverse_packets: self.reverse_packets,
        }
    }
}
