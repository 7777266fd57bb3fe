use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// IANA protocol numbers used by the flow pipeline.
pub const PROTOCOL_ICMP: u8 = 1;
pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;
pub const PROTOCOL_ICMPV6: u8 = 58;
pub const PROTOCOL_SCTP: u8 = 132;

/// Immutable 5-tuple identity of a network flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tuple {
    pub source_address: IpAddr,
    pub destination_address: IpAddr,
    pub protocol: u8,
    pub source_port: u16,
    pub destination_port: u16,
}

impl Tuple {
    pub fn new(
        source_address: IpAddr,
        destination_address: IpAddr,
        protocol: u8,
        source_port: u16,
        destination_port: u16,
    ) -> Self {
        Self {
            source_address,
            destination_address,
            protocol,
            source_port,
            destination_port,
        }
    }
}

impl Default for Tuple {
    fn default() -> Self {
        Self {
            source_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            protocol: 0,
            source_port: 0,
            destination_port: 0,
        }
    }
}

/// Unique key of a tracked connection within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(Tuple);

impl ConnectionKey {
    /// Returns the tuple this key was derived from.
    pub fn tuple(&self) -> &Tuple {
        &self.0
    }
}

impl From<Tuple> for ConnectionKey {
    fn from(tuple: Tuple) -> Self {
        Self(tuple)
    }
}

impl From<&Tuple> for ConnectionKey {
    fn from(tuple: &Tuple) -> Self {
        Self(*tuple)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.0;
        write!(
            f,
            "{}/{}-{}/{}-{}",
            t.source_address, t.source_port, t.destination_address, t.destination_port, t.protocol
        )
    }
}

/// Maps a protocol number to the name used by service registries.
///
/// Only protocols a Service can expose are mapped; everything else is `None`.
pub fn service_protocol_name(protocol: u8) -> Option<&'static str> {
    match protocol {
        PROTOCOL_TCP => Some("TCP"),
        PROTOCOL_UDP => Some("UDP"),
        PROTOCOL_SCTP => Some("SCTP"),
        _ => None,
    }
}
