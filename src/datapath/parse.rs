//! Decoding of datapath flow event datagrams.
//!
//! All integers are little-endian. Layout:
//!
//! ```text
//! offset  size  field
//!  0      1     version (1)
//!  1      1     kind (1 conntrack update, 2 conntrack end, 3 deny)
//!  2      1     address family (4 or 6)
//!  3      1     IP protocol
//!  4      2     source port
//!  6      2     destination port
//!  8      1     flags (bit 0 service, bit 1 ingress rule, bit 2 egress rule)
//!  9      1     flow type
//! 10      1     conntrack TCP state
//! 11      5     reserved
//! 16      8     timestamp, ns since Unix epoch
//! 24      8     bytes
//! 32      8     packets
//! 40      A     source address (A = 4 or 16)
//!         A     destination address
//! conntrack kinds only:
//!         8     reverse bytes
//!         8     reverse packets
//! if service flag:
//!         A     service address
//!         2     service port
//! per rule flag (ingress, then egress):
//!        16     rule UUID
//!         1     rule action
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, UNIX_EPOCH};

use thiserror::Error;
use uuid::Uuid;

use super::event::{EventKind, FlowEvent, RuleRef, EVENT_VERSION, TCP_STATES};
use crate::flow::{FlowType, RuleAction, Tuple};

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 40;

pub const FLAG_SERVICE: u8 = 1 << 0;
pub const FLAG_INGRESS_RULE: u8 = 1 << 1;
pub const FLAG_EGRESS_RULE: u8 = 1 << 2;
const KNOWN_FLAGS: u8 = FLAG_SERVICE | FLAG_INGRESS_RULE | FLAG_EGRESS_RULE;

/// Errors that can occur during event parsing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("event too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unsupported event version: {raw}")]
    UnsupportedVersion { raw: u8 },

    #[error("unknown event kind: {raw}")]
    UnknownKind { raw: u8 },

    #[error("unknown address family: {raw}")]
    UnknownFamily { raw: u8 },

    #[error("unknown flags: {raw:#04x}")]
    UnknownFlags { raw: u8 },

    #[error("unknown flow type: {raw}")]
    UnknownFlowType { raw: u8 },

    #[error("unknown TCP state: {raw}")]
    UnknownTcpState { raw: u8 },

    #[error("reading {event_name}: unexpected end of data at offset {offset}")]
    PayloadTruncated {
        event_name: &'static str,
        offset: usize,
    },

    #[error("reading {event_name}: invalid rule action byte {raw}")]
    InvalidRuleAction { event_name: &'static str, raw: u8 },

    #[error("reading {event_name}: {extra} trailing bytes")]
    TrailingBytes {
        event_name: &'static str,
        extra: usize,
    },
}

impl ParseError {
    /// Short label used as the `error_type` metric dimension.
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Truncated { .. } | Self::PayloadTruncated { .. } => "truncated",
            Self::UnsupportedVersion { .. } => "version",
            Self::UnknownKind { .. } => "kind",
            Self::UnknownFamily { .. } => "family",
            Self::UnknownFlags { .. } => "flags",
            Self::UnknownFlowType { .. } | Self::UnknownTcpState { .. } => "field",
            Self::InvalidRuleAction { .. } => "rule_action",
            Self::TrailingBytes { .. } => "trailing",
        }
    }
}

/// Parse a raw datagram into a [`FlowEvent`].
pub fn parse_event(data: &[u8]) -> Result<FlowEvent, ParseError> {
    if data.len() < HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let mut r = Reader::new(data, "event header");

    let version = r.u8()?;
    if version != EVENT_VERSION {
        return Err(ParseError::UnsupportedVersion { raw: version });
    }

    let kind_raw = r.u8()?;
    let kind = EventKind::from_u8(kind_raw).ok_or(ParseError::UnknownKind { raw: kind_raw })?;

    let family = r.u8()?;
    if family != 4 && family != 6 {
        return Err(ParseError::UnknownFamily { raw: family });
    }

    let protocol = r.u8()?;
    let source_port = r.u16()?;
    let destination_port = r.u16()?;

    let flags = r.u8()?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(ParseError::UnknownFlags { raw: flags });
    }

    let flow_type_raw = r.u8()?;
    let flow_type =
        FlowType::from_u8(flow_type_raw).ok_or(ParseError::UnknownFlowType { raw: flow_type_raw })?;

    let tcp_state_raw = r.u8()?;
    let tcp_state = TCP_STATES
        .get(usize::from(tcp_state_raw))
        .copied()
        .ok_or(ParseError::UnknownTcpState { raw: tcp_state_raw })?;

    r.skip(5)?;
    let timestamp = UNIX_EPOCH + Duration::from_nanos(r.u64()?);
    let bytes = r.u64()?;
    let packets = r.u64()?;

    r.event_name = kind.as_str();
    let source_address = r.ip(family)?;
    let destination_address = r.ip(family)?;

    let (reverse_bytes, reverse_packets) = match kind {
        EventKind::ConntrackUpdate | EventKind::ConntrackEnd => (r.u64()?, r.u64()?),
        EventKind::Deny => (0, 0),
    };

    let service = if flags & FLAG_SERVICE != 0 {
        Some((r.ip(family)?, r.u16()?))
    } else {
        None
    };

    let ingress_rule = if flags & FLAG_INGRESS_RULE != 0 {
        Some(r.rule()?)
    } else {
        None
    };

    let egress_rule = if flags & FLAG_EGRESS_RULE != 0 {
        Some(r.rule()?)
    } else {
        None
    };

    r.finish()?;

    Ok(FlowEvent {
        kind,
        tuple: Tuple::new(
            source_address,
            destination_address,
            protocol,
            source_port,
            destination_port,
        ),
        timestamp,
        flow_type,
        tcp_state,
        bytes,
        packets,
        reverse_bytes,
        reverse_packets,
        service,
        ingress_rule,
        egress_rule,
    })
}

/// Encodes an event in the datagram layout accepted by [`parse_event`].
///
/// IPv4 is used only when every address in the event is IPv4.
pub fn encode_event(event: &FlowEvent) -> Vec<u8> {
    let all_v4 = event.tuple.source_address.is_ipv4()
        && event.tuple.destination_address.is_ipv4()
        && event.service.map_or(true, |(addr, _)| addr.is_ipv4());
    let family: u8 = if all_v4 { 4 } else { 6 };

    let mut flags = 0u8;
    if event.service.is_some() {
        flags |= FLAG_SERVICE;
    }
    if event.ingress_rule.is_some() {
        flags |= FLAG_INGRESS_RULE;
    }
    if event.egress_rule.is_some() {
        flags |= FLAG_EGRESS_RULE;
    }

    let tcp_state = TCP_STATES
        .iter()
        .position(|s| *s == event.tcp_state)
        .and_then(|idx| u8::try_from(idx).ok())
        .unwrap_or(0);
    let timestamp_ns = event
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);

    let mut out = Vec::with_capacity(HEADER_SIZE + 96);
    out.push(EVENT_VERSION);
    out.push(event.kind as u8);
    out.push(family);
    out.push(event.tuple.protocol);
    out.extend_from_slice(&event.tuple.source_port.to_le_bytes());
    out.extend_from_slice(&event.tuple.destination_port.to_le_bytes());
    out.push(flags);
    out.push(event.flow_type as u8);
    out.push(tcp_state);
    out.extend_from_slice(&[0u8; 5]);
    out.extend_from_slice(&timestamp_ns.to_le_bytes());
    out.extend_from_slice(&event.bytes.to_le_bytes());
    out.extend_from_slice(&event.packets.to_le_bytes());

    push_ip(&mut out, event.tuple.source_address, family);
    push_ip(&mut out, event.tuple.destination_address, family);

    if event.kind != EventKind::Deny {
        out.extend_from_slice(&event.reverse_bytes.to_le_bytes());
        out.extend_from_slice(&event.reverse_packets.to_le_bytes());
    }

    if let Some((addr, port)) = event.service {
        push_ip(&mut out, addr, family);
        out.extend_from_slice(&port.to_le_bytes());
    }

    for rule in [event.ingress_rule, event.egress_rule].into_iter().flatten() {
        out.extend_from_slice(rule.uuid.as_bytes());
        out.push(rule.action as u8);
    }

    out
}

fn push_ip(out: &mut Vec<u8>, addr: IpAddr, family: u8) {
    match (addr, family) {
        (IpAddr::V4(v4), 4) => out.extend_from_slice(&v4.octets()),
        (IpAddr::V4(v4), _) => out.extend_from_slice(&v4.to_ipv6_mapped().octets()),
        (IpAddr::V6(v6), _) => out.extend_from_slice(&v6.octets()),
    }
}

// ---------------------------------------------------------------------------
// Bounds-checked sequential reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
    event_name: &'static str,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], event_name: &'static str) -> Self {
        Self {
            data,
            offset: 0,
            event_name,
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let end = self.offset + N;
        let bytes = self
            .data
            .get(self.offset..end)
            .and_then(|slice| <[u8; N]>::try_from(slice).ok())
            .ok_or(ParseError::PayloadTruncated {
                event_name: self.event_name,
                offset: self.offset,
            })?;
        self.offset = end;
        Ok(bytes)
    }

    fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        if self.offset + n > self.data.len() {
            return Err(ParseError::PayloadTruncated {
                event_name: self.event_name,
                offset: self.offset,
            });
        }
        self.offset += n;
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    fn ip(&mut self, family: u8) -> Result<IpAddr, ParseError> {
        if family == 4 {
            Ok(IpAddr::V4(Ipv4Addr::from(self.take::<4>()?)))
        } else {
            let v6 = Ipv6Addr::from(self.take::<16>()?);
            Ok(v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4))
        }
    }

    fn rule(&mut self) -> Result<RuleRef, ParseError> {
        let uuid = Uuid::from_bytes(self.take::<16>()?);
        let raw = self.u8()?;
        let action = RuleAction::from_u8(raw).ok_or(ParseError::InvalidRuleAction {
            event_name: self.event_name,
            raw,
        })?;
        Ok(RuleRef { uuid, action })
    }

    fn finish(&self) -> Result<(), ParseError> {
        let extra = self.data.len() - self.offset;
        if extra > 0 {
            return Err(ParseError::TrailingBytes {
                event_name: self.event_name,
                extra,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::flow::tuple::{PROTOCOL_TCP, PROTOCOL_UDP};

    fn deny_event() -> FlowEvent {
        FlowEvent {
            kind: EventKind::Deny,
            tuple: Tuple::new(
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                PROTOCOL_TCP,
                40000,
                443,
            ),
            timestamp: UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789),
            flow_type: FlowType::IntraNode,
            tcp_state: "",
            bytes: 60,
            packets: 1,
            reverse_bytes: 0,
            reverse_packets: 0,
            service: None,
            ingress_rule: Some(RuleRef {
                uuid: Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef),
                action: RuleAction::Reject,
            }),
            egress_rule: None,
        }
    }

    #[test]
    fn test_parse_deny_event() {
        let data = encode_event(&deny_event());
        assert_eq!(data.len(), HEADER_SIZE + 8 + 17);

        let parsed = parse_event(&data).unwrap();
        assert_eq!(parsed, deny_event());

        let conn = parsed.to_connection();
        assert_eq!(conn.original_packets, 1);
        let ingress = conn.ingress_policy.unwrap();
        assert_eq!(ingress.action, RuleAction::Reject);
        assert_eq!(ingress.name, "");
        assert!(conn.egress_policy.is_none());
    }

    #[test]
    fn test_parse_conntrack_v6_with_service() {
        let event = FlowEvent {
            kind: EventKind::ConntrackUpdate,
            tuple: Tuple::new(
                IpAddr::V6("fd00::1".parse().unwrap()),
                IpAddr::V6("fd00::2".parse().unwrap()),
                PROTOCOL_UDP,
                5353,
                53,
            ),
            timestamp: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            flow_type: FlowType::InterNode,
            tcp_state: "",
            bytes: 1200,
            packets: 4,
            reverse_bytes: 800,
            reverse_packets: 3,
            service: Some((IpAddr::V6("fd00:10::a".parse().unwrap()), 53)),
            ingress_rule: None,
            egress_rule: None,
        };
        let data = encode_event(&event);
        let parsed = parse_event(&data).unwrap();
        assert_eq!(parsed, event);

        let delta = parsed.delta();
        assert_eq!(delta.reverse_bytes, 800);
        assert_eq!(delta.reverse_packets, 3);
        let conn = parsed.to_connection();
        assert_eq!(conn.destination_service_port, 53);
        assert_eq!(conn.flow_type, FlowType::InterNode);
    }

    #[test]
    fn test_tcp_state_is_decoded() {
        let mut event = deny_event();
        event.kind = EventKind::ConntrackEnd;
        event.tcp_state = "TIME_WAIT";
        let data = encode_event(&event);
        assert_eq!(data[10], 7);
        assert_eq!(parse_event(&data).unwrap().tcp_state, "TIME_WAIT");
    }

    #[test]
    fn test_short_datagram_is_rejected() {
        assert_eq!(
            parse_event(&[1u8; 12]),
            Err(ParseError::Truncated { size: 12 })
        );
    }

    #[test]
    fn test_header_field_errors() {
        let good = encode_event(&deny_event());

        let mut bad = good.clone();
        bad[0] = 2;
        assert_eq!(parse_event(&bad), Err(ParseError::UnsupportedVersion { raw: 2 }));

        let mut bad = good.clone();
        bad[1] = 9;
        assert_eq!(parse_event(&bad), Err(ParseError::UnknownKind { raw: 9 }));

        let mut bad = good.clone();
        bad[2] = 5;
        assert_eq!(parse_event(&bad), Err(ParseError::UnknownFamily { raw: 5 }));

        let mut bad = good.clone();
        bad[8] |= 0x80;
        assert!(matches!(parse_event(&bad), Err(ParseError::UnknownFlags { .. })));

        let mut bad = good.clone();
        bad[9] = 42;
        assert_eq!(parse_event(&bad), Err(ParseError::UnknownFlowType { raw: 42 }));

        let mut bad = good;
        bad[10] = 200;
        assert_eq!(parse_event(&bad), Err(ParseError::UnknownTcpState { raw: 200 }));
    }

    #[test]
    fn test_truncated_payload_and_trailing_bytes() {
        let good = encode_event(&deny_event());

        let cut = &good[..good.len() - 1];
        assert!(matches!(
            parse_event(cut),
            Err(ParseError::PayloadTruncated { event_name: "deny", .. })
        ));

        let mut long = good.clone();
        long.push(0);
        assert_eq!(
            parse_event(&long),
            Err(ParseError::TrailingBytes {
                event_name: "deny",
                extra: 1
            })
        );

        let mut bad_action = good;
        let last = bad_action.len() - 1;
        bad_action[last] = 7;
        assert_eq!(
            parse_event(&bad_action),
            Err(ParseError::InvalidRuleAction {
                event_name: "deny",
                raw: 7
            })
        );
    }

    #[test]
    fn test_timestamp_precision() {
        let parsed = parse_event(&encode_event(&deny_event())).unwrap();
        let ns = parsed
            .timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        assert_eq!(ns, 1_700_000_000_123_456_789);
    }
}
