use std::sync::Arc;
use std::time::SystemTime;

use prometheus::Gauge;

use crate::flow::{Connection, ConnectionKey};
use crate::metadata::{InterfaceResolver, PolicyRuleResolver, ServiceResolver};

use super::resolve_policy_rules;
use super::store::{ConnectionStore, Delta, FlowTimeouts};

/// Store for connections allowed through the datapath.
///
/// Updates carry forward and reverse deltas taken from conntrack counters.
pub struct ConntrackConnectionStore {
    store: Arc<ConnectionStore>,
    rules: Arc<dyn PolicyRuleResolver>,
}

impl ConntrackConnectionStore {
    pub fn new(
        timeouts: FlowTimeouts,
        services: Arc<dyn ServiceResolver>,
        interfaces: Arc<dyn InterfaceResolver>,
        rules: Arc<dyn PolicyRuleResolver>,
        connection_count: Gauge,
    ) -> Self {
        Self {
            store: Arc::new(ConnectionStore::new(
                "conntrack",
                timeouts,
                services,
                interfaces,
                connection_count,
            )),
            rules,
        }
    }

    pub fn add_or_update_conn(&self, observed: &Connection, observed_time: SystemTime, delta: Delta) {
        let rules = &self.rules;
        self.store
            .add_or_update_with(observed, observed_time, delta, |conn| {
                resolve_policy_rules(rules.as_ref(), conn)
            });
    }

    /// Marks a connection closed by the datapath.
    pub fn end_conn(&self, key: &ConnectionKey, observed_time: SystemTime) -> bool {
        self.store.end_conn(key, observed_time)
    }

    pub fn get_conn_by_key(&self, key: &ConnectionKey) -> Option<Connection> {
        self.store.get_conn_by_key(key)
    }

    pub fn delete_conn_by_key(&self, key: &ConnectionKey) -> bool {
        self.store.delete_conn_by_key(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn store(&self) -> &Arc<ConnectionStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv6Addr};

    use super::*;
    use crate::connections::store::tests::{at, timeouts, CountingResolver};
    use crate::flow::tuple::PROTOCOL_UDP;
    use crate::flow::{EndReason, Tuple};
    use crate::metadata::StaticRegistry;

    #[test]
    fn test_forward_and_reverse_deltas() {
        let resolver = Arc::new(CountingResolver::default());
        let gauge = Gauge::new("connection_count", "test").unwrap();
        let store = ConntrackConnectionStore::new(
            timeouts(),
            resolver.clone(),
            resolver,
            Arc::new(StaticRegistry::new()),
            gauge.clone(),
        );

        let tuple = Tuple::new(
            IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1)),
            IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2)),
            PROTOCOL_UDP,
            5353,
            53,
        );
        let mut observed = Connection::new(tuple, at(500));
        observed.original_bytes = 100;
        observed.original_packets = 1;
        observed.reverse_bytes = 200;
        observed.reverse_packets = 1;

        store.add_or_update_conn(&observed, at(500), Delta::default());
        store.add_or_update_conn(
            &observed,
            at(501),
            Delta {
                bytes: 50,
                packets: 1,
                reverse_bytes: 80,
                reverse_packets: 2,
            },
        );

        let got = store.get_conn_by_key(&observed.key()).unwrap();
        assert_eq!(got.original_bytes, 150);
        assert_eq!(got.original_packets, 2);
        assert_eq!(got.reverse_bytes, 280);
        assert_eq!(got.reverse_packets, 3);
        assert_eq!(gauge.get(), 1.0);

        assert!(store.end_conn(&observed.key(), at(502)));
        let due = store.store().take_due(at(502));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reason, EndReason::EndOfFlow);

        store.store().complete_export(&due, true, at(502));
        assert!(store.is_empty());
        assert_eq!(gauge.get(), 0.0);
    }
}
