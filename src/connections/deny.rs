use std::sync::Arc;
use std::time::SystemTime;

use prometheus::Gauge;

use crate::flow::{Connection, ConnectionKey};
use crate::metadata::{InterfaceResolver, PolicyRuleResolver, ServiceResolver};

use super::resolve_policy_rules;
use super::store::{ConnectionStore, Delta, FlowTimeouts};

/// Store for connections denied by network policy.
///
/// Every report of a denied connection stands for one dropped packet.
pub struct DenyConnectionStore {
    store: Arc<ConnectionStore>,
    rules: Arc<dyn PolicyRuleResolver>,
}

impl DenyConnectionStore {
    pub fn new(
        timeouts: FlowTimeouts,
        services: Arc<dyn ServiceResolver>,
        interfaces: Arc<dyn InterfaceResolver>,
        rules: Arc<dyn PolicyRuleResolver>,
        denied_connection_count: Gauge,
    ) -> Self {
        Self {
            store: Arc::new(ConnectionStore::new(
                "deny",
                timeouts,
                services,
                interfaces,
                denied_connection_count,
            )),
            rules,
        }
    }

    /// Records one denied packet of `bytes` bytes. The packet counters carried
    /// by `observed` are ignored, on first insertion as on every update.
    pub fn add_or_update_conn(&self, observed: &Connection, observed_time: SystemTime, bytes: u64) {
        let mut denied = observed.clone();
        denied.original_bytes = bytes;
        denied.original_packets = 1;
        denied.reverse_bytes = 0;
        denied.reverse_packets = 0;

        let rules = &self.rules;
        self.store.add_or_update_with(
            &denied,
            observed_time,
            Delta::new(bytes, 1),
            |conn| resolve_policy_rules(rules.as_ref(), conn),
        );
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

    /// The underlying store, shared with the flow exporter.
    pub fn store(&self) -> &Arc<ConnectionStore> {
        &self.store
    }
}
