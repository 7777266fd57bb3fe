use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use prometheus::Gauge;

use crate::flow::tuple::service_protocol_name;
use crate::flow::{Connection, ConnectionKey, EndReason};
use crate::metadata::{InterfaceResolver, ServiceResolver};

use super::expiry::{ExpiryItem, ExpiryQueue};

/// Flow timeouts applied by a connection store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTimeouts {
    /// Maximum time an active flow stays unreported.
    pub active: Duration,
    /// Time without updates after which a flow is idle.
    pub inactive: Duration,
    /// Delay before a connection whose export failed is offered again.
    pub retry: Duration,
}

/// Counter increments carried by one observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delta {
    pub bytes: u64,
    pub packets: u64,
    pub reverse_bytes: u64,
    pub reverse_packets: u64,
}

impl Delta {
    pub fn new(bytes: u64, packets: u64) -> Self {
        Self {
            bytes,
            packets,
            ..Default::default()
        }
    }

    fn merge(&mut self, other: Delta) {
        self.bytes += other.bytes;
        self.packets += other.packets;
        self.reverse_bytes += other.reverse_bytes;
        self.reverse_packets += other.reverse_packets;
    }
}

/// A connection handed to the exporter, with the reason it is due.
#[derive(Debug, Clone)]
pub struct DueConnection {
    pub key: ConnectionKey,
    /// Snapshot of the connection at the time it was taken.
    pub connection: Connection,
    pub reason: EndReason,
    version: u64,
}

struct Entry {
    conn: Connection,
    // Bumped on every update; lets export completion detect concurrent updates.
    version: u64,
    // Set when the datapath reported the flow as finished.
    ended: bool,
}

/// Updates that arrived while the first insertion of a key was enriching.
struct Pending {
    delta: Delta,
    latest: SystemTime,
    tcp_state: String,
    // Time the datapath reported the flow finished, if it did.
    ended_at: Option<SystemTime>,
}

struct Inner {
    conns: HashMap<ConnectionKey, Entry>,
    queue: ExpiryQueue<ConnectionKey>,
    pending: HashMap<ConnectionKey, Pending>,
}

impl Inner {
    fn apply_update(
        &mut self,
        key: &ConnectionKey,
        observed: &Connection,
        observed_time: SystemTime,
        delta: Delta,
        inactive: Duration,
    ) -> bool {
        let Some(entry) = self.conns.get_mut(key) else {
            return false;
        };

        let conn = &mut entry.conn;
        if observed_time >= conn.stop_time && conn.tcp_state != observed.tcp_state {
            conn.tcp_state.clone_from(&observed.tcp_state);
        }
        conn.original_bytes += delta.bytes;
        conn.original_packets += delta.packets;
        conn.reverse_bytes += delta.reverse_bytes;
        conn.reverse_packets += delta.reverse_packets;
        conn.stop_time = conn.stop_time.max(observed_time);
        conn.is_active = true;
        entry.version += 1;
        entry.ended = false;

        let idle_candidate = observed_time + inactive;
        let item = match self.queue.get(key) {
            Some(current) => ExpiryItem {
                active_expire: current.active_expire,
                idle_expire: current.idle_expire.max(idle_candidate),
            },
            None => ExpiryItem {
                active_expire: idle_candidate,
                idle_expire: idle_candidate,
            },
        };
        self.queue.schedule(*key, item);

        true
    }
}

/// Thread-safe registry of live connections and their expiry schedule.
///
/// The connection map and expiry queue share one mutex, so every live
/// connection has exactly one queue entry between operations. Metadata
/// resolvers are called at most once per key, outside the lock.
pub struct ConnectionStore {
    name: &'static str,
    timeouts: FlowTimeouts,
    services: Arc<dyn ServiceResolver>,
    interfaces: Arc<dyn InterfaceResolver>,
    live_count: Gauge,
    inner: Mutex<Inner>,
}

impl ConnectionStore {
    /// Creates an empty store. `live_count` is set to the number of tracked
    /// connections after every mutation.
    pub fn new(
        name: &'static str,
        timeouts: FlowTimeouts,
        services: Arc<dyn ServiceResolver>,
        interfaces: Arc<dyn InterfaceResolver>,
        live_count: Gauge,
    ) -> Self {
        Self {
            name,
            timeouts,
            services,
            interfaces,
            live_count,
            inner: Mutex::new(Inner {
                conns: HashMap::new(),
                queue: ExpiryQueue::new(),
                pending: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn timeouts(&self) -> FlowTimeouts {
        self.timeouts
    }

    /// Inserts a new connection or folds `delta` into an existing one.
    pub fn add_or_update_conn(&self, observed: &Connection, observed_time: SystemTime, delta: Delta) {
        self.add_or_update_with(observed, observed_time, delta, |_| {});
    }

    /// Like [`Self::add_or_update_conn`], running `enrich` on the new connection
    /// after the built-in resolvers. `enrich` only runs on first insertion.
    pub(crate) fn add_or_update_with<F>(
        &self,
        observed: &Connection,
        observed_time: SystemTime,
        delta: Delta,
        enrich: F,
    ) where
        F: FnOnce(&mut Connection),
    {
        let key = observed.key();

        {
            let mut inner = self.inner.lock();
            if inner.apply_update(&key, observed, observed_time, delta, self.timeouts.inactive) {
                return;
            }

            if let Some(pending) = inner.pending.get_mut(&key) {
                pending.delta.merge(delta);
                if observed_time >= pending.latest {
                    pending.tcp_state.clone_from(&observed.tcp_state);
                }
                pending.latest = pending.latest.max(observed_time);
                pending.ended_at = None;
                return;
            }

            inner.pending.insert(
                key,
                Pending {
                    delta: Delta::default(),
                    latest: observed_time,
                    tcp_state: observed.tcp_state.clone(),
                    ended_at: None,
                },
            );
        }

        let mut conn = observed.clone();
        self.enrich(&mut conn);
        enrich(&mut conn);

        let mut inner = self.inner.lock();
        let pending = inner.pending.remove(&key);

        conn.start_time = observed_time;
        conn.stop_time = observed_time;
        conn.is_active = true;
        conn.last_export_time = None;
        let mut ended_at = None;
        if let Some(pending) = pending {
            conn.original_bytes += pending.delta.bytes;
            conn.original_packets += pending.delta.packets;
            conn.reverse_bytes += pending.delta.reverse_bytes;
            conn.reverse_packets += pending.delta.reverse_packets;
            conn.stop_time = conn.stop_time.max(pending.latest);
            conn.tcp_state = pending.tcp_state;
            ended_at = pending.ended_at;
        }

        let item = match ended_at {
            Some(at) => {
                conn.is_active = false;
                ExpiryItem {
                    active_expire: at,
                    idle_expire: at,
                }
            }
            None => ExpiryItem {
                active_expire: observed_time + self.timeouts.active,
                idle_expire: conn.stop_time + self.timeouts.inactive,
            },
        };
        inner.conns.insert(
            key,
            Entry {
                conn,
                version: 0,
                ended: ended_at.is_some(),
            },
        );
        inner.queue.schedule(key, item);

        tracing::trace!(store = self.name, key = %key, "connection added");
        self.publish_len(&inner);
    }

    fn enrich(&self, conn: &mut Connection) {
        if let Some(service_address) = conn.destination_service_address {
            if let Some(protocol) = service_protocol_name(conn.flow_key.protocol) {
                match self.services.service_by_address(
                    service_address,
                    conn.destination_service_port,
                    protocol,
                ) {
                    Some(name) => conn.destination_service_port_name = name.to_string(),
                    None => tracing::debug!(
                        store = self.name,
                        address = %service_address,
                        port = conn.destination_service_port,
                        protocol,
                        "no service found for destination service address"
                    ),
                }
            }
        }

        if let Some(meta) = self.interfaces.interface_by_ip(conn.flow_key.source_address) {
            conn.source_pod = meta.to_identity();
        }

        if let Some(meta) = self.interfaces.interface_by_ip(conn.flow_key.destination_address) {
            conn.destination_pod = meta.to_identity();
        }
    }

    /// Marks a connection as finished by the datapath so it is exported at
    /// the next scheduler tick. A connection still being inserted is marked
    /// once its insertion completes. Returns false if the key is not tracked.
    pub fn end_conn(&self, key: &ConnectionKey, observed_time: SystemTime) -> bool {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let Some(entry) = inner.conns.get_mut(key) else {
            let Some(pending) = inner.pending.get_mut(key) else {
                return false;
            };
            pending.latest = pending.latest.max(observed_time);
            pending.ended_at = Some(pending.latest);
            return true;
        };
        entry.conn.is_active = false;
        entry.conn.stop_time = entry.conn.stop_time.max(observed_time);
        entry.version += 1;
        entry.ended = true;

        inner.queue.schedule(
            *key,
            ExpiryItem {
                active_expire: observed_time,
                idle_expire: observed_time,
            },
        );

        true
    }

    /// Returns a copy of the connection stored under `key`.
    pub fn get_conn_by_key(&self, key: &ConnectionKey) -> Option<Connection> {
        self.inner.lock().conns.get(key).map(|entry| entry.conn.clone())
    }

    /// Removes a connection and its expiry entry.
    pub fn delete_conn_by_key(&self, key: &ConnectionKey) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.conns.remove(key).is_some();
        inner.queue.remove(key);
        if removed {
            self.publish_len(&inner);
        }
        removed
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        debug_assert_eq!(inner.conns.len(), inner.queue.len());
        inner.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live expiry queue entries.
    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Returns the expiry deadlines currently scheduled for `key`.
    pub fn expiry_of(&self, key: &ConnectionKey) -> Option<ExpiryItem> {
        self.inner.lock().queue.get(key).copied()
    }

    /// Takes every connection due at `now`, earliest first.
    ///
    /// Idle connections are marked inactive. Every returned connection stays
    /// tracked and is provisionally re-armed at `now + retry` until
    /// [`Self::complete_export`] settles it.
    pub fn take_due(&self, now: SystemTime) -> Vec<DueConnection> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let expired = inner.queue.pop_expired(now);
        let retry_at = now + self.timeouts.retry;

        let mut due = Vec::with_capacity(expired.len());
        for (key, item) in expired {
            let Some(entry) = inner.conns.get_mut(&key) else {
                continue;
            };

            let reason = if entry.ended {
                EndReason::EndOfFlow
            } else if item.is_idle_at(now) {
                entry.conn.is_active = false;
                EndReason::IdleTimeout
            } else {
                EndReason::ActiveTimeout
            };

            let rearm = match reason {
                EndReason::ActiveTimeout => ExpiryItem {
                    active_expire: retry_at,
                    idle_expire: item.idle_expire,
                },
                _ => ExpiryItem {
                    active_expire: retry_at,
                    idle_expire: retry_at,
                },
            };
            inner.queue.schedule(key, rearm);

            due.push(DueConnection {
                key,
                connection: entry.conn.clone(),
                reason,
                version: entry.version,
            });
        }

        due
    }

    /// Takes every tracked connection for a final export on shutdown.
    pub fn take_all(&self, now: SystemTime) -> Vec<DueConnection> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let retry_at = now + self.timeouts.retry;

        let mut due = Vec::with_capacity(inner.conns.len());
        for (key, entry) in inner.conns.iter_mut() {
            entry.conn.is_active = false;
            inner.queue.schedule(
                *key,
                ExpiryItem {
                    active_expire: retry_at,
                    idle_expire: retry_at,
                },
            );
            due.push(DueConnection {
                key: *key,
                connection: entry.conn.clone(),
                reason: EndReason::ForcedEnd,
                version: entry.version,
            });
        }

        due
    }

    /// Settles connections previously returned by [`Self::take_due`].
    ///
    /// On success, finished connections that were not updated in the meantime
    /// are removed; all others record the exported counters as their delta
    /// baseline and are re-armed for the next active timeout. On failure the
    /// provisional retry schedule is kept.
    pub fn complete_export(&self, due: &[DueConnection], success: bool, now: SystemTime) {
        if !success || due.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let mut removed = 0usize;

        for d in due {
            let Some(entry) = inner.conns.get_mut(&d.key) else {
                continue;
            };

            let finished = d.reason != EndReason::ActiveTimeout;
            if finished && entry.version == d.version {
                inner.conns.remove(&d.key);
                inner.queue.remove(&d.key);
                removed += 1;
                continue;
            }

            entry.conn.mark_exported(&d.connection, now);
            let idle_expire = inner
                .queue
                .get(&d.key)
                .map(|item| item.idle_expire)
                .unwrap_or(entry.conn.stop_time + self.timeouts.inactive);
            inner.queue.schedule(
                d.key,
                ExpiryItem {
                    active_expire: now + self.timeouts.active,
                    idle_expire,
                },
            );
        }

        if removed > 0 {
            tracing::debug!(store = self.name, removed, "removed exported connections");
            self.publish_len(inner);
        }
    }

    fn publish_len(&self, inner: &Inner) {
        self.live_count.set(inner.conns.len() as f64);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::UNIX_EPOCH;

    use super::*;
    use crate::flow::tuple::{PROTOCOL_ICMP, PROTOCOL_TCP};
    use crate::flow::Tuple;
    use crate::metadata::{InterfaceMetadata, ServicePortName};

    #[derive(Default)]
    pub(crate) struct CountingResolver {
        pub service_calls: AtomicUsize,
        pub interface_calls: AtomicUsize,
    }

    impl ServiceResolver for CountingResolver {
        fn service_by_address(&self, _: IpAddr, port: u16, protocol: &str) -> Option<ServicePortName> {
            self.service_calls.fetch_add(1, Ordering::SeqCst);
            Some(ServicePortName {
                namespace: "serviceNS1".to_string(),
                name: "service1".to_string(),
                port: port.to_string(),
                protocol: protocol.to_string(),
            })
        }
    }

    impl InterfaceResolver for CountingResolver {
        fn interface_by_ip(&self, address: IpAddr) -> Option<InterfaceMetadata> {
            self.interface_calls.fetch_add(1, Ordering::SeqCst);
            (address == IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))).then(|| InterfaceMetadata {
                pod_name: "pod1".to_string(),
                pod_namespace: "ns1".to_string(),
                node_name: "node-a".to_string(),
                ..Default::default()
            })
        }
    }

    pub(crate) fn timeouts() -> FlowTimeouts {
        FlowTimeouts {
            active: Duration::from_secs(60),
            inactive: Duration::from_secs(15),
            retry: Duration::from_secs(1),
        }
    }

    pub(crate) fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn tuple(protocol: u8) -> Tuple {
        Tuple::new(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            IpAddr::V4(Ipv4Addr::new(4, 3, 2, 1)),
            protocol,
            65280,
            255,
        )
    }

    fn observed(protocol: u8, time: SystemTime) -> Connection {
        let mut conn = Connection::new(tuple(protocol), time);
        conn.original_bytes = 60;
        conn.original_packets = 1;
        conn.destination_service_address = Some(IpAddr::V4(Ipv4Addr::new(4, 3, 2, 1)));
        conn.destination_service_port = 255;
        conn
    }

    fn store_with(resolver: Arc<CountingResolver>) -> (ConnectionStore, Gauge) {
        let gauge = Gauge::new("test_connection_count", "test").unwrap();
        let store = ConnectionStore::new(
            "test",
            timeouts(),
            resolver.clone(),
            resolver,
            gauge.clone(),
        );
        (store, gauge)
    }

    #[test]
    fn test_insert_then_update_accumulates() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, gauge) = store_with(resolver);
        let conn = observed(PROTOCOL_TCP, at(1_000));

        store.add_or_update_conn(&conn, at(1_000), Delta::new(60, 1));
        store.add_or_update_conn(&conn, at(1_010), Delta::new(60, 1));

        let got = store.get_conn_by_key(&conn.key()).unwrap();
        assert_eq!(got.original_bytes, 120);
        assert_eq!(got.original_packets, 2);
        assert_eq!(got.start_time, at(1_000));
        assert_eq!(got.stop_time, at(1_010));
        assert!(got.is_active);
        assert_eq!(got.destination_service_port_name, "serviceNS1/service1:255");
        assert_eq!(got.source_pod.name, "pod1");
        assert_eq!(got.destination_pod.name, "");

        assert_eq!(store.len(), 1);
        assert_eq!(store.queue_len(), 1);
        assert_eq!(gauge.get(), 1.0);

        let item = store.expiry_of(&conn.key()).unwrap();
        assert_eq!(item.active_expire, at(1_060));
        assert_eq!(item.idle_expire, at(1_025));
    }

    #[test]
    fn test_out_of_order_update_keeps_stop_time() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, _) = store_with(resolver);
        let conn = observed(PROTOCOL_TCP, at(1_000));

        store.add_or_update_conn(&conn, at(1_010), Delta::new(1, 1));
        store.add_or_update_conn(&conn, at(1_005), Delta::new(1, 1));

        let got = store.get_conn_by_key(&conn.key()).unwrap();
        assert_eq!(got.stop_time, at(1_010));
        assert_eq!(store.expiry_of(&conn.key()).unwrap().idle_expire, at(1_025));
    }

    #[test]
    fn test_resolvers_called_once_per_key() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, _) = store_with(resolver.clone());
        let conn = observed(PROTOCOL_TCP, at(1_000));

        for i in 0..100 {
            store.add_or_update_conn(&conn, at(1_000 + i), Delta::new(10, 1));
        }

        assert_eq!(resolver.service_calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.interface_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.queue_len(), 1);
    }

    #[test]
    fn test_service_lookup_skipped_without_mapped_protocol() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, _) = store_with(resolver.clone());

        store.add_or_update_conn(&observed(PROTOCOL_ICMP, at(1_000)), at(1_000), Delta::default());

        let mut no_service = observed(PROTOCOL_TCP, at(1_000));
        no_service.flow_key.source_port = 1;
        no_service.destination_service_address = None;
        store.add_or_update_conn(&no_service, at(1_000), Delta::default());

        assert_eq!(resolver.service_calls.load(Ordering::SeqCst), 0);
        assert_eq!(resolver.interface_calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.len(), 2);
    }

    struct GatedResolver {
        entered: Mutex<mpsc::Sender<()>>,
        gate: Mutex<mpsc::Receiver<()>>,
        interface_calls: AtomicUsize,
    }

    impl ServiceResolver for GatedResolver {
        fn service_by_address(&self, _: IpAddr, _: u16, _: &str) -> Option<ServicePortName> {
            let _ = self.entered.lock().send(());
            let _ = self.gate.lock().recv();
            None
        }
    }

    impl InterfaceResolver for GatedResolver {
        fn interface_by_ip(&self, _: IpAddr) -> Option<InterfaceMetadata> {
            self.interface_calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn test_updates_during_enrichment_are_merged() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let resolver = Arc::new(GatedResolver {
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
            interface_calls: AtomicUsize::new(0),
        });
        let store = Arc::new(ConnectionStore::new(
            "gated",
            timeouts(),
            resolver.clone(),
            resolver.clone(),
            Gauge::new("gated_count", "test").unwrap(),
        ));
        let conn = observed(PROTOCOL_TCP, at(1_000));

        let inserter = {
            let store = store.clone();
            let conn = conn.clone();
            std::thread::spawn(move || store.add_or_update_conn(&conn, at(1_000), Delta::new(60, 1)))
        };

        entered_rx.recv().unwrap();
        // The store lock is free while the first insertion is enriching.
        store.add_or_update_conn(&conn, at(1_004), Delta::new(40, 2));
        assert!(store.get_conn_by_key(&conn.key()).is_none());

        gate_tx.send(()).unwrap();
        inserter.join().unwrap();

        let got = store.get_conn_by_key(&conn.key()).unwrap();
        assert_eq!(got.original_bytes, 100);
        assert_eq!(got.original_packets, 3);
        assert_eq!(got.start_time, at(1_000));
        assert_eq!(got.stop_time, at(1_004));
        assert_eq!(resolver.interface_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.expiry_of(&conn.key()).unwrap().idle_expire, at(1_019));
    }

    #[test]
    fn test_end_during_enrichment_is_applied_at_insertion() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel();
        let resolver = Arc::new(GatedResolver {
            entered: Mutex::new(entered_tx),
            gate: Mutex::new(gate_rx),
            interface_calls: AtomicUsize::new(0),
        });
        let store = Arc::new(ConnectionStore::new(
            "gated",
            timeouts(),
            resolver.clone(),
            resolver,
            Gauge::new("gated_end_count", "test").unwrap(),
        ));
        let mut conn = observed(PROTOCOL_TCP, at(1_000));
        conn.tcp_state = "SYN_SENT".to_string();

        let inserter = {
            let store = store.clone();
            let conn = conn.clone();
            std::thread::spawn(move || store.add_or_update_conn(&conn, at(1_000), Delta::new(60, 1)))
        };

        entered_rx.recv().unwrap();
        let mut closing = conn.clone();
        closing.tcp_state = "TIME_WAIT".to_string();
        store.add_or_update_conn(&closing, at(1_003), Delta::new(40, 1));
        assert!(store.end_conn(&conn.key(), at(1_003)));

        gate_tx.send(()).unwrap();
        inserter.join().unwrap();

        let got = store.get_conn_by_key(&conn.key()).unwrap();
        assert!(!got.is_active);
        assert_eq!(got.tcp_state, "TIME_WAIT");
        assert_eq!(got.original_bytes, 100);
        assert_eq!(got.stop_time, at(1_003));

        let due = store.take_due(at(1_003));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reason, EndReason::EndOfFlow);
    }

    #[test]
    fn test_update_refreshes_tcp_state() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, _) = store_with(resolver);
        let mut conn = observed(PROTOCOL_TCP, at(1_000));

        conn.tcp_state = "SYN_SENT".to_string();
        store.add_or_update_conn(&conn, at(1_000), Delta::default());
        conn.tcp_state = "ESTABLISHED".to_string();
        store.add_or_update_conn(&conn, at(1_010), Delta::new(60, 1));
        assert_eq!(store.get_conn_by_key(&conn.key()).unwrap().tcp_state, "ESTABLISHED");

        // A late observation does not roll the state back.
        conn.tcp_state = "SYN_SENT".to_string();
        store.add_or_update_conn(&conn, at(1_005), Delta::new(60, 1));
        let got = store.get_conn_by_key(&conn.key()).unwrap();
        assert_eq!(got.tcp_state, "ESTABLISHED");
        assert_eq!(got.original_bytes, 180);
    }

    #[test]
    fn test_concurrent_updates_accumulate_exactly() {
        const THREADS: u64 = 8;
        const UPDATES: u64 = 2_000;

        let resolver = Arc::new(CountingResolver::default());
        let (store, gauge) = store_with(resolver.clone());
        let conn = observed(PROTOCOL_TCP, at(1_000));
        store.add_or_update_conn(&conn, at(1_000), Delta::default());

        std::thread::scope(|scope| {
            for t in 0..THREADS {
                let store = &store;
                let conn = &conn;
                scope.spawn(move || {
                    for i in 0..UPDATES {
                        store.add_or_update_conn(conn, at(1_001 + t + i), Delta::new(3, 1));
                    }
                });
            }
        });

        let got = store.get_conn_by_key(&conn.key()).unwrap();
        assert_eq!(got.original_bytes, 60 + THREADS * UPDATES * 3);
        assert_eq!(got.original_packets, 1 + THREADS * UPDATES);
        assert_eq!(got.stop_time, at(1_000 + THREADS + UPDATES - 1));
        assert_eq!(store.len(), 1);
        assert_eq!(store.queue_len(), 1);
        assert_eq!(gauge.get(), 1.0);
        assert_eq!(resolver.interface_calls.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.service_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_connection_exported_once_and_removed() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, gauge) = store_with(resolver);
        let conn = observed(PROTOCOL_TCP, at(1_000));
        store.add_or_update_conn(&conn, at(1_000), Delta::default());

        assert!(store.take_due(at(1_014)).is_empty());

        let due = store.take_due(at(1_015));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reason, EndReason::IdleTimeout);
        assert!(!due[0].connection.is_active);
        assert_eq!(store.len(), 1);
        assert_eq!(store.queue_len(), 1);

        store.complete_export(&due, true, at(1_015));
        assert_eq!(store.len(), 0);
        assert_eq!(store.queue_len(), 0);
        assert_eq!(gauge.get(), 0.0);
        assert!(store.take_due(at(2_000)).is_empty());
    }

    #[test]
    fn test_active_connection_rearmed_with_baseline() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, _) = store_with(resolver);
        let conn = observed(PROTOCOL_TCP, at(1_000));
        store.add_or_update_conn(&conn, at(1_000), Delta::default());
        for t in (1_010..=1_060).step_by(10) {
            store.add_or_update_conn(&conn, at(t), Delta::new(100, 1));
        }

        let due = store.take_due(at(1_060));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reason, EndReason::ActiveTimeout);
        assert!(due[0].connection.is_active);

        store.complete_export(&due, true, at(1_060));
        let got = store.get_conn_by_key(&conn.key()).unwrap();
        assert_eq!(got.prev_bytes, 660);
        assert_eq!(got.delta_bytes(), 0);
        assert_eq!(got.last_export_time, Some(at(1_060)));

        let item = store.expiry_of(&conn.key()).unwrap();
        assert_eq!(item.active_expire, at(1_120));
        assert_eq!(item.idle_expire, at(1_075));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_failed_export_keeps_connection_for_retry() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, _) = store_with(resolver);
        let conn = observed(PROTOCOL_TCP, at(1_000));
        store.add_or_update_conn(&conn, at(1_000), Delta::default());

        let due = store.take_due(at(1_020));
        assert_eq!(due.len(), 1);
        store.complete_export(&due, false, at(1_020));

        assert_eq!(store.len(), 1);
        assert!(store.take_due(at(1_020)).is_empty());

        let retried = store.take_due(at(1_021));
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].reason, EndReason::IdleTimeout);
        assert_eq!(retried[0].connection.original_bytes, 60);

        store.complete_export(&retried, true, at(1_021));
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_during_idle_export_keeps_connection() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, _) = store_with(resolver);
        let conn = observed(PROTOCOL_TCP, at(1_000));
        store.add_or_update_conn(&conn, at(1_000), Delta::default());

        let due = store.take_due(at(1_015));
        store.add_or_update_conn(&conn, at(1_016), Delta::new(40, 1));
        store.complete_export(&due, true, at(1_016));

        let got = store.get_conn_by_key(&conn.key()).unwrap();
        assert!(got.is_active);
        assert_eq!(got.original_bytes, 100);
        assert_eq!(got.delta_bytes(), 40);
        assert_eq!(store.len(), 1);
        assert_eq!(store.queue_len(), 1);
    }

    #[test]
    fn test_end_conn_is_due_immediately() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, _) = store_with(resolver);
        let conn = observed(PROTOCOL_TCP, at(1_000));
        store.add_or_update_conn(&conn, at(1_000), Delta::default());

        assert!(store.end_conn(&conn.key(), at(1_003)));
        let due = store.take_due(at(1_003));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].reason, EndReason::EndOfFlow);
        assert_eq!(due[0].connection.stop_time, at(1_003));

        store.complete_export(&due, true, at(1_003));
        assert!(store.is_empty());
        assert!(!store.end_conn(&conn.key(), at(1_004)));
    }

    #[test]
    fn test_take_all_forces_export() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, gauge) = store_with(resolver);
        for port in 0..5u16 {
            let mut conn = observed(PROTOCOL_TCP, at(1_000));
            conn.flow_key.source_port = port;
            store.add_or_update_conn(&conn, at(1_000), Delta::default());
        }

        let due = store.take_all(at(1_001));
        assert_eq!(due.len(), 5);
        assert!(due.iter().all(|d| d.reason == EndReason::ForcedEnd));

        store.complete_export(&due, true, at(1_001));
        assert!(store.is_empty());
        assert_eq!(gauge.get(), 0.0);
    }

    #[test]
    fn test_delete_keeps_queue_consistent() {
        let resolver = Arc::new(CountingResolver::default());
        let (store, gauge) = store_with(resolver);
        let a = observed(PROTOCOL_TCP, at(1_000));
        let mut b = a.clone();
        b.flow_key.destination_port = 256;

        store.add_or_update_conn(&a, at(1_000), Delta::default());
        store.add_or_update_conn(&b, at(1_001), Delta::default());
        assert_eq!(gauge.get(), 2.0);

        assert!(store.delete_conn_by_key(&a.key()));
        assert!(!store.delete_conn_by_key(&a.key()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.queue_len(), 1);
        assert_eq!(gauge.get(), 1.0);

        let due = store.take_due(at(1_016));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, b.key());
    }
}
