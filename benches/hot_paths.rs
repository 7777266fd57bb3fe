use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flowkeeper::aggregator::RecordQueue;
use flowkeeper::connections::{ConnectionStore, Delta, FlowTimeouts};
use flowkeeper::datapath::event::{EventKind, FlowEvent, RuleRef};
use flowkeeper::datapath::parse::{encode_event, parse_event};
use flowkeeper::exporter::http::encode_ndjson;
use flowkeeper::flow::tuple::PROTOCOL_TCP;
use flowkeeper::flow::{Connection, EndReason, FlowRecord, FlowType, RuleAction, Tuple};
use flowkeeper::metadata::StaticRegistry;
use prometheus::Gauge;
use uuid::Uuid;

fn tuple(i: u32) -> Tuple {
    Tuple::new(
        IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + i)),
        IpAddr::V4(Ipv4Addr::new(10, 96, 0, 10)),
        PROTOCOL_TCP,
        40_000 + (i % 20_000) as u16,
        443,
    )
}

fn event(kind: EventKind) -> FlowEvent {
    FlowEvent {
        kind,
        tuple: tuple(7),
        timestamp: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        flow_type: FlowType::InterNode,
        tcp_state: "ESTABLISHED",
        bytes: 1_500,
        packets: 3,
        reverse_bytes: 64_000,
        reverse_packets: 48,
        service: Some((IpAddr::V4(Ipv4Addr::new(10, 96, 0, 1)), 443)),
        ingress_rule: Some(RuleRef {
            uuid: Uuid::from_u128(1),
            action: RuleAction::Allow,
        }),
        egress_rule: None,
    }
}

fn record(i: u64) -> FlowRecord {
    FlowRecord {
        flow_start_seconds: 1_700_000_000,
        flow_end_seconds: 1_700_000_060,
        flow_end_reason: EndReason::ActiveTimeout as u8,
        source_ip: "10.0.0.7".into(),
        destination_ip: "10.96.0.10".into(),
        source_transport_port: 40_000,
        destination_transport_port: 443,
        protocol_identifier: PROTOCOL_TCP,
        octet_total_count: i * 1_500,
        packet_total_count: i,
        source_pod_name: "client-7d9f".into(),
        source_pod_namespace: "default".into(),
        tcp_state: "ESTABLISHED".into(),
        ..Default::default()
    }
}

fn bench_parse_event(c: &mut Criterion) {
    let conntrack = encode_event(&event(EventKind::ConntrackUpdate));
    let deny = encode_event(&event(EventKind::Deny));

    c.bench_function("parse_event/conntrack_update", |b| {
        b.iter(|| parse_event(black_box(&conntrack)).expect("parse conntrack"))
    });

    c.bench_function("parse_event/deny", |b| {
        b.iter(|| parse_event(black_box(&deny)).expect("parse deny"))
    });
}

fn bench_connection_store(c: &mut Criterion) {
    let registry = Arc::new(StaticRegistry::new());
    let store = ConnectionStore::new(
        "bench",
        FlowTimeouts {
            active: Duration::from_secs(60),
            inactive: Duration::from_secs(15),
            retry: Duration::from_secs(1),
        },
        registry.clone(),
        registry,
        Gauge::new("bench_connections", "bench").expect("gauge"),
    );
    let start = UNIX_EPOCH + Duration::from_secs(1_700_000_000);

    let conns: Vec<Connection> = (0..4_096)
        .map(|i| Connection::new(tuple(i), start))
        .collect();
    for conn in &conns {
        store.add_or_update_conn(conn, start, Delta::new(100, 1));
    }

    let mut i = 0usize;
    c.bench_function("connection_store/update_existing", |b| {
        b.iter(|| {
            let conn = &conns[i % conns.len()];
            i += 1;
            store.add_or_update_conn(
                black_box(conn),
                start + Duration::from_millis(i as u64),
                Delta::new(1_500, 1),
            );
        })
    });

    c.bench_function("connection_store/take_due_none", |b| {
        b.iter(|| black_box(store.take_due(black_box(start)).len()))
    });
}

fn bench_record_queue(c: &mut Criterion) {
    let queue = RecordQueue::new(65_536);
    let mut n = 0u64;

    c.bench_function("record_queue/push_evicting", |b| {
        b.iter(|| {
            n += 1;
            queue.push(black_box(record(n)));
        })
    });

    c.bench_function("record_queue/snapshot_full", |b| {
        b.iter(|| black_box(queue.snapshot().len()))
    });
}

fn bench_encode_ndjson(c: &mut Criterion) {
    let records: Vec<FlowRecord> = (0..512).map(record).collect();

    c.bench_function("exporter/encode_ndjson_512", |b| {
        b.iter(|| black_box(encode_ndjson(black_box(&records)).expect("encode").len()))
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_event(c);
    bench_connection_store(c);
    bench_record_queue(c);
    bench_encode_ndjson(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
