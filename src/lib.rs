//! flowkeeper: connection tracking, flow record export and batched
//! ClickHouse ingestion for network flow telemetry.

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod connections;
pub mod datapath;
pub mod exporter;
pub mod flow;
pub mod health;
pub mod metadata;
pub mod migrate;
