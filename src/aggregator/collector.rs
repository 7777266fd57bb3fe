use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::flow::FlowRecord;
use crate::health::{bind_address, HealthMetrics};

use super::queue::RecordQueue;

/// Path flow records are posted to.
pub const INGEST_PATH: &str = "/v1/flows";

/// Largest accepted request body, compressed or not.
const MAX_BODY_BYTES: usize = 64 << 20;

/// Largest accepted body after decompression.
const MAX_DECODED_BYTES: u64 = 512 << 20;

/// Rejected lines reported back to the client per request.
const MAX_REPORTED_ERRORS: usize = 16;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported content encoding {0:?}")]
    UnsupportedEncoding(String),

    #[error("decompressing request body: {0}")]
    Decompress(#[from] std::io::Error),

    #[error("request body exceeds {limit} bytes after decompression")]
    TooLarge { limit: u64 },

    #[error("line {line}: invalid flow record: {source}")]
    InvalidRecord {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of ingesting one request body.
#[derive(Debug, Default, Serialize, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: usize,
    pub rejected: usize,
    /// The first few rejection messages.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Parses an NDJSON body and pushes every valid record.
///
/// Each line is handled on its own: a malformed line is counted and reported
/// without affecting the lines around it. Blank lines are ignored.
pub fn ingest_ndjson(queue: &RecordQueue, body: &[u8]) -> IngestStats {
    let mut stats = IngestStats::default();

    for (idx, line) in body.split(|b| *b == b'\n').enumerate() {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_slice::<FlowRecord>(line) {
            Ok(record) => {
                queue.push(record);
                stats.accepted += 1;
            }
            Err(source) => {
                stats.rejected += 1;
                if stats.errors.len() < MAX_REPORTED_ERRORS {
                    let err = IngestError::InvalidRecord {
                        line: idx + 1,
                        source,
                    };
                    stats.errors.push(err.to_string());
                }
            }
        }
    }

    stats
}

/// Undoes the request's `Content-Encoding`.
pub fn decode_body(body: &[u8], encoding: &str) -> Result<Vec<u8>, IngestError> {
    match encoding.trim() {
        "" | "identity" => Ok(body.to_vec()),
        "gzip" => {
            let mut out = Vec::with_capacity(body.len() * 4);
            flate2::read::GzDecoder::new(body)
                .take(MAX_DECODED_BYTES + 1)
                .read_to_end(&mut out)?;
            if out.len() as u64 > MAX_DECODED_BYTES {
                return Err(IngestError::TooLarge {
                    limit: MAX_DECODED_BYTES,
                });
            }
            Ok(out)
        }
        other => Err(IngestError::UnsupportedEncoding(other.to_string())),
    }
}

struct IngestState {
    queue: Arc<RecordQueue>,
    health: Arc<HealthMetrics>,
}

/// HTTP endpoint receiving flow records from agents.
pub struct Collector {
    addr: String,
    queue: Arc<RecordQueue>,
    health: Arc<HealthMetrics>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl Collector {
    pub fn new(addr: &str, queue: Arc<RecordQueue>, health: Arc<HealthMetrics>) -> Self {
        Self {
            addr: addr.to_string(),
            queue,
            health,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Starts serving and returns the bound address.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);

        let state = Arc::new(IngestState {
            queue: Arc::clone(&self.queue),
            health: Arc::clone(&self.health),
        });

        let app = Router::new()
            .route(INGEST_PATH, post(ingest_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
            .with_state(state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = ctx.child_token();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, path = INGEST_PATH, "flow collector started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "flow collector server error");
            }
        });

        Ok(local_addr)
    }

    /// Stops accepting requests.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// POST /v1/flows - NDJSON flow records, optionally gzip-encoded.
async fn ingest_handler(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let payload = match decode_body(&body, encoding) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting ingest request");
            let status = match &e {
                IngestError::UnsupportedEncoding(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
                IngestError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            };
            return (status, e.to_string()).into_response();
        }
    };

    let stats = ingest_ndjson(&state.queue, &payload);
    state.health.records_ingested.inc_by(stats.accepted as f64);

    if stats.rejected > 0 {
        state.health.ingest_rejected.inc_by(stats.rejected as f64);
        tracing::warn!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            first_error = stats.errors.first().map(String::as_str).unwrap_or_default(),
            "rejected malformed flow records",
        );
    }

    (StatusCode::OK, Json(stats)).into_response()
}
