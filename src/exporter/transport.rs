use std::future::Future;
use std::sync::Arc;

use anyhow::Result;

use crate::aggregator::queue::RecordQueue;
use crate::flow::FlowRecord;

use super::http::HttpTransport;

/// Transport delivers rendered flow records to the aggregator.
///
/// A returned error means none of the records should be considered
/// delivered; the exporter retries them on a later tick.
pub trait Transport: Send + Sync {
    /// Returns the transport name for logging.
    fn name(&self) -> &str;

    /// Delivers one batch of records.
    fn send(&self, records: &[FlowRecord]) -> impl Future<Output = Result<()>> + Send;
}

/// Hands records straight to an in-process aggregator buffer.
pub struct LocalTransport {
    queue: Arc<RecordQueue>,
}

impl LocalTransport {
    pub fn new(queue: Arc<RecordQueue>) -> Self {
        Self { queue }
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    async fn send(&self, records: &[FlowRecord]) -> Result<()> {
        for record in records {
            self.queue.push(record.clone());
        }
        Ok(())
    }
}

/// AnyTransport picks a transport at runtime from configuration.
///
/// Uses enum dispatch so the exporter stays generic without boxing every
/// send future.
pub enum AnyTransport {
    Http(HttpTransport),
    Local(LocalTransport),
}

impl Transport for AnyTransport {
    fn name(&self) -> &str {
        match self {
            Self::Http(t) => t.name(),
            Self::Local(t) => t.name(),
        }
    }

    async fn send(&self, records: &[FlowRecord]) -> Result<()> {
        match self {
            Self::Http(t) => t.send(records).await,
            Self::Local(t) => t.send(records).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_transport_pushes_in_order() {
        let queue = Arc::new(RecordQueue::new(16));
        let transport = AnyTransport::Local(LocalTransport::new(Arc::clone(&queue)));

        let records: Vec<FlowRecord> = (0..3)
            .map(|i| FlowRecord {
                octet_delta_count: i,
                ..Default::default()
            })
            .collect();
        transport.send(&records).await.unwrap();

        assert_eq!(transport.name(), "local");
        let batch = queue.snapshot();
        let deltas: Vec<u64> = batch.records.iter().map(|r| r.octet_delta_count).collect();
        assert_eq!(deltas, vec![0, 1, 2]);
    }
}
