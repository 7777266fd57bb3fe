use std::io::Write;

use anyhow::{bail, Context, Result};

use crate::config::TransportConfig;
use crate::flow::FlowRecord;

use super::transport::Transport;

/// Posts flow records to the aggregator ingest endpoint as NDJSON.
pub struct HttpTransport {
    cfg: TransportConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(cfg: &TransportConfig) -> Result<Self> {
        if cfg.address.is_empty() {
            bail!("transport address is required");
        }
        // Reject unknown algorithms before the first export.
        compress(&[], &cfg.compression)?;

        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        tracing::info!(
            address = %cfg.address,
            compression = %cfg.compression,
            "HTTP transport configured",
        );

        Ok(Self {
            cfg: cfg.clone(),
            client,
        })
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, records: &[FlowRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let buf = encode_ndjson(records)?;
        let raw_len = buf.len();
        let body = compress(&buf, &self.cfg.compression).context("compressing NDJSON data")?;

        let mut request = self
            .client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = content_encoding(&self.cfg.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .context("sending flow records")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("aggregator responded with unexpected status: {status}");
        }

        tracing::debug!(records = records.len(), bytes = raw_len, "sent flow records");

        Ok(())
    }
}

/// Serializes records as newline-delimited JSON.
pub fn encode_ndjson(records: &[FlowRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(records.len() * 1024);
    for record in records {
        serde_json::to_writer(&mut buf, record).context("serializing flow record")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn compress(data: &[u8], algorithm: &str) -> Result<Vec<u8>> {
    match algorithm {
        "none" | "" => Ok(data.to_vec()),
        "gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).context("gzip write")?;
            encoder.finish().context("gzip finish")
        }
        other => bail!("unsupported compression: {other}"),
    }
}

fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::time::Duration;

    use flate2::read::GzDecoder;

    use super::*;

    fn cfg(address: &str, compression: &str) -> TransportConfig {
        TransportConfig {
            address: address.to_string(),
            compression: compression.to_string(),
            timeout: Duration::from_secs(1),
            headers: Default::default(),
        }
    }

    #[test]
    fn test_ndjson_one_line_per_record() {
        let records = vec![
            FlowRecord {
                source_ip: "10.0.0.1".to_string(),
                ..Default::default()
            },
            FlowRecord {
                source_ip: "10.0.0.2".to_string(),
                ..Default::default()
            },
        ];

        let buf = encode_ndjson(&records).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(text.ends_with('\n'));
        let second: FlowRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.source_ip, "10.0.0.2");
    }

    #[test]
    fn test_gzip_body_decodes() {
        let body = compress(b"{\"a\":1}\n", "gzip").unwrap();
        let mut out = String::new();
        GzDecoder::new(body.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "{\"a\":1}\n");
        assert_eq!(content_encoding("gzip"), Some("gzip"));
        assert_eq!(content_encoding("none"), None);
    }

    #[test]
    fn test_new_rejects_bad_config() {
        assert!(HttpTransport::new(&cfg("", "gzip")).is_err());
        assert!(HttpTransport::new(&cfg("http://127.0.0.1:1/v1/flows", "zstd")).is_err());
        assert!(HttpTransport::new(&cfg("http://127.0.0.1:1/v1/flows", "none")).is_ok());
    }

    #[tokio::test]
    async fn test_send_fails_when_unreachable() {
        // Port 1 on loopback refuses connections.
        let transport = HttpTransport::new(&cfg("http://127.0.0.1:1/v1/flows", "gzip")).unwrap();
        let err = transport
            .send(&[FlowRecord::default()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sending flow records"));

        // An empty batch never touches the network.
        transport.send(&[]).await.unwrap();
    }
}
