use super::buffer::TelemetryBuffer;
use super::record::TelemetryRecord;
use crate::shutdown::Shutdown;
use crate::state::now_epoch;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Failed records are re-admitted on this cycle cadence (once a minute at
/// the default 5 s sync interval).
const READMIT_EVERY_CYCLES: u64 = 12;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Ingestion endpoint returned status {0}")]
    Status(u16),
}

/// REST client for the central ingestion endpoint.
pub struct SyncClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    source: String,
}

impl SyncClient {
    pub fn new(base_url: &str, api_key: &str, source: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            source: source.to_string(),
        })
    }

    pub async fn push_batch(&self, records: &[TelemetryRecord]) -> Result<(), SyncError> {
        let payload = json!({
            "records": records,
            "timestamp": now_epoch(),
            "source": self.source,
        });

        let response = self
            .http
            .post(format!("{}/ingest-telemetry", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Drain pending records to the central server in capture-time order,
/// retrying failures and periodically re-admitting exhausted records.
pub async fn run_sync_loop(
    buffer: Arc<TelemetryBuffer>,
    client: SyncClient,
    sync_interval: Duration,
    batch_size: usize,
    mut shutdown: Shutdown,
) {
    info!(
        "Telemetry sync loop started (interval {:.0}s, batch {})",
        sync_interval.as_secs_f64(),
        batch_size
    );
    let mut ticker = tokio::time::interval(sync_interval);
    let mut cycles: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {}
        }

        cycles += 1;
        if cycles % READMIT_EVERY_CYCLES == 0 {
            let readmitted = buffer.readmit_failed();
            if readmitted > 0 {
                info!("Re-admitted {} failed telemetry records", readmitted);
            }
        }
        buffer.evict_expired();

        let batch = buffer.pending(batch_size);
        if batch.is_empty() {
            continue;
        }

        match client.push_batch(&batch).await {
            Ok(()) => {
                let synced = buffer.mark_synced(&batch);
                debug!("Synced {} telemetry records", synced);
            }
            Err(e) => {
                warn!("Telemetry sync failed: {}", e);
                buffer.mark_failed(&batch);
            }
        }
    }

    info!("Telemetry sync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mavlink::StateDelta;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal one-request-per-connection HTTP server. Responds with the
    /// configured status once `fail_for` requests have been served a 503.
    struct StubServer {
        port: u16,
        requests: Arc<AtomicU64>,
    }

    impl StubServer {
        async fn start(fail_for: u64) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let requests = Arc::new(AtomicU64::new(0));
            let counter = Arc::clone(&requests);

            tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        break;
                    };
                    let seen = counter.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let mut buf = Vec::new();
                        let mut chunk = [0u8; 1024];
                        // Read headers, then the content-length body.
                        let body_len = loop {
                            match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                            if let Some(headers_end) =
                                buf.windows(4).position(|w| w == b"\r\n\r\n")
                            {
                                let headers = String::from_utf8_lossy(&buf[..headers_end]);
                                let content_length = headers
                                    .lines()
                                    .find_map(|line| {
                                        let (name, value) = line.split_once(':')?;
                                        name.eq_ignore_ascii_case("content-length")
                                            .then(|| value.trim().parse::<usize>().ok())?
                                    })
                                    .unwrap_or(0);
                                break (headers_end + 4, content_length);
                            }
                        };
                        while buf.len() < body_len.0 + body_len.1 {
                            match socket.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                        }

                        let status = if seen < fail_for {
                            "HTTP/1.1 503 Service Unavailable"
                        } else {
                            "HTTP/1.1 200 OK"
                        };
                        let response =
                            format!("{status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                        let _ = socket.write_all(response.as_bytes()).await;
                    });
                }
            });

            Self { port, requests }
        }

        fn base_url(&self) -> String {
            format!("http://127.0.0.1:{}", self.port)
        }
    }

    fn record(capture_time: f64) -> TelemetryRecord {
        let delta = StateDelta {
            groundspeed: Some(1.0),
            ..Default::default()
        };
        TelemetryRecord::from_delta("drone-1", &delta, capture_time)
    }

    #[tokio::test]
    async fn push_batch_accepts_2xx() {
        let server = StubServer::start(0).await;
        let client = SyncClient::new(&server.base_url(), "key", "drone-1").unwrap();
        client.push_batch(&[record(1.0)]).await.unwrap();
        assert_eq!(server.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn push_batch_surfaces_non_2xx() {
        let server = StubServer::start(u64::MAX).await;
        let client = SyncClient::new(&server.base_url(), "key", "drone-1").unwrap();
        let err = client.push_batch(&[record(1.0)]).await.unwrap_err();
        assert!(matches!(err, SyncError::Status(503)));
    }

    #[tokio::test]
    async fn outage_then_drain_without_duplicates() {
        // First two requests fail, then the endpoint recovers.
        let server = StubServer::start(2).await;
        let client = SyncClient::new(&server.base_url(), "key", "drone-1").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(TelemetryBuffer::new(
            dir.path().join("buffer.json"),
            100,
            3,
            1000,
        ));
        for i in 0..5 {
            buffer.push(record(i as f64));
        }

        let (trigger, shutdown) = crate::shutdown::channel();
        let loop_handle = tokio::spawn(run_sync_loop(
            Arc::clone(&buffer),
            client,
            Duration::from_millis(50),
            50,
            shutdown,
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while buffer.stats().pending_sync > 0 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .unwrap();

        // Two failed cycles, one successful drain, then idle cycles send
        // nothing: every record was transmitted in a successful batch at
        // most once.
        let stats = buffer.stats();
        assert_eq!(stats.pending_sync, 0);
        assert_eq!(stats.failed_sync, 0);
        assert_eq!(stats.sync_failures, 2);
        assert_eq!(server.requests.load(Ordering::SeqCst), 3);

        // No further requests happen once everything is synced.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.requests.load(Ordering::SeqCst), 3);

        trigger.trigger();
        loop_handle.await.unwrap();
    }
}
