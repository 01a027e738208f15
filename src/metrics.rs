use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::time::interval;
use tracing::{info, warn};

/// Shared counters for the bridge fabric.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Frames read from the autopilot link
    frames_received: AtomicU64,
    /// Frame deliveries into session queues
    frames_routed: AtomicU64,
    /// Deliveries lost to full session queues
    frames_dropped: AtomicU64,
    /// Raw bytes fanned out to sessions
    bytes_routed: AtomicU64,
    /// Commands forwarded toward the autopilot
    commands_sent: AtomicU64,
    /// Parser resynchronizations on the inbound stream
    resyncs: AtomicU64,
    /// Autopilot heartbeats observed
    heartbeats: AtomicU64,
    /// Epoch seconds of the last autopilot heartbeat
    last_heartbeat: AtomicU64,
    /// Sessions accepted over the lifetime of the process
    sessions_total: AtomicU64,
    /// Currently attached sessions
    sessions_active: AtomicU64,
    /// Connections refused at the max_clients bound
    sessions_rejected: AtomicU64,
    start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                frames_received: AtomicU64::new(0),
                frames_routed: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                bytes_routed: AtomicU64::new(0),
                commands_sent: AtomicU64::new(0),
                resyncs: AtomicU64::new(0),
                heartbeats: AtomicU64::new(0),
                last_heartbeat: AtomicU64::new(0),
                sessions_total: AtomicU64::new(0),
                sessions_active: AtomicU64::new(0),
                sessions_rejected: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_received(&self) {
        self.inner.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_routed(&self, bytes: usize) {
        self.inner.frames_routed.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_routed
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_command(&self) {
        self.inner.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.inner.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.inner.heartbeats.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.inner.last_heartbeat.store(now, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.inner.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        let _ = self
            .inner
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn session_rejected(&self) {
        self.inner.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_heartbeat = self.inner.last_heartbeat.load(Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        MetricsSnapshot {
            frames_received: self.inner.frames_received.load(Ordering::Relaxed),
            frames_routed: self.inner.frames_routed.load(Ordering::Relaxed),
            frames_dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
            bytes_routed: self.inner.bytes_routed.load(Ordering::Relaxed),
            commands_sent: self.inner.commands_sent.load(Ordering::Relaxed),
            resyncs: self.inner.resyncs.load(Ordering::Relaxed),
            heartbeats: self.inner.heartbeats.load(Ordering::Relaxed),
            last_heartbeat_age_secs: if last_heartbeat == 0 {
                None
            } else {
                Some(now.saturating_sub(last_heartbeat))
            },
            sessions_total: self.inner.sessions_total.load(Ordering::Relaxed),
            sessions_active: self.inner.sessions_active.load(Ordering::Relaxed),
            sessions_rejected: self.inner.sessions_rejected.load(Ordering::Relaxed),
            uptime_secs: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Start a background task that logs stats periodically
    pub fn start_stats_logger(self, interval_secs: u64) {
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(interval_secs));
            let mut last = self.snapshot();

            loop {
                interval.tick().await;
                let current = self.snapshot();
                let delta = current.delta(&last, interval_secs);

                info!("=== Bridge Stats ===");
                info!(
                    "  Uptime: {}h {}m {}s",
                    current.uptime_secs / 3600,
                    (current.uptime_secs % 3600) / 60,
                    current.uptime_secs % 60
                );
                info!(
                    "  Frames: {} received, {} routed, {} dropped, {} commands",
                    current.frames_received,
                    current.frames_routed,
                    current.frames_dropped,
                    current.commands_sent
                );
                info!(
                    "  Sessions: {} active, {} total, {} rejected",
                    current.sessions_active, current.sessions_total, current.sessions_rejected
                );
                info!(
                    "  Throughput: {:.1} msg/s, {:.1} KB/s",
                    delta.frames_per_sec, delta.kbytes_per_sec
                );

                if current.frames_dropped > last.frames_dropped {
                    warn!(
                        "  {} frames dropped in last {}s (BACKPRESSURE DETECTED)",
                        current.frames_dropped - last.frames_dropped,
                        interval_secs
                    );
                }

                last = current;
            }
        });
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub frames_routed: u64,
    pub frames_dropped: u64,
    pub bytes_routed: u64,
    pub commands_sent: u64,
    pub resyncs: u64,
    pub heartbeats: u64,
    pub last_heartbeat_age_secs: Option<u64>,
    pub sessions_total: u64,
    pub sessions_active: u64,
    pub sessions_rejected: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    pub fn delta(&self, previous: &MetricsSnapshot, interval_secs: u64) -> MetricsDelta {
        let frames_diff = self.frames_routed.saturating_sub(previous.frames_routed);
        let bytes_diff = self.bytes_routed.saturating_sub(previous.bytes_routed);

        MetricsDelta {
            frames_per_sec: frames_diff as f64 / interval_secs as f64,
            kbytes_per_sec: (bytes_diff as f64 / 1024.0) / interval_secs as f64,
        }
    }
}

#[derive(Debug)]
pub struct MetricsDelta {
    pub frames_per_sec: f64,
    pub kbytes_per_sec: f64,
}
