use crate::shutdown::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COPY_BUF_SIZE: usize = 4096;

/// Relay counters, shared between connection tasks and the stats logger.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub clean_closes: AtomicU64,
    pub bytes_client_to_upstream: AtomicU64,
    pub bytes_upstream_to_client: AtomicU64,
    pub errors: AtomicU64,
}

impl ProxyStats {
    fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// Plain TCP byte relay fronting a remote MAVLink port reachable through an
/// outbound tunnel. No parsing: MAVLink frame boundaries survive TCP as-is.
pub struct TunnelProxy {
    listener: TcpListener,
    upstream_host: String,
    upstream_port: u16,
    stats: Arc<ProxyStats>,
    shutdown: Shutdown,
}

impl TunnelProxy {
    pub async fn bind(
        bind_addr: &str,
        listen_port: u16,
        upstream_host: String,
        upstream_port: u16,
        shutdown: Shutdown,
    ) -> anyhow::Result<Self> {
        let addr = format!("{bind_addr}:{listen_port}");
        let listener = TcpListener::bind(&addr).await?;
        info!("Tunnel proxy listening on {}", addr);
        info!(
            "Tunnel proxy forwarding to {}:{}",
            upstream_host, upstream_port
        );
        Ok(Self {
            listener,
            upstream_host,
            upstream_port,
            stats: Arc::new(ProxyStats::default()),
            shutdown,
        })
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    pub fn local_port(&self) -> anyhow::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,

                result = self.listener.accept() => match result {
                    Ok((client, addr)) => {
                        info!("Tunnel proxy client connected from {}", addr);
                        let upstream = format!("{}:{}", self.upstream_host, self.upstream_port);
                        let stats = Arc::clone(&self.stats);
                        tokio::spawn(async move {
                            relay_connection(client, upstream, stats).await;
                            info!("Tunnel proxy client {} finished", addr);
                        });
                    }
                    Err(e) => {
                        error!("Tunnel proxy accept error: {}", e);
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                },
            }
        }
        info!("Tunnel proxy stopped");
    }
}

async fn relay_connection(client: TcpStream, upstream_addr: String, stats: Arc<ProxyStats>) {
    stats.connection_opened();

    let upstream = match timeout(
        UPSTREAM_CONNECT_TIMEOUT,
        TcpStream::connect(&upstream_addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Tunnel proxy upstream connect failed: {}", e);
            stats.errors.fetch_add(1, Ordering::Relaxed);
            stats.connection_closed();
            return;
        }
        Err(_) => {
            warn!("Tunnel proxy upstream connect to {} timed out", upstream_addr);
            stats.errors.fetch_add(1, Ordering::Relaxed);
            stats.connection_closed();
            return;
        }
    };
    debug!("Tunnel proxy connected to upstream {}", upstream_addr);

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    // One copy task per direction. EOF on one side propagates as a write
    // shutdown on the other, so half-close keeps the reverse path alive.
    let forward = tokio::spawn(copy_direction(
        client_read,
        upstream_write,
        Arc::clone(&stats),
        Direction::ClientToUpstream,
    ));
    let backward = tokio::spawn(copy_direction(
        upstream_read,
        client_write,
        Arc::clone(&stats),
        Direction::UpstreamToClient,
    ));

    let forward_clean = matches!(forward.await, Ok(true));
    let backward_clean = matches!(backward.await, Ok(true));

    if forward_clean && backward_clean {
        stats.clean_closes.fetch_add(1, Ordering::Relaxed);
    }
    stats.connection_closed();
}

#[derive(Clone, Copy)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client->upstream",
            Direction::UpstreamToClient => "upstream->client",
        }
    }
}

/// Copy until EOF, then shut down the write side. Returns `true` on a clean
/// EOF, `false` on an I/O error.
async fn copy_direction(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    stats: Arc<ProxyStats>,
    direction: Direction,
) -> bool {
    let mut buf = [0u8; COPY_BUF_SIZE];

    let clean = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break true,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!("Tunnel proxy {} write error: {}", direction.label(), e);
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    break false;
                }
                let counter = match direction {
                    Direction::ClientToUpstream => &stats.bytes_client_to_upstream,
                    Direction::UpstreamToClient => &stats.bytes_upstream_to_client,
                };
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("Tunnel proxy {} read error: {}", direction.label(), e);
                stats.errors.fetch_add(1, Ordering::Relaxed);
                break false;
            }
        }
    };

    let _ = writer.shutdown().await;
    clean
}
