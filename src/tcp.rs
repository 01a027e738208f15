use crate::config::TcpConfig;
use crate::hub::HubHandle;
use crate::link::{extract_frames, CommandSender, LinkError, ResyncWindow};
use crate::metrics::Metrics;
use crate::session::{Session, Transport};
use crate::shutdown::Shutdown;
use bytes::BytesMut;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// How long a session writer may keep flushing during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// MAVLink-over-TCP server for Mission-Planner-style clients. Every accepted
/// socket becomes a hub session with its own reader and writer.
pub struct TcpServer {
    listener: TcpListener,
    config: TcpConfig,
    hub: HubHandle,
    commands: CommandSender,
    metrics: Metrics,
    shutdown: Shutdown,
    active: Arc<AtomicUsize>,
}

impl TcpServer {
    pub async fn bind(
        config: TcpConfig,
        hub: HubHandle,
        commands: CommandSender,
        metrics: Metrics,
        shutdown: Shutdown,
    ) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", config.bind_addr, config.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        info!("TCP server listening on {}", addr);
        Ok(Self {
            listener,
            config,
            hub,
            commands,
            metrics,
            shutdown,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,

                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => self.handle_accept(stream, addr.to_string()),
                    Err(e) => error!("TCP accept error: {}", e),
                },
            }
        }
        info!("TCP server stopped accepting");
    }

    fn handle_accept(&self, stream: TcpStream, addr: String) {
        if self.active.load(Ordering::Acquire) >= self.config.max_clients {
            self.metrics.session_rejected();
            warn!(
                "TCP connection from {} refused: {} clients already attached",
                addr, self.config.max_clients
            );
            // RST instead of FIN so the client sees the refusal immediately.
            let _ = stream.set_linger(Some(Duration::ZERO));
            drop(stream);
            return;
        }

        let session = Session::new(
            self.hub.allocate_session_id(),
            Transport::Tcp,
            addr,
            self.config.session_queue,
        );
        info!("New TCP session {}", session);

        self.active.fetch_add(1, Ordering::AcqRel);
        let active = Arc::clone(&self.active);
        let hub = self.hub.clone();
        let commands = self.commands.clone();
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        let drop_threshold = self.config.drop_threshold;

        hub.register(Arc::clone(&session));
        tokio::spawn(async move {
            if let Err(e) = run_session(
                stream,
                Arc::clone(&session),
                commands,
                metrics,
                shutdown,
                drop_threshold,
            )
            .await
            {
                debug!("TCP session {} error: {}", session, e);
            }
            hub.unregister(session.id);
            active.fetch_sub(1, Ordering::AcqRel);
            info!("TCP session {} closed", session);
        });
    }
}

async fn run_session(
    stream: TcpStream,
    session: Arc<Session>,
    commands: CommandSender,
    metrics: Metrics,
    mut shutdown: Shutdown,
    drop_threshold: u64,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut resyncs = ResyncWindow::new();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                drain_writer(&session, &mut writer).await;
                return Ok(());
            }

            result = reader.read_buf(&mut read_buf) => match result {
                Ok(0) => {
                    debug!("TCP session {} EOF", session);
                    return Ok(());
                }
                Ok(n) => {
                    debug!("TCP session {} read {} bytes", session, n);
                    for frame in extract_frames(&mut read_buf, &metrics, &mut resyncs) {
                        session.record_frame_in(frame.len());
                        match commands.send(frame).await {
                            Ok(()) => {}
                            Err(LinkError::NotReady) => {
                                // Commands are fire-and-forget; an offline
                                // autopilot just swallows them.
                                debug!("TCP session {}: command dropped, link not ready", session);
                            }
                            Err(_) => return Ok(()),
                        }
                    }
                }
                Err(e) => return Err(e),
            },

            frame = session.queue.pop() => match frame {
                Some(frame) => {
                    writer.write_all(frame.as_bytes()).await?;
                    session.record_frame_out(frame.len());
                    if session.queue.dropped() > drop_threshold {
                        warn!(
                            "TCP session {} dropped {} frames, closing",
                            session,
                            session.queue.dropped()
                        );
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
        }
    }
}

/// Best-effort flush of whatever is still queued, bounded by the shutdown
/// drain window.
async fn drain_writer(session: &Session, writer: &mut OwnedWriteHalf) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Some(frame) = session.queue.try_pop() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match timeout(deadline - now, writer.write_all(frame.as_bytes())).await {
            Ok(Ok(())) => session.record_frame_out(frame.len()),
            _ => break,
        }
    }
    let _ = writer.shutdown().await;
}
