use crate::backoff::Backoff;
use crate::hub::HubHandle;
use crate::link::{extract_frames, CommandSender, LinkState, ResyncWindow};
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Frame source for the standalone WebSocket bridge: instead of a serial
/// autopilot it attaches the hub to an upstream TCP MAVLink endpoint
/// (typically a tunneled vehicle port) and reconnects with backoff.
pub struct TcpUplink {
    upstream_host: String,
    upstream_port: u16,
    hub: HubHandle,
    metrics: Metrics,
    shutdown: Shutdown,
    state_tx: watch::Sender<LinkState>,
    command_rx: mpsc::Receiver<crate::mavlink::Frame>,
}

impl TcpUplink {
    pub fn new(
        upstream_host: String,
        upstream_port: u16,
        hub: HubHandle,
        metrics: Metrics,
        shutdown: Shutdown,
        command_capacity: usize,
    ) -> (Self, CommandSender) {
        let (tx, command_rx) = mpsc::channel(command_capacity);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

        let uplink = TcpUplink {
            upstream_host,
            upstream_port,
            hub,
            metrics,
            shutdown,
            state_tx,
            command_rx,
        };
        (uplink, CommandSender::from_parts(tx, state_rx))
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::reconnect();
        let addr = format!("{}:{}", self.upstream_host, self.upstream_port);

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            self.set_state(LinkState::Connecting);
            info!("Uplink connecting to {}", addr);

            let stream = tokio::select! {
                _ = self.shutdown.recv() => break,
                result = timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(&addr)) => {
                    match result {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            warn!("Uplink connect to {} failed: {}", addr, e);
                            self.set_state(LinkState::Disconnected);
                            if self.sleep_backoff(&mut backoff).await {
                                break;
                            }
                            continue;
                        }
                        Err(_) => {
                            warn!("Uplink connect to {} timed out", addr);
                            self.set_state(LinkState::Disconnected);
                            if self.sleep_backoff(&mut backoff).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            info!("Uplink connected to {}", addr);
            self.set_state(LinkState::Active);
            backoff.reset();

            let clean = self.io_loop(stream).await;
            if clean {
                break;
            }

            self.set_state(LinkState::Degraded);
            if self.sleep_backoff(&mut backoff).await {
                break;
            }
        }

        self.set_state(LinkState::Closed);
        info!("Uplink closed");
    }

    async fn sleep_backoff(&mut self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = self.shutdown.recv() => true,
            _ = sleep(delay) => false,
        }
    }

    /// Returns `true` on shutdown, `false` on a connection failure that
    /// should be retried.
    async fn io_loop(&mut self, mut stream: TcpStream) -> bool {
        let mut read_buf = BytesMut::with_capacity(4096);
        let mut resyncs = ResyncWindow::new();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.recv() => return true,

                result = stream.read_buf(&mut read_buf) => match result {
                    Ok(0) => {
                        warn!("Uplink closed by remote");
                        return false;
                    }
                    Ok(n) => {
                        debug!("Uplink read {} bytes", n);
                        for frame in extract_frames(&mut read_buf, &self.metrics, &mut resyncs) {
                            self.hub.publish_frame(frame);
                        }
                    }
                    Err(e) => {
                        warn!("Uplink read error: {}", e);
                        return false;
                    }
                },

                command = self.command_rx.recv() => match command {
                    Some(frame) => {
                        if let Err(e) = stream.write_all(frame.as_bytes()).await {
                            warn!("Uplink write error: {}", e);
                            return false;
                        }
                        self.metrics.record_command();
                    }
                    None => return true,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::mavlink::serialize_v2;
    use crate::session::{Session, Transport};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn uplink_feeds_hub_and_writes_commands() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let metrics = Metrics::new();
        let (hub, handle, _telemetry) = Hub::new(metrics.clone(), 16);
        tokio::spawn(hub.run());

        let session = Session::new(handle.allocate_session_id(), Transport::Tcp, "t".into(), 64);
        handle.register(Arc::clone(&session));

        let (trigger, shutdown) = crate::shutdown::channel();
        let (uplink, commands) = TcpUplink::new(
            "127.0.0.1".to_string(),
            port,
            handle,
            metrics,
            shutdown,
            8,
        );
        tokio::spawn(uplink.run());

        let (mut upstream, _) = listener.accept().await.unwrap();

        // Upstream frame reaches an attached session via the hub.
        let heartbeat = serialize_v2(0, 7, 1, 0, &[0u8; 9]).unwrap();
        upstream.write_all(heartbeat.as_bytes()).await.unwrap();
        let routed = tokio::time::timeout(Duration::from_secs(1), session.queue.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.as_bytes(), heartbeat.as_bytes());

        // A command goes out on the upstream socket once Active.
        let mut state_rx = commands.state_receiver();
        tokio::time::timeout(Duration::from_secs(1), async {
            while *state_rx.borrow_and_update() != LinkState::Active {
                state_rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        let command = serialize_v2(1, 255, 190, 0, &[0u8; 9]).unwrap();
        commands.send(command.clone()).await.unwrap();

        let mut echo = vec![0u8; command.len()];
        tokio::time::timeout(Duration::from_secs(1), upstream.read_exact(&mut echo))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echo[..], command.as_bytes());

        trigger.trigger();
    }
}
