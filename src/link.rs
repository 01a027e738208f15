use crate::backoff::Backoff;
use crate::hub::HubHandle;
use crate::mavlink::frame::HEARTBEAT_MSG_ID;
use crate::mavlink::{gcs_heartbeat, Frame, ParseOutcome};
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, Instant};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
/// Serial reads poll at this window so shutdown stays responsive.
pub const READ_POLL: Duration = Duration::from_millis(100);
const GCS_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
/// Resyncs within one second before the stream is called noisy.
const RESYNC_WARN_THRESHOLD: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    WaitingHeartbeat,
    Active,
    Degraded,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::WaitingHeartbeat => "waiting_heartbeat",
            LinkState::Active => "active",
            LinkState::Degraded => "degraded",
            LinkState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("No heartbeat from autopilot within {0:?}")]
    NoHeartbeat(Duration),

    #[error("Link not ready for outbound frames")]
    NotReady,

    #[error("Link closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Clonable submission side of the link's command queue.
///
/// Submissions are accepted only while the link is `Active`; per-sender
/// ordering is the channel's FIFO ordering.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Frame>,
    state_rx: watch::Receiver<LinkState>,
}

impl CommandSender {
    pub(crate) fn from_parts(
        tx: mpsc::Sender<Frame>,
        state_rx: watch::Receiver<LinkState>,
    ) -> Self {
        Self { tx, state_rx }
    }

    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        if *self.state_rx.borrow() != LinkState::Active {
            return Err(LinkError::NotReady);
        }
        self.tx.send(frame).await.map_err(|_| LinkError::Closed)
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }
}

/// Owns the serial connection to the flight controller: reads frames into
/// the hub, drains the command queue onto the wire, reconnects with backoff.
pub struct AutopilotLink {
    device: String,
    baud_rate: u32,
    hub: HubHandle,
    metrics: Metrics,
    shutdown: Shutdown,
    state_tx: watch::Sender<LinkState>,
    command_rx: mpsc::Receiver<Frame>,
}

impl AutopilotLink {
    pub fn new(
        device: String,
        baud_rate: u32,
        hub: HubHandle,
        metrics: Metrics,
        shutdown: Shutdown,
        command_capacity: usize,
    ) -> (Self, CommandSender) {
        let (tx, command_rx) = mpsc::channel(command_capacity);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);

        let link = AutopilotLink {
            device,
            baud_rate,
            hub,
            metrics,
            shutdown,
            state_tx,
            command_rx,
        };
        (link, CommandSender { tx, state_rx })
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    pub async fn run(mut self) {
        let mut backoff = Backoff::reconnect();

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            self.set_state(LinkState::Connecting);
            info!("Autopilot link opening {} @ {}", self.device, self.baud_rate);

            let mut port = match tokio_serial::new(&self.device, self.baud_rate)
                .timeout(CONNECT_TIMEOUT)
                .open_native_async()
            {
                Ok(port) => port,
                Err(e) => {
                    warn!("Autopilot link failed to open {}: {}", self.device, e);
                    self.set_state(LinkState::Disconnected);
                    if self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(LinkState::WaitingHeartbeat);
            let mut read_buf = BytesMut::with_capacity(4096);

            match self.wait_heartbeat(&mut port, &mut read_buf).await {
                Ok((system_id, component_id)) => {
                    info!(
                        "Autopilot heartbeat observed: system {} component {}",
                        system_id, component_id
                    );
                    self.hub.publish_identity(system_id, component_id);
                }
                Err(LinkError::Closed) => break,
                Err(e) => {
                    warn!("Autopilot handshake failed: {}", e);
                    self.set_state(LinkState::Disconnected);
                    if self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            }

            self.set_state(LinkState::Active);
            backoff.reset();

            match self.io_loop(&mut port, &mut read_buf).await {
                LoopExit::Shutdown => break,
                LoopExit::Failed(e) => {
                    error!("Autopilot link error: {}", e);
                    self.set_state(LinkState::Degraded);
                    if self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                }
            }
        }

        self.set_state(LinkState::Closed);
        info!("Autopilot link closed");
    }

    /// Returns `true` when shutdown fired during the wait.
    async fn sleep_backoff(&mut self, backoff: &mut Backoff) -> bool {
        let delay = backoff.next_delay();
        debug!("Autopilot link retrying in {:.1}s", delay.as_secs_f64());
        tokio::select! {
            _ = self.shutdown.recv() => true,
            _ = sleep(delay) => false,
        }
    }

    /// Read frames until one with msg_id 0 arrives; all frames observed
    /// during the wait are already forwarded to the hub.
    async fn wait_heartbeat<R>(
        &mut self,
        port: &mut R,
        read_buf: &mut BytesMut,
    ) -> Result<(u8, u8), LinkError>
    where
        R: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + HEARTBEAT_TIMEOUT;
        let mut resyncs = ResyncWindow::new();

        loop {
            if self.shutdown.is_triggered() {
                return Err(LinkError::Closed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LinkError::NoHeartbeat(HEARTBEAT_TIMEOUT));
            }

            let window = READ_POLL.min(deadline - now);
            match timeout(window, port.read_buf(read_buf)).await {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    return Err(LinkError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "serial EOF",
                    )))
                }
                Ok(Ok(_)) => {
                    for frame in extract_frames(read_buf, &self.metrics, &mut resyncs) {
                        let identity = (frame.sys_id(), frame.comp_id());
                        let is_heartbeat = frame.msg_id() == HEARTBEAT_MSG_ID;
                        self.hub.publish_frame(frame);
                        if is_heartbeat {
                            return Ok(identity);
                        }
                    }
                }
                Ok(Err(e)) => return Err(LinkError::Io(e)),
            }
        }
    }

    async fn io_loop(
        &mut self,
        port: &mut tokio_serial::SerialStream,
        read_buf: &mut BytesMut,
    ) -> LoopExit {
        let mut heartbeat_timer = interval(GCS_HEARTBEAT_PERIOD);
        let mut heartbeat_seq = 0u8;
        let mut resyncs = ResyncWindow::new();
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.recv() => return LoopExit::Shutdown,

                result = timeout(READ_POLL, port.read_buf(read_buf)) => match result {
                    // Poll window elapsed; loop so shutdown stays live.
                    Err(_) => {}
                    Ok(Ok(0)) => {
                        return LoopExit::Failed(LinkError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "serial EOF",
                        )));
                    }
                    Ok(Ok(_)) => {
                        for frame in extract_frames(read_buf, &self.metrics, &mut resyncs) {
                            self.hub.publish_frame(frame);
                        }
                    }
                    Ok(Err(e)) => return LoopExit::Failed(LinkError::Io(e)),
                },

                command = self.command_rx.recv() => match command {
                    Some(frame) => {
                        if let Err(e) = port.write_all(frame.as_bytes()).await {
                            return LoopExit::Failed(LinkError::Io(e));
                        }
                        self.metrics.record_command();
                        debug!("Autopilot link wrote command msgid={}", frame.msg_id());
                    }
                    None => return LoopExit::Shutdown,
                },

                _ = heartbeat_timer.tick() => {
                    let heartbeat = gcs_heartbeat(heartbeat_seq);
                    heartbeat_seq = heartbeat_seq.wrapping_add(1);
                    if let Err(e) = port.write_all(heartbeat.as_bytes()).await {
                        return LoopExit::Failed(LinkError::Io(e));
                    }
                }
            }
        }
    }
}

enum LoopExit {
    Shutdown,
    Failed(LinkError),
}

/// Sliding one-second window over parser resyncs; sustained noise on a
/// shared serial line is worth a warning, single glitches are not.
pub(crate) struct ResyncWindow {
    window_start: Instant,
    count: u32,
}

impl ResyncWindow {
    pub(crate) fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn note(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.window_start) > Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        if self.count == RESYNC_WARN_THRESHOLD {
            warn!(
                "Sustained parser resyncs ({} in the last second)",
                self.count
            );
        }
    }
}

/// Drain every complete frame out of `buf`, advancing past garbage.
pub(crate) fn extract_frames(
    buf: &mut BytesMut,
    metrics: &Metrics,
    resyncs: &mut ResyncWindow,
) -> Vec<Frame> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        match Frame::parse(&buf[..]) {
            (ParseOutcome::Frame(frame), consumed) => {
                buf.advance(consumed);
                frames.push(frame);
            }
            (ParseOutcome::Resync, consumed) => {
                buf.advance(consumed);
                metrics.record_resync();
                resyncs.note();
            }
            (ParseOutcome::NeedMore, _) => break,
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mavlink::serialize_v2;

    fn heartbeat_from(sys: u8, comp: u8, seq: u8) -> Frame {
        let payload = [0u8; 9];
        serialize_v2(seq, sys, comp, 0, &payload).unwrap()
    }

    #[test]
    fn extract_frames_across_chunks_and_garbage() {
        let metrics = Metrics::new();
        let mut resyncs = ResyncWindow::new();
        let mut buf = BytesMut::new();

        let f1 = heartbeat_from(1, 1, 0);
        let f2 = heartbeat_from(1, 1, 1);

        buf.extend_from_slice(&[0x13, 0x37]);
        buf.extend_from_slice(f1.as_bytes());
        // Split the second frame over two fills.
        buf.extend_from_slice(&f2.as_bytes()[..5]);

        let frames = extract_frames(&mut buf, &metrics, &mut resyncs);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), f1.as_bytes());
        assert_eq!(metrics.snapshot().resyncs, 1);

        buf.extend_from_slice(&f2.as_bytes()[5..]);
        let frames = extract_frames(&mut buf, &metrics, &mut resyncs);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), f2.as_bytes());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn command_sender_rejects_when_not_active() {
        let (tx, _rx) = mpsc::channel(4);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let sender = CommandSender { tx, state_rx };

        let err = sender.send(heartbeat_from(255, 190, 0)).await.unwrap_err();
        assert!(matches!(err, LinkError::NotReady));

        state_tx.send_replace(LinkState::Active);
        sender.send(heartbeat_from(255, 190, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_heartbeat_times_out_quietly() {
        // An idle reader: no bytes ever arrive.
        let (hub, handle, _telemetry) = crate::hub::Hub::new(Metrics::new(), 4);
        tokio::spawn(hub.run());
        let (_trigger, shutdown) = crate::shutdown::channel();
        let (mut link, _commands) = AutopilotLink::new(
            "/dev/null".to_string(),
            115_200,
            handle,
            Metrics::new(),
            shutdown,
            4,
        );

        let (_client, server) = tokio::io::duplex(64);
        let mut server = server;
        let mut read_buf = BytesMut::new();

        tokio::time::pause();
        let result = link.wait_heartbeat(&mut server, &mut read_buf).await;
        assert!(matches!(result, Err(LinkError::NoHeartbeat(_))));
    }

    #[tokio::test]
    async fn wait_heartbeat_returns_identity() {
        let (hub, handle, _telemetry) = crate::hub::Hub::new(Metrics::new(), 4);
        tokio::spawn(hub.run());
        let (_trigger, shutdown) = crate::shutdown::channel();
        let (mut link, _commands) = AutopilotLink::new(
            "/dev/null".to_string(),
            115_200,
            handle,
            Metrics::new(),
            shutdown,
            4,
        );

        let (client, mut server) = tokio::io::duplex(256);
        let mut client = client;
        let writer = tokio::spawn(async move {
            // Some attitude traffic first, then the heartbeat.
            let attitude = serialize_v2(0, 7, 42, 30, &[0u8; 28]).unwrap();
            client.write_all(attitude.as_bytes()).await.unwrap();
            client
                .write_all(heartbeat_from(7, 42, 1).as_bytes())
                .await
                .unwrap();
            client
        });

        let mut read_buf = BytesMut::new();
        let (sys, comp) = link.wait_heartbeat(&mut server, &mut read_buf).await.unwrap();
        assert_eq!((sys, comp), (7, 42));
        drop(writer.await.unwrap());
    }
}
