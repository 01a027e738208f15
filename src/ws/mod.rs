pub mod envelope;

use crate::hub::HubHandle;
use crate::link::{CommandSender, LinkError, LinkState};
use crate::metrics::Metrics;
use crate::session::{Session, Transport};
use crate::shutdown::Shutdown;
use crate::state::now_epoch;
use crate::telemetry::TelemetryBuffer;
use envelope::{ClientEnvelope, GatewayStats, ServerEnvelope, WsFrame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// WebSocket gateway for browser mission planners: JSON envelopes in, parsed
/// frame summaries and stats out, commands bridged onto the autopilot link.
pub struct WsGateway {
    listener: TcpListener,
    hub: HubHandle,
    commands: CommandSender,
    store: Option<Arc<TelemetryBuffer>>,
    metrics: Metrics,
    shutdown: Shutdown,
    session_queue: usize,
}

impl WsGateway {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        bind_addr: &str,
        listen_port: u16,
        hub: HubHandle,
        commands: CommandSender,
        store: Option<Arc<TelemetryBuffer>>,
        metrics: Metrics,
        shutdown: Shutdown,
        session_queue: usize,
    ) -> anyhow::Result<Self> {
        let addr = format!("{bind_addr}:{listen_port}");
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket gateway listening on {}", addr);
        Ok(Self {
            listener,
            hub,
            commands,
            store,
            metrics,
            shutdown,
            session_queue,
        })
    }

    pub fn local_port(&self) -> anyhow::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => break,

                result = self.listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let session = Session::new(
                            self.hub.allocate_session_id(),
                            Transport::WebSocket,
                            addr.to_string(),
                            self.session_queue,
                        );
                        let hub = self.hub.clone();
                        let commands = self.commands.clone();
                        let store = self.store.clone();
                        let metrics = self.metrics.clone();
                        let shutdown = self.shutdown.clone();

                        tokio::spawn(async move {
                            match timeout(
                                HANDSHAKE_TIMEOUT,
                                tokio_tungstenite::accept_async(stream),
                            )
                            .await
                            {
                                Ok(Ok(ws)) => {
                                    info!("New WebSocket session {}", session);
                                    hub.register(Arc::clone(&session));
                                    run_session(ws, &session, &commands, &store, &metrics, shutdown)
                                        .await;
                                    hub.unregister(session.id);
                                    info!("WebSocket session {} closed", session);
                                }
                                Ok(Err(e)) => {
                                    warn!("WebSocket handshake from {} failed: {}", session.remote_addr, e)
                                }
                                Err(_) => {
                                    warn!("WebSocket handshake from {} timed out", session.remote_addr)
                                }
                            }
                        });
                    }
                    Err(e) => error!("WebSocket accept error: {}", e),
                },
            }
        }
        info!("WebSocket gateway stopped accepting");
    }
}

fn gateway_stats(
    link: LinkState,
    metrics: &Metrics,
    store: &Option<Arc<TelemetryBuffer>>,
) -> GatewayStats {
    GatewayStats {
        link_state: link.to_string(),
        hub: metrics.snapshot(),
        buffer: store.as_ref().map(|s| s.stats()).unwrap_or_default(),
        timestamp: now_epoch(),
    }
}

async fn run_session(
    ws: WebSocketStream<TcpStream>,
    session: &Arc<Session>,
    commands: &CommandSender,
    store: &Option<Arc<TelemetryBuffer>>,
    metrics: &Metrics,
    mut shutdown: Shutdown,
) {
    let (mut sink, mut source) = ws.split();

    // First message on every session: the current link state and stats.
    let status = ServerEnvelope::ConnectionStatus {
        connected: commands.state() == LinkState::Active,
        link: commands.state().to_string(),
        stats: gateway_stats(commands.state(), metrics, store),
    };
    if sink.send(Message::text(status.to_json())).await.is_err() {
        return;
    }

    let mut ping_timer = interval(PING_INTERVAL);
    let mut stats_timer = interval(STATS_INTERVAL);
    // Both intervals fire immediately once; the status above covers that.
    ping_timer.tick().await;
    stats_timer.tick().await;

    let mut pong_deadline: Option<Instant> = None;
    let far_future = || Instant::now() + Duration::from_secs(86_400);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            _ = sleep_until(pong_deadline.unwrap_or_else(far_future)), if pong_deadline.is_some() => {
                warn!("WebSocket session {} ping timeout", session);
                break;
            }

            frame = session.queue.pop() => match frame {
                Some(frame) => {
                    let envelope = ServerEnvelope::MavlinkMessage {
                        message: WsFrame::from_frame(&frame),
                    };
                    if sink.send(Message::text(envelope.to_json())).await.is_err() {
                        break;
                    }
                    session.record_frame_out(frame.len());
                }
                None => break,
            },

            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    session.touch();
                    if !handle_client_text(text.as_str(), session, commands, store, metrics, &mut sink).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    pong_deadline = None;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket session {} error: {}", session, e);
                    break;
                }
            },

            _ = ping_timer.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                pong_deadline = Some(Instant::now() + PING_TIMEOUT);
            }

            _ = stats_timer.tick() => {
                let envelope = ServerEnvelope::StatsUpdate {
                    stats: gateway_stats(commands.state(), metrics, store),
                };
                if sink.send(Message::text(envelope.to_json())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Returns `false` when the session should be torn down.
async fn handle_client_text(
    text: &str,
    session: &Arc<Session>,
    commands: &CommandSender,
    store: &Option<Arc<TelemetryBuffer>>,
    metrics: &Metrics,
    sink: &mut WsSink,
) -> bool {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("WebSocket session {}: invalid envelope: {}", session, e);
            return true;
        }
    };

    match envelope {
        ClientEnvelope::MavlinkCommand { command } => {
            let Some(frame) = parse_command(&command.raw) else {
                warn!("WebSocket session {}: malformed mavlink_command", session);
                return true;
            };
            session.record_frame_in(frame.len());
            match commands.send(frame).await {
                Ok(()) => {}
                Err(LinkError::NotReady) => {
                    debug!("WebSocket session {}: command dropped, link not ready", session);
                }
                Err(_) => return false,
            }
            true
        }
        ClientEnvelope::RequestStats => {
            let envelope = ServerEnvelope::StatsUpdate {
                stats: gateway_stats(commands.state(), metrics, store),
            };
            sink.send(Message::text(envelope.to_json())).await.is_ok()
        }
        ClientEnvelope::Ping => {
            let envelope = ServerEnvelope::Pong {
                timestamp: now_epoch(),
            };
            sink.send(Message::text(envelope.to_json())).await.is_ok()
        }
    }
}

/// Decode and re-validate a hex command descriptor into a single frame.
fn parse_command(raw: &str) -> Option<crate::mavlink::Frame> {
    let bytes = hex::decode(raw.trim()).ok()?;
    match crate::mavlink::Frame::parse(&bytes) {
        (crate::mavlink::ParseOutcome::Frame(frame), consumed) if consumed == bytes.len() => {
            Some(frame)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::mavlink::{serialize_v2, Frame};
    use serde_json::{json, Value};
    use tokio::sync::{mpsc, watch};

    async fn next_json(
        ws: &mut WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn start_gateway() -> (
        u16,
        HubHandle,
        mpsc::Receiver<Frame>,
        crate::shutdown::ShutdownTrigger,
    ) {
        let metrics = Metrics::new();
        let (hub, handle, _telemetry) = Hub::new(metrics.clone(), 16);
        tokio::spawn(hub.run());

        let (tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(LinkState::Active);
        std::mem::forget(state_tx);
        let commands = CommandSender::from_parts(tx, state_rx);

        let (trigger, shutdown) = crate::shutdown::channel();
        let gateway = WsGateway::bind(
            "127.0.0.1",
            0,
            handle.clone(),
            commands,
            None,
            metrics,
            shutdown,
            64,
        )
        .await
        .unwrap();
        let port = gateway.local_port().unwrap();
        tokio::spawn(gateway.run());

        (port, handle, command_rx, trigger)
    }

    #[tokio::test]
    async fn session_flow_status_ping_frames_commands() {
        let (port, handle, mut command_rx, _trigger) = start_gateway().await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();

        // connection_status arrives first.
        let status = next_json(&mut ws).await;
        assert_eq!(status["type"], "connection_status");
        assert_eq!(status["connected"], true);
        assert_eq!(status["link"], "active");
        assert!(status["stats"]["hub"]["frames_received"].is_number());

        // Application-level ping.
        ws.send(Message::text(json!({"type": "ping"}).to_string()))
            .await
            .unwrap();
        let pong = next_json(&mut ws).await;
        assert_eq!(pong["type"], "pong");

        // request_stats.
        ws.send(Message::text(json!({"type": "request_stats"}).to_string()))
            .await
            .unwrap();
        let stats = next_json(&mut ws).await;
        assert_eq!(stats["type"], "stats_update");

        // Inbound frame fan-out as mavlink_message with exact raw bytes.
        let heartbeat = serialize_v2(4, 1, 1, 0, &[0u8; 9]).unwrap();
        handle.publish_frame(heartbeat.clone());
        let message = next_json(&mut ws).await;
        assert_eq!(message["type"], "mavlink_message");
        assert_eq!(message["message"]["msg_type"], "HEARTBEAT");
        assert_eq!(message["message"]["data"]["msg_id"], 0);
        let raw = message["message"]["raw"].as_str().unwrap();
        assert_eq!(hex::decode(raw).unwrap(), heartbeat.as_bytes());

        // Command descriptor goes to the autopilot command queue.
        let command = serialize_v2(7, 255, 190, 0, &[0u8; 9]).unwrap();
        ws.send(Message::text(
            json!({
                "type": "mavlink_command",
                "command": { "raw": hex::encode(command.as_bytes()) },
            })
            .to_string(),
        ))
        .await
        .unwrap();
        let forwarded = timeout(Duration::from_secs(1), command_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.as_bytes(), command.as_bytes());
    }

    #[tokio::test]
    async fn malformed_commands_are_dropped() {
        let (port, _handle, mut command_rx, _trigger) = start_gateway().await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        let _status = next_json(&mut ws).await;

        ws.send(Message::text(
            json!({"type": "mavlink_command", "command": {"raw": "zz-not-hex"}}).to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::text(
            json!({"type": "mavlink_command", "command": {"raw": "fd00"}}).to_string(),
        ))
        .await
        .unwrap();

        // Neither reaches the command queue; the session stays healthy.
        assert!(
            timeout(Duration::from_millis(300), command_rx.recv())
                .await
                .is_err()
        );
        ws.send(Message::text(json!({"type": "ping"}).to_string()))
            .await
            .unwrap();
        let pong = next_json(&mut ws).await;
        assert_eq!(pong["type"], "pong");
    }

    #[test]
    fn parse_command_requires_exact_frame() {
        let frame = crate::mavlink::gcs_heartbeat(0);
        let good = hex::encode(frame.as_bytes());
        assert!(parse_command(&good).is_some());

        // Trailing junk is rejected.
        let mut padded = frame.as_bytes().to_vec();
        padded.push(0x00);
        assert!(parse_command(&hex::encode(padded)).is_none());
        assert!(parse_command("not hex").is_none());
        assert!(parse_command("").is_none());
    }
}
