use super::record::TelemetryRecord;
use crate::backoff::Backoff;
use crate::shutdown::Shutdown;
use crate::state::now_epoch;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const DRONES_TOPIC: &str = "realtime:drones";
const SYSTEM_TOPIC: &str = "realtime:system";

fn join_envelope(reference: u64) -> String {
    json!({
        "topic": DRONES_TOPIC,
        "event": "phx_join",
        "payload": {},
        "ref": reference.to_string(),
    })
    .to_string()
}

fn telemetry_envelope(record: &TelemetryRecord, reference: u64) -> String {
    json!({
        "topic": DRONES_TOPIC,
        "event": "telemetry",
        "payload": record,
        "ref": reference.to_string(),
    })
    .to_string()
}

/// Reply expected for an incoming server message, if any.
fn reply_for(text: &str, reference: u64) -> Option<String> {
    let message: Value = serde_json::from_str(text).ok()?;
    let event = message.get("event").and_then(Value::as_str)?;

    match event {
        "system" => {
            let kind = message
                .get("payload")
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str);
            if kind == Some("ping") {
                Some(
                    json!({
                        "topic": SYSTEM_TOPIC,
                        "event": "pong",
                        "payload": { "timestamp": now_epoch() },
                        "ref": reference.to_string(),
                    })
                    .to_string(),
                )
            } else {
                None
            }
        }
        "postgres_changes" => {
            debug!("Realtime database change notification received");
            None
        }
        _ => None,
    }
}

/// Fire-and-forget realtime side channel to the central server.
///
/// Joins the drones topic after each (re)connect and pushes freshly ingested
/// records as realtime events. Failures only ever cost realtime delivery;
/// the REST sync loop owns durability.
pub async fn run_realtime_client(
    url: String,
    mut events: mpsc::Receiver<TelemetryRecord>,
    mut shutdown: Shutdown,
) {
    let mut backoff = Backoff::reconnect();
    let mut reference: u64 = 0;

    'reconnect: loop {
        if shutdown.is_triggered() {
            break;
        }

        let mut ws = tokio::select! {
            _ = shutdown.recv() => break,
            result = connect_async(&url) => match result {
                Ok((ws, _response)) => ws,
                Err(e) => {
                    warn!("Realtime connect to {} failed: {}", url, e);
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            }
        };

        info!("Realtime channel connected to {}", url);
        backoff.reset();

        reference += 1;
        if ws.send(Message::text(join_envelope(reference))).await.is_err() {
            continue;
        }
        debug!("Joined realtime channel {}", DRONES_TOPIC);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = ws.close(None).await;
                    break 'reconnect;
                }

                record = events.recv() => match record {
                    Some(record) => {
                        reference += 1;
                        if let Err(e) = ws.send(Message::text(telemetry_envelope(&record, reference))).await {
                            debug!("Realtime send failed: {}", e);
                            break;
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        break 'reconnect;
                    }
                },

                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        reference += 1;
                        if let Some(reply) = reply_for(text.as_str(), reference) {
                            if ws.send(Message::text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Realtime channel closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Realtime channel error: {}", e);
                        break;
                    }
                },
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!("Realtime channel stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mavlink::StateDelta;

    #[test]
    fn join_envelope_shape() {
        let envelope: Value = serde_json::from_str(&join_envelope(1)).unwrap();
        assert_eq!(envelope["topic"], "realtime:drones");
        assert_eq!(envelope["event"], "phx_join");
        assert_eq!(envelope["ref"], "1");
    }

    #[test]
    fn system_ping_gets_pong() {
        let ping = json!({
            "topic": "realtime:system",
            "event": "system",
            "payload": { "type": "ping" },
        })
        .to_string();

        let reply: Value = serde_json::from_str(&reply_for(&ping, 7).unwrap()).unwrap();
        assert_eq!(reply["event"], "pong");
        assert_eq!(reply["topic"], "realtime:system");
        assert!(reply["payload"]["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn other_events_get_no_reply() {
        let change = json!({
            "event": "postgres_changes",
            "payload": { "table": "missions_extended" },
        })
        .to_string();
        assert!(reply_for(&change, 1).is_none());
        assert!(reply_for("not json", 1).is_none());
    }

    #[test]
    fn telemetry_envelope_carries_record() {
        let delta = StateDelta {
            altitude: Some(10.0),
            ..Default::default()
        };
        let record = TelemetryRecord::from_delta("drone-1", &delta, 5.0);
        let envelope: Value = serde_json::from_str(&telemetry_envelope(&record, 3)).unwrap();
        assert_eq!(envelope["event"], "telemetry");
        assert_eq!(envelope["payload"]["vehicle_id"], "drone-1");
        assert_eq!(envelope["payload"]["payload"]["altitude"], 10.0);
    }
}
