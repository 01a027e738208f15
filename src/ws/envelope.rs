use crate::mavlink::{msg_name, Frame};
use crate::metrics::MetricsSnapshot;
use crate::state::now_epoch;
use crate::telemetry::BufferStats;
use serde::{Deserialize, Serialize};

/// Client-to-server envelopes. Every message is a JSON object discriminated
/// by its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    MavlinkCommand { command: CommandDescriptor },
    RequestStats,
    Ping,
}

/// A complete raw MAVLink frame, hex-encoded. The gateway validates it with
/// the codec before forwarding; malformed commands never reach the wire.
#[derive(Debug, Deserialize)]
pub struct CommandDescriptor {
    pub raw: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    ConnectionStatus {
        connected: bool,
        link: String,
        stats: GatewayStats,
    },
    MavlinkMessage {
        message: WsFrame,
    },
    StatsUpdate {
        stats: GatewayStats,
    },
    Pong {
        timestamp: f64,
    },
}

impl ServerEnvelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Parsed frame summary shipped to browser clients.
#[derive(Debug, Serialize)]
pub struct WsFrame {
    pub msg_type: String,
    pub system_id: u8,
    pub component_id: u8,
    pub timestamp: f64,
    pub data: WsFrameData,
    pub raw: String,
}

#[derive(Debug, Serialize)]
pub struct WsFrameData {
    pub msg_id: u32,
    pub seq: u8,
    pub payload_length: usize,
    pub payload: String,
}

impl WsFrame {
    pub fn from_frame(frame: &Frame) -> Self {
        WsFrame {
            msg_type: msg_name(frame.msg_id()),
            system_id: frame.sys_id(),
            component_id: frame.comp_id(),
            timestamp: now_epoch(),
            data: WsFrameData {
                msg_id: frame.msg_id(),
                seq: frame.sequence(),
                payload_length: frame.payload().len(),
                payload: hex::encode(frame.payload()),
            },
            raw: hex::encode(frame.as_bytes()),
        }
    }
}

/// Combined stats snapshot broadcast to WebSocket clients.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub link_state: String,
    pub hub: MetricsSnapshot,
    pub buffer: BufferStats,
    pub timestamp: f64,
}
