use crate::mavlink::StateDelta;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Keys whose `null` is normalized to 0 before transmission. Downstream
/// safety logic treats these as always-present numerics.
pub const SAFETY_ZERO_KEYS: &[&str] = &["battery_level", "altitude", "speed"];

/// One buffered telemetry sample.
///
/// Immutable after construction except for `synced` and `retry_count`;
/// `capture_time` never changes on retry so the `(vehicle_id, capture_time,
/// nonce)` key stays stable for server-side deduplication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    pub vehicle_id: String,
    pub capture_time: f64,
    pub nonce: u32,
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub synced: bool,
}

impl TelemetryRecord {
    pub fn from_delta(vehicle_id: &str, delta: &StateDelta, capture_time: f64) -> Self {
        let mut payload = Map::new();

        if let Some(armed) = delta.armed {
            payload.insert("armed".to_string(), Value::Bool(armed));
        }
        if let Some(mode) = &delta.flight_mode {
            payload.insert("mode".to_string(), Value::String(mode.clone()));
        }
        insert_number(&mut payload, "battery_voltage", delta.battery_voltage);
        insert_number(&mut payload, "battery_current", delta.battery_current);
        insert_number(&mut payload, "battery_remaining", delta.battery_remaining);
        insert_number(&mut payload, "gps_lat", delta.latitude);
        insert_number(&mut payload, "gps_lon", delta.longitude);
        insert_number(&mut payload, "gps_alt", delta.gps_altitude);
        if let Some(fix) = delta.fix_type {
            payload.insert("gps_fix_type".to_string(), Value::from(fix));
        }
        if let Some(sats) = delta.satellites {
            payload.insert("gps_satellites".to_string(), Value::from(sats));
        }
        insert_number(&mut payload, "roll", delta.roll);
        insert_number(&mut payload, "pitch", delta.pitch);
        insert_number(&mut payload, "yaw", delta.yaw);
        insert_number(&mut payload, "airspeed", delta.airspeed);
        insert_number(&mut payload, "groundspeed", delta.groundspeed);
        insert_number(&mut payload, "altitude", delta.altitude);
        insert_number(&mut payload, "climb_rate", delta.climb_rate);
        if let Some(throttle) = delta.throttle {
            payload.insert("throttle".to_string(), Value::from(throttle));
        }

        TelemetryRecord {
            vehicle_id: vehicle_id.to_string(),
            capture_time,
            nonce: rand::random(),
            payload: sanitize(payload),
            retry_count: 0,
            synced: false,
        }
    }

    /// Identity match on the idempotency key.
    pub fn same_key(&self, other: &TelemetryRecord) -> bool {
        self.vehicle_id == other.vehicle_id
            && self.capture_time.to_bits() == other.capture_time.to_bits()
            && self.nonce == other.nonce
    }
}

fn insert_number(payload: &mut Map<String, Value>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        if let Some(n) = Number::from_f64(v) {
            payload.insert(key.to_string(), Value::Number(n));
        }
    }
}

pub fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Sanitize a payload map for transmission: floats rounded to 6 decimals,
/// `null` in the safety set replaced with 0.
pub fn sanitize(payload: Map<String, Value>) -> Map<String, Value> {
    payload
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Null if SAFETY_ZERO_KEYS.contains(&key.as_str()) => Value::from(0),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if !n.is_i64() && !n.is_u64() => Number::from_f64(round6(f))
                        .map(Value::Number)
                        .unwrap_or(Value::Number(n)),
                    _ => Value::Number(n),
                },
                other => other,
            };
            (key, value)
        })
        .collect()
}

/// Aggregate counters for the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferStats {
    pub total_records: u64,
    pub pending_sync: u64,
    pub failed_sync: u64,
    pub buffer_size_bytes: u64,
    pub last_sync_time: f64,
    pub sync_failures: u64,
}
