use super::frame::Frame;
use crate::state::flight_mode_name;

const RAD_TO_DEG: f64 = 57.29577951308232;

/// Partial VehicleState update decoded from a single frame.
///
/// Only the fields present in the source message are set; everything else
/// stays `None` so the projection never clears state it did not receive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub armed: Option<bool>,
    pub flight_mode: Option<String>,

    pub battery_voltage: Option<f64>,
    pub battery_current: Option<f64>,
    pub battery_remaining: Option<f64>,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub gps_altitude: Option<f64>,
    pub fix_type: Option<u8>,
    pub satellites: Option<u8>,

    pub roll: Option<f64>,
    pub pitch: Option<f64>,
    pub yaw: Option<f64>,

    pub airspeed: Option<f64>,
    pub groundspeed: Option<f64>,
    pub altitude: Option<f64>,
    pub climb_rate: Option<f64>,
    pub throttle: Option<u16>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        *self == StateDelta::default()
    }
}

/// Decode a frame into a state delta via the static projection table.
/// Unknown message ids return `None` and are forwarded untouched.
pub fn decode(frame: &Frame) -> Option<StateDelta> {
    match frame.msg_id() {
        0 => Some(decode_heartbeat(frame.payload())),
        1 => Some(decode_sys_status(frame.payload())),
        24 => Some(decode_gps_raw_int(frame.payload())),
        30 => Some(decode_attitude(frame.payload())),
        74 => Some(decode_vfr_hud(frame.payload())),
        147 => Some(decode_battery_status(frame.payload())),
        _ => None,
    }
}

/// Human-readable message name for the set we decode; `MSG_<id>` otherwise.
pub fn msg_name(msg_id: u32) -> String {
    match msg_id {
        0 => "HEARTBEAT".to_string(),
        1 => "SYS_STATUS".to_string(),
        24 => "GPS_RAW_INT".to_string(),
        30 => "ATTITUDE".to_string(),
        74 => "VFR_HUD".to_string(),
        147 => "BATTERY_STATUS".to_string(),
        id => format!("MSG_{id}"),
    }
}

// MAVLink v2 truncates trailing zero payload bytes; zero-extend before
// extracting fields at fixed wire offsets.
fn padded<const N: usize>(payload: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    let n = payload.len().min(N);
    buf[..n].copy_from_slice(&payload[..n]);
    buf
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn i16_at(buf: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn i32_at(buf: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn f32_at(buf: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

// HEARTBEAT: custom_mode u32, type, autopilot, base_mode, system_status, mavlink_version
fn decode_heartbeat(payload: &[u8]) -> StateDelta {
    let p = padded::<9>(payload);
    let custom_mode = u32_at(&p, 0);
    let base_mode = p[6];

    StateDelta {
        armed: Some(base_mode & 0x80 != 0), // MAV_MODE_FLAG_SAFETY_ARMED
        flight_mode: Some(flight_mode_name(custom_mode).to_string()),
        ..Default::default()
    }
}

// SYS_STATUS: voltage_battery u16 @14 (mV), current_battery i16 @16 (cA),
// battery_remaining i8 @30 (%, -1 = not provided)
fn decode_sys_status(payload: &[u8]) -> StateDelta {
    let p = padded::<31>(payload);
    let voltage = u16_at(&p, 14);
    let current = i16_at(&p, 16);
    let remaining = p[30] as i8;

    StateDelta {
        battery_voltage: Some(f64::from(voltage) / 1000.0),
        battery_current: Some(f64::from(current) / 100.0),
        battery_remaining: (remaining >= 0).then(|| f64::from(remaining)),
        ..Default::default()
    }
}

// GPS_RAW_INT: lat i32 @8 (1e-7 deg), lon i32 @12, alt i32 @16 (mm),
// fix_type u8 @28, satellites_visible u8 @29
fn decode_gps_raw_int(payload: &[u8]) -> StateDelta {
    let p = padded::<30>(payload);

    StateDelta {
        latitude: Some(f64::from(i32_at(&p, 8)) / 1e7),
        longitude: Some(f64::from(i32_at(&p, 12)) / 1e7),
        gps_altitude: Some(f64::from(i32_at(&p, 16)) / 1000.0),
        fix_type: Some(p[28]),
        satellites: Some(p[29]),
        ..Default::default()
    }
}

// ATTITUDE: roll f32 @4, pitch f32 @8, yaw f32 @12 (radians)
fn decode_attitude(payload: &[u8]) -> StateDelta {
    let p = padded::<28>(payload);
    let yaw_deg = f64::from(f32_at(&p, 12)) * RAD_TO_DEG;

    StateDelta {
        roll: Some(f64::from(f32_at(&p, 4)) * RAD_TO_DEG),
        pitch: Some(f64::from(f32_at(&p, 8)) * RAD_TO_DEG),
        yaw: Some(yaw_deg.rem_euclid(360.0)),
        ..Default::default()
    }
}

// VFR_HUD: airspeed f32 @0, groundspeed f32 @4, alt f32 @8, climb f32 @12,
// heading i16 @16, throttle u16 @18
fn decode_vfr_hud(payload: &[u8]) -> StateDelta {
    let p = padded::<20>(payload);

    StateDelta {
        airspeed: Some(f64::from(f32_at(&p, 0))),
        groundspeed: Some(f64::from(f32_at(&p, 4))),
        altitude: Some(f64::from(f32_at(&p, 8))),
        climb_rate: Some(f64::from(f32_at(&p, 12))),
        throttle: Some(u16_at(&p, 18)),
        ..Default::default()
    }
}

// BATTERY_STATUS: voltages u16[10] @10 (mV per cell, 65535 = cell unused),
// current_battery i16 @30 (cA, -1 = not provided)
fn decode_battery_status(payload: &[u8]) -> StateDelta {
    let p = padded::<36>(payload);

    let mut pack_mv = 0u32;
    let mut any_cell = false;
    for cell in 0..10 {
        let mv = u16_at(&p, 10 + cell * 2);
        if mv != u16::MAX {
            pack_mv += u32::from(mv);
            any_cell = true;
        }
    }
    let current = i16_at(&p, 30);

    StateDelta {
        battery_voltage: any_cell.then(|| f64::from(pack_mv) / 1000.0),
        battery_current: (current >= 0).then(|| f64::from(current) / 100.0),
        ..Default::default()
    }
}
