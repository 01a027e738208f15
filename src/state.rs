use crate::mavlink::StateDelta;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the epoch as a double, the single on-wire
/// timestamp representation.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// ArduPilot copter flight mode names by custom_mode.
pub fn flight_mode_name(custom_mode: u32) -> &'static str {
    match custom_mode {
        0 => "STABILIZE",
        1 => "ACRO",
        2 => "ALT_HOLD",
        3 => "AUTO",
        4 => "GUIDED",
        5 => "LOITER",
        6 => "RTL",
        7 => "CIRCLE",
        9 => "LAND",
        11 => "DRIFT",
        13 => "SPORT",
        14 => "FLIP",
        15 => "AUTOTUNE",
        16 => "POSHOLD",
        17 => "BRAKE",
        18 => "THROW",
        19 => "AVOID_ADSB",
        20 => "GUIDED_NOGPS",
        21 => "SMART_RTL",
        22 => "FLOWHOLD",
        23 => "FOLLOW",
        24 => "ZIGZAG",
        25 => "SYSTEMID",
        26 => "AUTOROTATE",
        _ => "UNKNOWN",
    }
}

/// Epoch timestamps (seconds, f64) of the last update per field group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStamps {
    pub heartbeat: Option<f64>,
    pub battery: Option<f64>,
    pub gps: Option<f64>,
    pub attitude: Option<f64>,
    pub speed: Option<f64>,
}

/// Accumulated projection of the decoded message set.
///
/// `None` means "never received"; a zero value means the autopilot reported
/// zero. Fields are only ever overwritten by a delta that carries them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VehicleState {
    pub system_id: Option<u8>,
    pub component_id: Option<u8>,

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

    pub updated: GroupStamps,
}

impl VehicleState {
    pub fn record_identity(&mut self, system_id: u8, component_id: u8) {
        self.system_id = Some(system_id);
        self.component_id = Some(component_id);
    }

    /// Fold a delta into the state, stamping each touched field group.
    pub fn apply(&mut self, delta: &StateDelta, now: f64) {
        let mut heartbeat = false;
        let mut battery = false;
        let mut gps = false;
        let mut attitude = false;
        let mut speed = false;

        macro_rules! merge {
            ($field:ident, $group:ident) => {
                if let Some(v) = &delta.$field {
                    self.$field = Some(v.clone());
                    $group = true;
                }
            };
        }

        merge!(armed, heartbeat);
        merge!(flight_mode, heartbeat);
        merge!(battery_voltage, battery);
        merge!(battery_current, battery);
        merge!(battery_remaining, battery);
        merge!(latitude, gps);
        merge!(longitude, gps);
        merge!(gps_altitude, gps);
        merge!(fix_type, gps);
        merge!(satellites, gps);
        merge!(roll, attitude);
        merge!(pitch, attitude);
        merge!(yaw, attitude);
        merge!(airspeed, speed);
        merge!(groundspeed, speed);
        merge!(altitude, speed);
        merge!(climb_rate, speed);
        merge!(throttle, speed);

        if heartbeat {
            self.updated.heartbeat = Some(now);
        }
        if battery {
            self.updated.battery = Some(now);
        }
        if gps {
            self.updated.gps = Some(now);
        }
        if attitude {
            self.updated.attitude = Some(now);
        }
        if speed {
            self.updated.speed = Some(now);
        }
    }
}
