pub mod decode;
pub mod frame;

pub use decode::{decode, msg_name, StateDelta};
pub use frame::{
    crc_extra, gcs_heartbeat, serialize_v2, Frame, FrameError, MavVersion, ParseOutcome,
};
