use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

const MAVLINK_STX_V1: u8 = 0xFE;
const MAVLINK_STX_V2: u8 = 0xFD;
const MAVLINK_V1_HEADER_LEN: usize = 6;
const MAVLINK_V2_HEADER_LEN: usize = 10;
const MAVLINK_CHECKSUM_LEN: usize = 2;
const MAVLINK_SIGNATURE_LEN: usize = 13;
const MAVLINK_IFLAG_SIGNED: u8 = 0x01;

pub const HEARTBEAT_MSG_ID: u32 = 0;

/// GCS identity used for frames we originate ourselves.
pub const GCS_SYSTEM_ID: u8 = 255;
pub const GCS_COMPONENT_ID: u8 = 190;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Invalid magic byte: expected 0xFE or 0xFD, got {0:#x}")]
    BadMagic(u8),

    #[error("Short header: need {need} bytes, have {have}")]
    ShortHeader { need: usize, have: usize },

    #[error("Short payload: need {need} bytes, have {have}")]
    ShortPayload { need: usize, have: usize },

    #[error("Invalid CRC: expected {expected:#06x}, got {got:#06x}")]
    BadChecksum { expected: u16, got: u16 },

    #[error("Truncated packet")]
    Truncated,

    #[error("No CRC_EXTRA known for message id {0}")]
    UnknownMsgId(u32),

    #[error("Payload too long: {0} bytes (max 255)")]
    PayloadTooLong(usize),
}

/// MAVLink protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MavVersion {
    V1,
    V2,
}

/// Result of feeding a byte buffer to the parser.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A complete, checksum-valid frame. `consumed` covers the whole packet.
    Frame(Frame),
    /// Not enough bytes yet; `consumed` is 0.
    NeedMore,
    /// `consumed` leading bytes are garbage (or a spurious start byte) and
    /// must be discarded before trying again.
    Resync,
}

/// A reference-counted MAVLink frame (v1 or v2).
///
/// Holds the complete raw packet so it can be retransmitted byte-exact;
/// clones share the underlying buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Complete packet: STX, header, payload, CRC, optional signature.
    data: Bytes,
    version: MavVersion,
    payload_offset: usize,
    payload_len: usize,
    signature_len: usize,
}

impl Frame {
    /// Parse one frame from the start of `buf`.
    ///
    /// Scans to the first start byte; leading garbage yields `Resync` with
    /// the garbage length as `consumed`. A checksum mismatch also yields
    /// `Resync`, consuming a single byte: the presumed start byte was
    /// spurious and the real frame may begin inside the failed range.
    pub fn parse(buf: &[u8]) -> (ParseOutcome, usize) {
        if buf.is_empty() {
            return (ParseOutcome::NeedMore, 0);
        }

        match buf
            .iter()
            .position(|&b| b == MAVLINK_STX_V1 || b == MAVLINK_STX_V2)
        {
            Some(0) => {}
            Some(offset) => return (ParseOutcome::Resync, offset),
            None => return (ParseOutcome::Resync, buf.len()),
        }

        let result = match buf[0] {
            MAVLINK_STX_V1 => Self::parse_v1(buf),
            _ => Self::parse_v2(buf),
        };

        match result {
            Ok((frame, consumed)) => (ParseOutcome::Frame(frame), consumed),
            Err(FrameError::ShortHeader { .. }) | Err(FrameError::ShortPayload { .. }) => {
                (ParseOutcome::NeedMore, 0)
            }
            // Bad checksum or anything else: skip the start byte only.
            Err(_) => (ParseOutcome::Resync, 1),
        }
    }

    fn parse_v1(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        // MAVLink v1: STX(1) + LEN(1) + SEQ(1) + SYSID(1) + COMPID(1) + MSGID(1) + PAYLOAD + CRC(2)
        if buf.len() < MAVLINK_V1_HEADER_LEN {
            return Err(FrameError::ShortHeader {
                need: MAVLINK_V1_HEADER_LEN,
                have: buf.len(),
            });
        }

        let payload_len = buf[1] as usize;
        let total_len = MAVLINK_V1_HEADER_LEN + payload_len + MAVLINK_CHECKSUM_LEN;

        if buf.len() < total_len {
            return Err(FrameError::ShortPayload {
                need: total_len,
                have: buf.len(),
            });
        }

        let msg_id = buf[5] as u32;
        verify_checksum(buf, total_len - MAVLINK_CHECKSUM_LEN, msg_id)?;

        let frame = Frame {
            data: Bytes::copy_from_slice(&buf[..total_len]),
            version: MavVersion::V1,
            payload_offset: MAVLINK_V1_HEADER_LEN,
            payload_len,
            signature_len: 0,
        };

        Ok((frame, total_len))
    }

    fn parse_v2(buf: &[u8]) -> Result<(Self, usize), FrameError> {
        // MAVLink v2: STX(1) + LEN(1) + INCOMPAT(1) + COMPAT(1) + SEQ(1) + SYSID(1)
        //           + COMPID(1) + MSGID(3) + PAYLOAD + CRC(2) + [SIG(13)]
        if buf.len() < MAVLINK_V2_HEADER_LEN {
            return Err(FrameError::ShortHeader {
                need: MAVLINK_V2_HEADER_LEN,
                have: buf.len(),
            });
        }

        let payload_len = buf[1] as usize;
        let incompat_flags = buf[2];

        let signed = (incompat_flags & MAVLINK_IFLAG_SIGNED) != 0;
        let signature_len = if signed { MAVLINK_SIGNATURE_LEN } else { 0 };
        let total_len = MAVLINK_V2_HEADER_LEN + payload_len + MAVLINK_CHECKSUM_LEN + signature_len;

        if buf.len() < total_len {
            return Err(FrameError::ShortPayload {
                need: total_len,
                have: buf.len(),
            });
        }

        let msg_id = u32::from_le_bytes([buf[7], buf[8], buf[9], 0]);
        let crc_offset = MAVLINK_V2_HEADER_LEN + payload_len;
        verify_checksum(buf, crc_offset, msg_id)?;

        let frame = Frame {
            data: Bytes::copy_from_slice(&buf[..total_len]),
            version: MavVersion::V2,
            payload_offset: MAVLINK_V2_HEADER_LEN,
            payload_len,
            signature_len,
        };

        Ok((frame, total_len))
    }

    #[inline]
    pub fn version(&self) -> MavVersion {
        self.version
    }

    #[inline]
    pub fn sys_id(&self) -> u8 {
        match self.version {
            MavVersion::V1 => self.data[3],
            MavVersion::V2 => self.data[5],
        }
    }

    #[inline]
    pub fn comp_id(&self) -> u8 {
        match self.version {
            MavVersion::V1 => self.data[4],
            MavVersion::V2 => self.data[6],
        }
    }

    #[inline]
    pub fn msg_id(&self) -> u32 {
        match self.version {
            MavVersion::V1 => self.data[5] as u32,
            MavVersion::V2 => u32::from_le_bytes([self.data[7], self.data[8], self.data[9], 0]),
        }
    }

    #[inline]
    pub fn sequence(&self) -> u8 {
        match self.version {
            MavVersion::V1 => self.data[2],
            MavVersion::V2 => self.data[4],
        }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..self.payload_offset + self.payload_len]
    }

    /// The 13-byte v2 signature block, if the incompat signed bit is set.
    /// Pass-through only; signatures are never validated here.
    #[inline]
    pub fn signature(&self) -> Option<&[u8]> {
        if self.signature_len == 0 {
            None
        } else {
            Some(&self.data[self.data.len() - self.signature_len..])
        }
    }

    #[inline]
    pub fn is_signed(&self) -> bool {
        self.signature_len != 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn raw(&self) -> Bytes {
        self.data.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-message CRC_EXTRA seeds for the message set we decode.
/// Frames with other ids are forwarded without checksum verification.
pub fn crc_extra(msg_id: u32) -> Option<u8> {
    match msg_id {
        0 => Some(50),    // HEARTBEAT
        1 => Some(124),   // SYS_STATUS
        24 => Some(24),   // GPS_RAW_INT
        30 => Some(39),   // ATTITUDE
        74 => Some(20),   // VFR_HUD
        147 => Some(154), // BATTERY_STATUS
        _ => None,
    }
}

fn verify_checksum(buf: &[u8], crc_offset: usize, msg_id: u32) -> Result<(), FrameError> {
    let Some(extra) = crc_extra(msg_id) else {
        return Ok(());
    };

    let mut crc = Crc16::new();
    crc.update(&buf[1..crc_offset]);
    crc.update(&[extra]);
    let expected = crc.finish();

    let got = u16::from_le_bytes([buf[crc_offset], buf[crc_offset + 1]]);
    if expected != got {
        return Err(FrameError::BadChecksum { expected, got });
    }
    Ok(())
}

/// Serialize a v2 packet (`incompat = compat = 0`) from raw fields.
/// The message id must have a known CRC_EXTRA.
pub fn serialize_v2(
    seq: u8,
    sys_id: u8,
    comp_id: u8,
    msg_id: u32,
    payload: &[u8],
) -> Result<Frame, FrameError> {
    let extra = crc_extra(msg_id).ok_or(FrameError::UnknownMsgId(msg_id))?;
    Ok(encode_v2(seq, sys_id, comp_id, msg_id, payload, extra))
}

fn encode_v2(seq: u8, sys_id: u8, comp_id: u8, msg_id: u32, payload: &[u8], extra: u8) -> Frame {
    debug_assert!(payload.len() <= 255);
    let payload_len = payload.len().min(255);
    let total = MAVLINK_V2_HEADER_LEN + payload_len + MAVLINK_CHECKSUM_LEN;

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(MAVLINK_STX_V2);
    buf.put_u8(payload_len as u8);
    buf.put_u8(0); // incompat_flags
    buf.put_u8(0); // compat_flags
    buf.put_u8(seq);
    buf.put_u8(sys_id);
    buf.put_u8(comp_id);
    let id = msg_id.to_le_bytes();
    buf.put_slice(&id[..3]);
    buf.put_slice(&payload[..payload_len]);

    let mut crc = Crc16::new();
    crc.update(&buf[1..]);
    crc.update(&[extra]);
    buf.put_u16_le(crc.finish());

    Frame {
        data: buf.freeze(),
        version: MavVersion::V2,
        payload_offset: MAVLINK_V2_HEADER_LEN,
        payload_len,
        signature_len: 0,
    }
}

/// Build the GCS HEARTBEAT we emit toward the autopilot: type GCS,
/// autopilot INVALID, state ACTIVE, mavlink_version 3.
pub fn gcs_heartbeat(seq: u8) -> Frame {
    let mut payload = [0u8; 9];
    // custom_mode = 0 (bytes 0..4)
    payload[4] = 6; // MAV_TYPE_GCS
    payload[5] = 8; // MAV_AUTOPILOT_INVALID
    payload[6] = 0; // base_mode
    payload[7] = 4; // MAV_STATE_ACTIVE
    payload[8] = 3; // mavlink_version
    encode_v2(
        seq,
        GCS_SYSTEM_ID,
        GCS_COMPONENT_ID,
        HEARTBEAT_MSG_ID,
        &payload,
        50,
    )
}

/// Fast CRC-16/MCRF4XX calculation for MAVLink
struct Crc16(u16);

impl Crc16 {
    fn new() -> Self {
        Crc16(0xFFFF)
    }

    fn update(&mut self, buf: &[u8]) {
        const X25_CRC_TABLE: [u16; 256] = generate_crc_table();
        for &byte in buf {
            let tmp = byte ^ (self.0 as u8);
            self.0 = (self.0 >> 8) ^ X25_CRC_TABLE[tmp as usize];
        }
    }

    fn finish(&self) -> u16 {
        self.0
    }
}

const fn generate_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut j = 0;
        while j < 8 {
            if (crc & 1) != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(buf: &[u8]) -> Frame {
        match Frame::parse(buf) {
            (ParseOutcome::Frame(f), consumed) => {
                assert_eq!(consumed, f.len());
                f
            }
            (other, consumed) => panic!("expected frame, got {:?} consumed {}", other, consumed),
        }
    }

    #[test]
    fn heartbeat_round_trip() {
        let frame = gcs_heartbeat(7);
        assert_eq!(frame.msg_id(), HEARTBEAT_MSG_ID);
        assert_eq!(frame.sys_id(), GCS_SYSTEM_ID);
        assert_eq!(frame.comp_id(), GCS_COMPONENT_ID);
        assert_eq!(frame.sequence(), 7);
        assert_eq!(frame.len(), 10 + 9 + 2);

        let reparsed = parse_one(frame.as_bytes());
        assert_eq!(reparsed.as_bytes(), frame.as_bytes());
    }

    #[test]
    fn serialize_parse_identity_for_all_known_ids() {
        for (msg_id, payload_len) in [(0u32, 9usize), (1, 31), (24, 30), (30, 28), (74, 20)] {
            let payload: Vec<u8> = (0..payload_len as u8).collect();
            let frame = serialize_v2(3, 1, 1, msg_id, &payload).unwrap();
            let reparsed = parse_one(frame.as_bytes());
            assert_eq!(reparsed.as_bytes(), frame.as_bytes());
            assert_eq!(reparsed.payload(), &payload[..]);
        }
    }

    #[test]
    fn serialize_unknown_id_rejected() {
        let err = serialize_v2(0, 1, 1, 999, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, FrameError::UnknownMsgId(999)));
    }

    #[test]
    fn payload_length_boundaries() {
        for len in [0usize, 1, 255] {
            let payload = vec![0xA5u8; len];
            // Unknown-id frames skip checksum verification, so hand-build a
            // v2 packet to exercise arbitrary payload lengths.
            let mut buf = vec![0xFD, len as u8, 0, 0, 9, 42, 17, 0xFF, 0x01, 0x00];
            buf.extend_from_slice(&payload);
            buf.extend_from_slice(&[0xAA, 0xBB]); // unchecked CRC
            let frame = parse_one(&buf);
            assert_eq!(frame.payload().len(), len);
            assert_eq!(frame.msg_id(), 0x01FF);
            assert_eq!(frame.sys_id(), 42);

            // And v1.
            let mut buf = vec![0xFE, len as u8, 9, 42, 17, 200];
            buf.extend_from_slice(&payload);
            buf.extend_from_slice(&[0xAA, 0xBB]);
            let frame = parse_one(&buf);
            assert_eq!(frame.payload().len(), len);
            assert_eq!(frame.version(), MavVersion::V1);
        }
    }

    #[test]
    fn need_more_on_partial_header_and_payload() {
        let frame = gcs_heartbeat(0);
        let bytes = frame.as_bytes();
        for cut in 1..bytes.len() {
            match Frame::parse(&bytes[..cut]) {
                (ParseOutcome::NeedMore, 0) => {}
                (other, n) => panic!("cut {}: expected NeedMore, got {:?}/{}", cut, other, n),
            }
        }
    }

    #[test]
    fn leading_garbage_resyncs_then_parses() {
        let frame = gcs_heartbeat(1);
        let mut buf = vec![0x00, 0x13, 0x37, 0x42];
        buf.extend_from_slice(frame.as_bytes());

        match Frame::parse(&buf) {
            (ParseOutcome::Resync, 4) => {}
            (other, n) => panic!("expected Resync/4, got {:?}/{}", other, n),
        }
        let reparsed = parse_one(&buf[4..]);
        assert_eq!(reparsed.as_bytes(), frame.as_bytes());
    }

    #[test]
    fn all_garbage_consumed_in_one_resync() {
        let buf = [0x01u8, 0x02, 0x03, 0x04, 0x05];
        match Frame::parse(&buf) {
            (ParseOutcome::Resync, 5) => {}
            (other, n) => panic!("expected Resync/5, got {:?}/{}", other, n),
        }
    }

    #[test]
    fn bad_checksum_advances_one_byte() {
        let frame = gcs_heartbeat(2);
        let mut buf = frame.as_bytes().to_vec();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        match Frame::parse(&buf) {
            (ParseOutcome::Resync, 1) => {}
            (other, n) => panic!("expected Resync/1, got {:?}/{}", other, n),
        }
    }

    #[test]
    fn corrupted_stream_recovers_embedded_frame() {
        // A spurious 0xFD heading a checksum-invalid HEARTBEAT candidate
        // must not swallow the real frame that follows.
        let frame = gcs_heartbeat(3);
        let mut spurious = vec![0xFD, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut crc = Crc16::new();
        crc.update(&spurious[1..]);
        crc.update(&[50]);
        // Fixed trailer bytes: not a start byte, not the real checksum.
        assert_ne!(crc.finish(), 0x2211);
        spurious.extend_from_slice(&[0x11, 0x22]);

        let mut buf = spurious;
        buf.extend_from_slice(frame.as_bytes());

        let mut cursor = 0usize;
        let mut frames = Vec::new();
        let mut resyncs = 0;
        loop {
            match Frame::parse(&buf[cursor..]) {
                (ParseOutcome::Frame(f), n) => {
                    cursor += n;
                    frames.push(f);
                }
                (ParseOutcome::Resync, n) => {
                    cursor += n;
                    resyncs += 1;
                }
                (ParseOutcome::NeedMore, _) => break,
            }
            if cursor >= buf.len() {
                break;
            }
        }
        assert!(resyncs >= 1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), frame.as_bytes());
    }

    #[test]
    fn signed_v2_frame_passes_through_intact() {
        // Signature bit set: 13 trailing bytes beyond the CRC, not validated.
        let payload = [1u8, 2, 3, 4];
        let mut buf = vec![0xFD, 4, 0x01, 0, 5, 7, 1, 0x2A, 0x00, 0x00];
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&[0x11, 0x22]); // CRC, unchecked for id 42
        buf.extend_from_slice(&[0xEE; 13]);

        let frame = parse_one(&buf);
        assert!(frame.is_signed());
        assert_eq!(frame.signature().unwrap(), &[0xEE; 13]);
        assert_eq!(frame.payload(), &payload);
        assert_eq!(frame.as_bytes(), &buf[..]);
        assert_eq!(frame.len(), 10 + 4 + 2 + 13);
    }

    #[test]
    fn signed_frame_shorter_than_signature_needs_more() {
        let buf = [0xFDu8, 0, 0x01, 0, 0, 1, 1, 0x2A, 0, 0, 0x11, 0x22, 0xEE];
        match Frame::parse(&buf) {
            (ParseOutcome::NeedMore, 0) => {}
            (other, n) => panic!("expected NeedMore, got {:?}/{}", other, n),
        }
    }

    #[test]
    fn crc_known_vector() {
        // CRC-16/MCRF4XX check value for "123456789" is 0x6F91.
        let mut crc = Crc16::new();
        crc.update(b"123456789");
        assert_eq!(crc.finish(), 0x6F91);
    }
}
