//! Open Interface opcodes and command byte encoding (§4.2 command contract).

const CMD_START: u8 = 128;
const CMD_SAFE: u8 = 131;
const CMD_FULL: u8 = 132;
const CMD_CLEAN: u8 = 135;
const CMD_DRIVE: u8 = 137;
const CMD_DOCK: u8 = 143;
const CMD_STREAM: u8 = 148;
const CMD_STREAM_PAUSE_RESUME: u8 = 150;

/// Drive radius meaning "straight" — passes through the velocity clamp
/// unclamped.
pub const RADIUS_STRAIGHT: i32 = 32768;
/// Rotate in place, clockwise.
pub const RADIUS_INPLACE_CW: i32 = -1;
/// Rotate in place, counterclockwise.
pub const RADIUS_INPLACE_CCW: i32 = 1;

const VELOCITY_MIN: i32 = -500;
const VELOCITY_MAX: i32 = 500;
const RADIUS_MIN: i32 = -2000;
const RADIUS_MAX: i32 = 2000;

/// The full set of packet ids this driver knows how to decode, used as the
/// default subscription when none is supplied.
pub const DEFAULT_STREAM_PACKET_IDS: [u8; 14] =
    [7, 8, 9, 10, 11, 12, 19, 20, 21, 25, 26, 34, 43, 44];

/// Sensor-stream frame header byte (`[0x13, payload_len, payload..., checksum]`).
pub const STREAM_HEADER: u8 = 0x13;

/// Fixed payload width, in bytes, for each packet id this driver decodes.
/// `None` (absent from the table) means "unknown id" per §4.2's parser rule.
pub fn packet_size(packet_id: u8) -> Option<usize> {
    match packet_id {
        7 | 8 | 9 | 10 | 11 | 12 | 21 | 34 => Some(1),
        19 | 20 | 25 | 26 | 43 | 44 => Some(2),
        _ => None,
    }
}

/// Big-endian two's-complement encoding of a 16-bit operand. `value` may
/// carry the out-of-i16-range `RADIUS_STRAIGHT` sentinel (32768); wrapping
/// through `u16` reproduces the same bytes the OI expects for -32768.
fn encode_i16(value: i32) -> [u8; 2] {
    (value as u16).to_be_bytes()
}

pub fn encode_start() -> Vec<u8> {
    vec![CMD_START]
}

pub fn encode_safe() -> Vec<u8> {
    vec![CMD_SAFE]
}

pub fn encode_full() -> Vec<u8> {
    vec![CMD_FULL]
}

pub fn encode_clean() -> Vec<u8> {
    vec![CMD_CLEAN]
}

pub fn encode_dock() -> Vec<u8> {
    vec![CMD_DOCK]
}

/// Clamp `velocity` to ±500 mm/s. Clamp `radius` to ±2000 mm unless it is
/// one of the three reserved special values, which pass through unclamped.
/// Returns the clamped values alongside the encoded bytes so callers can
/// record what was actually issued (e.g. for the bumper safety latch).
pub fn encode_drive(velocity: i32, radius: i32) -> (Vec<u8>, i32, i32) {
    let velocity = velocity.clamp(VELOCITY_MIN, VELOCITY_MAX);
    let radius = if matches!(radius, RADIUS_STRAIGHT | RADIUS_INPLACE_CW | RADIUS_INPLACE_CCW) {
        radius
    } else {
        radius.clamp(RADIUS_MIN, RADIUS_MAX)
    };
    let mut bytes = vec![CMD_DRIVE];
    bytes.extend(encode_i16(velocity));
    bytes.extend(encode_i16(radius));
    (bytes, velocity, radius)
}

pub fn encode_stream_subscribe(ids: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + ids.len());
    bytes.push(CMD_STREAM);
    bytes.push(ids.len() as u8);
    bytes.extend_from_slice(ids);
    bytes
}

pub fn encode_stream_pause_resume(resume: bool) -> Vec<u8> {
    vec![CMD_STREAM_PAUSE_RESUME, resume as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_drive_clamps_velocity_both_ways() {
        let (bytes, v, _) = encode_drive(9000, RADIUS_STRAIGHT);
        assert_eq!(v, 500);
        assert_eq!(&bytes[1..3], &[0x01, 0xF4]);
        let (_, v, _) = encode_drive(-9000, RADIUS_STRAIGHT);
        assert_eq!(v, -500);
    }

    #[test]
    fn encode_drive_passes_special_radii_unclamped() {
        let (bytes, _, r) = encode_drive(100, RADIUS_STRAIGHT);
        assert_eq!(r, RADIUS_STRAIGHT);
        assert_eq!(&bytes[3..5], &[0x80, 0x00]);

        let (_, _, r) = encode_drive(100, RADIUS_INPLACE_CW);
        assert_eq!(r, RADIUS_INPLACE_CW);
        let (_, _, r) = encode_drive(100, RADIUS_INPLACE_CCW);
        assert_eq!(r, RADIUS_INPLACE_CCW);
    }

    #[test]
    fn encode_drive_clamps_ordinary_radius() {
        let (_, _, r) = encode_drive(100, 50_000);
        assert_eq!(r, RADIUS_MAX);
        let (_, _, r) = encode_drive(100, -50_000);
        assert_eq!(r, RADIUS_MIN);
    }

    #[test]
    fn encode_stream_subscribe_prefixes_count() {
        let bytes = encode_stream_subscribe(&[7, 8, 19]);
        assert_eq!(bytes, vec![CMD_STREAM, 3, 7, 8, 19]);
    }

    #[test]
    fn opcodes_match_protocol_table() {
        assert_eq!(encode_start(), vec![128]);
        assert_eq!(encode_safe(), vec![131]);
        assert_eq!(encode_full(), vec![132]);
        assert_eq!(encode_clean(), vec![135]);
        assert_eq!(encode_dock(), vec![143]);
        assert_eq!(encode_stream_pause_resume(true), vec![150, 1]);
        assert_eq!(encode_stream_pause_resume(false), vec![150, 0]);
    }
}
