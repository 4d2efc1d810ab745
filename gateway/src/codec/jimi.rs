//! Jimi / GT06 JM-LL301 decoder and encoder (spec.md §4.2).

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use super::{CellInfo, DecodedMessage, ProtocolId};
use crate::checksum::crc16_x25;
use crate::error::DecodeError;

const START_SHORT: u16 = 0x7878;
const END_MARKER: [u8; 2] = [0x0D, 0x0A];

/// Jimi protocol ids that must never receive a reply (spec.md §4.3).
pub const NO_REPLY_PROTOCOLS: [u8; 3] = [0x12, 0x13, 0x16];

/// Decode a validated, checksummed Jimi frame into a `DecodedMessage`.
/// `hemisphere_west` is the per-port configuration flag from spec.md §9(a):
/// it is never inferred from the payload.
pub fn decode(frame: &[u8], hemisphere_west: bool) -> DecodedMessage {
    if frame.len() < 6 {
        return DecodedMessage::Unknown {
            protocol: ProtocolId::Jimi(0),
            serial: None,
            payload: frame.to_vec(),
        };
    }

    let start = u16::from_be_bytes([frame[0], frame[1]]);
    let header_len = if start == START_SHORT { 3 } else { 4 };
    if frame.len() <= header_len {
        return DecodedMessage::Unknown {
            protocol: ProtocolId::Jimi(0),
            serial: None,
            payload: frame.to_vec(),
        };
    }

    let protocol = frame[header_len];
    let payload_start = header_len + 1;
    let total = frame.len();
    let serial = if total >= 6 {
        Some(u16::from_be_bytes([frame[total - 6], frame[total - 5]]))
    } else {
        None
    };
    let payload_end = total.saturating_sub(6).max(payload_start);
    let payload = &frame[payload_start..payload_end];

    match protocol {
        0x01 => decode_login(payload, serial, protocol),
        0x22 | 0xA0 => decode_gps(protocol, payload, serial, hemisphere_west)
            .unwrap_or_else(|| unknown(protocol, serial, payload)),
        0x23 | 0x36 => DecodedMessage::Heartbeat {
            serial: serial.unwrap_or(0),
            protocol: ProtocolId::Jimi(protocol),
        },
        0x8A => DecodedMessage::TimeRequest {
            serial: serial.unwrap_or(0),
        },
        _ => unknown(protocol, serial, payload),
    }
}

fn unknown(protocol: u8, serial: Option<u16>, payload: &[u8]) -> DecodedMessage {
    DecodedMessage::Unknown {
        protocol: ProtocolId::Jimi(protocol),
        serial,
        payload: payload.to_vec(),
    }
}

/// Decode 8 bytes of packed BCD into a digit string, dropping any nibble
/// whose value exceeds 9 (spec.md §9(c)).
fn decode_imei_bcd(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        let hi = byte >> 4;
        let lo = byte & 0x0F;
        if hi <= 9 {
            out.push((b'0' + hi) as char);
        }
        if lo <= 9 {
            out.push((b'0' + lo) as char);
        }
    }
    out
}

fn decode_login(payload: &[u8], serial: Option<u16>, protocol: u8) -> DecodedMessage {
    let (Some(serial), true) = (serial, payload.len() >= 12) else {
        debug!(
            error = %DecodeError::PayloadTooShort { needed: 12, have: payload.len() },
            "downgrading login frame to Unknown"
        );
        return unknown(protocol, serial, payload);
    };
    let imei = decode_imei_bcd(&payload[0..8]);
    if !(14..=16).contains(&imei.len()) {
        debug!(
            error = %DecodeError::ImeiLengthOutOfRange(imei.len()),
            "downgrading login frame to Unknown"
        );
        return unknown(protocol, Some(serial), payload);
    }
    let type_id = u16::from_be_bytes([payload[8], payload[9]]);
    let tz_lang = u16::from_be_bytes([payload[10], payload[11]]);
    DecodedMessage::Login {
        imei,
        type_id,
        tz_lang,
        serial,
    }
}

fn decode_gps(
    protocol: u8,
    payload: &[u8],
    serial: Option<u16>,
    hemisphere_west: bool,
) -> Option<DecodedMessage> {
    let serial = serial?;
    let mut idx = 0usize;

    if payload.len() < 6 + 1 + 4 + 4 + 1 + 2 {
        return None;
    }
    let (y, mo, d, h, mi, s) = (
        payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
    );
    idx += 6;

    let satellites = payload[idx] & 0x0F;
    idx += 1;

    let lat_raw = u32::from_be_bytes(payload[idx..idx + 4].try_into().ok()?);
    idx += 4;
    let lon_raw = u32::from_be_bytes(payload[idx..idx + 4].try_into().ok()?);
    idx += 4;

    let speed = payload[idx];
    idx += 1;

    let course_status = u16::from_be_bytes(payload[idx..idx + 2].try_into().ok()?);
    idx += 2;

    if idx + 2 > payload.len() {
        return None;
    }
    let mcc_raw = u16::from_be_bytes([payload[idx], payload[idx + 1]]);
    idx += 2;
    let mcc = mcc_raw & 0x7FFF;
    let mnc_is_wide = mcc_raw & 0x8000 != 0;

    let mnc = if mnc_is_wide {
        if idx + 2 > payload.len() {
            return None;
        }
        let v = u16::from_be_bytes([payload[idx], payload[idx + 1]]);
        idx += 2;
        v
    } else {
        if idx + 1 > payload.len() {
            return None;
        }
        let v = payload[idx] as u16;
        idx += 1;
        v
    };

    let (lac, cell_id) = if protocol == 0x22 {
        if idx + 2 + 3 > payload.len() {
            return None;
        }
        let lac = u16::from_be_bytes([payload[idx], payload[idx + 1]]) as u32;
        idx += 2;
        let cell_id = read_be_u64(&payload[idx..idx + 3]);
        (lac, cell_id)
    } else {
        if idx + 4 + 8 > payload.len() {
            return None;
        }
        let lac = u32::from_be_bytes(payload[idx..idx + 4].try_into().ok()?);
        idx += 4;
        let cell_id = u64::from_be_bytes(payload[idx..idx + 8].try_into().ok()?);
        (lac, cell_id)
    };

    let ts: DateTime<Utc> = Utc
        .with_ymd_and_hms(
            2000 + y as i32,
            mo as u32,
            d as u32,
            h as u32,
            mi as u32,
            s as u32,
        )
        .single()?;

    let mut lat = lat_raw as f64 / 1_800_000.0;
    let mut lon = lon_raw as f64 / 1_800_000.0;
    if hemisphere_west && lon > 0.0 {
        lon = -lon;
    }
    // Latitude sign is not policy-adjustable per spec.md §9(a) — only
    // longitude hemisphere is a deployment concern here.
    if lat < 0.0 {
        lat = -lat;
    }

    let course = course_status & 0x03FF;
    let real_time = (course_status >> 10) & 1 != 0;
    let positioned = (course_status >> 11) & 1 != 0;

    Some(DecodedMessage::GpsFix {
        ts,
        lat,
        lon,
        speed,
        course,
        satellites,
        positioned,
        real_time,
        cell: CellInfo {
            mcc,
            mnc,
            lac,
            cell_id,
        },
        serial,
        protocol: ProtocolId::Jimi(protocol),
    })
}

fn read_be_u64(bytes: &[u8]) -> u64 {
    let mut v: u64 = 0;
    for &b in bytes {
        v = (v << 8) | b as u64;
    }
    v
}

/// Build a generic 10-byte Jimi ACK/command frame: start, length, protocol,
/// serial, CRC, end. Login ACK, Heartbeat ACK, generic Unknown ACK, and the
/// request-location command all share this exact shape — only the protocol
/// byte and whether `body` is non-empty differ (spec.md §4.2).
fn build_frame(protocol: u8, body: &[u8], serial: u16) -> Vec<u8> {
    let mut inner = Vec::with_capacity(1 + body.len() + 2);
    inner.push(protocol);
    inner.extend_from_slice(body);
    inner.extend_from_slice(&serial.to_be_bytes());

    let length_byte = (inner.len() + 2) as u8;
    let mut frame = Vec::with_capacity(7 + inner.len());
    frame.extend_from_slice(&[0x78, 0x78]);
    frame.push(length_byte);
    frame.extend_from_slice(&inner);

    let crc = crc16_x25(&frame[2..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame.extend_from_slice(&END_MARKER);
    frame
}

/// ACK echoing `protocol` and `serial` — used for Login, Heartbeat, and
/// generic Unknown replies (spec.md §4.2, §4.3).
pub fn encode_ack(protocol: u8, serial: u16) -> Vec<u8> {
    build_frame(protocol, &[], serial)
}

/// Request-location command (protocol 0x80), sent by the Poll Scheduler.
pub fn encode_request_location(serial: u16) -> Vec<u8> {
    build_frame(0x80, &[], serial)
}

/// Time response (protocol 0x8A) carrying the current UTC wall clock.
pub fn encode_time_response(serial: u16, now: DateTime<Utc>) -> Vec<u8> {
    let body = [
        (now.format("%y").to_string().parse::<u8>().unwrap_or(0)),
        now.format("%m").to_string().parse::<u8>().unwrap_or(0),
        now.format("%d").to_string().parse::<u8>().unwrap_or(0),
        now.format("%H").to_string().parse::<u8>().unwrap_or(0),
        now.format("%M").to_string().parse::<u8>().unwrap_or(0),
        now.format("%S").to_string().parse::<u8>().unwrap_or(0),
    ];
    build_frame(0x8A, &body, serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameReader, JimiFrameReader};

    fn login_frame() -> Vec<u8> {
        vec![
            0x78, 0x78, 0x11, 0x01, 0x03, 0x51, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0x36, 0x00,
            0x36, 0x01, 0x00, 0x01, 0x8C, 0xDD, 0x0D, 0x0A,
        ]
    }

    #[test]
    fn login_with_invalid_length_imei_downgrades_to_unknown() {
        // The BCD payload here decodes to "035112345678" (12 digits) once
        // nibbles > 9 are dropped — out of the mandated 14-16 digit range,
        // so this must downgrade rather than stamp a Session IMEI.
        let msg = decode(&login_frame(), true);
        match msg {
            DecodedMessage::Unknown { protocol, serial, .. } => {
                assert_eq!(protocol, ProtocolId::Jimi(0x01));
                assert_eq!(serial, Some(1));
            }
            other => panic!("expected Unknown downgrade, got {other:?}"),
        }
    }

    #[test]
    fn login_with_valid_length_imei_decodes() {
        // All-decimal BCD IMEI bytes, 15 digits.
        let payload: [u8; 12] = [
            0x35, 0x69, 0x38, 0x03, 0x56, 0x43, 0x80, 0x91, 0x36, 0x00, 0x36, 0x01,
        ];
        let mut frame = vec![0x78, 0x78, 0x11, 0x01];
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&1u16.to_be_bytes());
        let crc = crc16_x25(&frame[2..]);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&END_MARKER);

        match decode(&frame, true) {
            DecodedMessage::Login { imei, serial, .. } => {
                assert_eq!(imei, "3569380356438091");
                assert_eq!(serial, 1);
            }
            other => panic!("expected Login, got {other:?}"),
        }
    }

    #[test]
    fn ack_frame_round_trips_through_frame_reader() {
        let ack = encode_ack(0x01, 1);
        let mut reader = JimiFrameReader::new();
        reader.push(&ack);
        let frame = reader.try_extract().unwrap().expect("valid frame");
        assert_eq!(frame.bytes, ack);
    }

    #[test]
    fn gps_4g_fix_applies_hemisphere_policy() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[24, 2, 3, 14, 5, 6]); // 2024-02-03 14:05:06
        payload.push(0x09); // 9 satellites (low nibble)
        payload.extend_from_slice(&0x04FA_E400u32.to_be_bytes()); // lat raw
        payload.extend_from_slice(&0x0617_0A00u32.to_be_bytes()); // lon raw
        payload.push(0); // speed
        payload.extend_from_slice(&0x0C00u16.to_be_bytes()); // positioned bit set
        payload.extend_from_slice(&0x00F1u16.to_be_bytes()); // mcc, narrow mnc
        payload.push(0x01); // mnc
        payload.extend_from_slice(&0x1234u32.to_be_bytes()); // lac (4G, 4 bytes)
        payload.extend_from_slice(&[0u8; 8]); // cell id (4G, 8 bytes)

        let mut frame = vec![0x78, 0x78, (payload.len() + 1 + 2 + 2) as u8, 0xA0];
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&7u16.to_be_bytes());
        let crc = crc16_x25(&frame[2..]);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&END_MARKER);

        match decode(&frame, true) {
            DecodedMessage::GpsFix { lon, positioned, .. } => {
                assert!(positioned);
                assert!(lon < 0.0, "western hemisphere policy should negate lon");
            }
            other => panic!("expected GpsFix, got {other:?}"),
        }
    }

    #[test]
    fn no_reply_protocols_are_exactly_three() {
        assert_eq!(NO_REPLY_PROTOCOLS.len(), 3);
    }
}
