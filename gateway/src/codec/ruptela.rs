//! Ruptela FMB/Pro5/ECO5 decoder and encoder (spec.md §4.2).

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use super::{DecodedMessage, ProtocolId, Record};
use crate::checksum::crc16_kermit;
use crate::error::DecodeError;

const CMD_RECORDS: u8 = 1;
const CMD_RECORDS_EXT: u8 = 68;
const CMD_IDENTIFICATION: u8 = 15;
const CMD_HEARTBEAT: u8 = 16;
const CMD_DYNAMIC_IDENTIFICATION: u8 = 18;

/// Decode a validated, checksummed Ruptela frame into a `DecodedMessage`.
pub fn decode(frame: &[u8]) -> DecodedMessage {
    if frame.len() < 11 {
        return DecodedMessage::Unknown {
            protocol: ProtocolId::Ruptela(0),
            serial: None,
            payload: frame.to_vec(),
        };
    }

    let imei = u64::from_be_bytes(frame[2..10].try_into().unwrap()).to_string();
    let command_id = frame[10];
    let payload = &frame[11..frame.len() - 2]; // excludes trailing CRC

    match command_id {
        CMD_RECORDS | CMD_RECORDS_EXT => decode_records(imei, command_id, payload),
        CMD_IDENTIFICATION | CMD_DYNAMIC_IDENTIFICATION => {
            decode_identification(imei, command_id, payload)
        }
        CMD_HEARTBEAT => DecodedMessage::Heartbeat {
            serial: None,
            protocol: ProtocolId::Ruptela(command_id),
        },
        _ => DecodedMessage::Unknown {
            protocol: ProtocolId::Ruptela(command_id),
            serial: None,
            payload: payload.to_vec(),
        },
    }
}

fn decode_records(imei: String, command_id: u8, payload: &[u8]) -> DecodedMessage {
    if payload.len() < 2 {
        debug!(
            error = %DecodeError::PayloadTooShort { needed: 2, have: payload.len() },
            "downgrading records frame to Unknown"
        );
        return DecodedMessage::Unknown {
            protocol: ProtocolId::Ruptela(command_id),
            serial: None,
            payload: payload.to_vec(),
        };
    }

    let records_left = payload[0];
    let num_records = payload[1];
    let extended = command_id == CMD_RECORDS_EXT;
    let id_width: usize = if extended { 2 } else { 1 };
    let header_len: usize = if extended { 25 } else { 23 };

    let mut cursor = 2usize;
    let mut records = Vec::with_capacity(num_records as usize);

    'records: for _ in 0..num_records {
        if cursor + header_len > payload.len() {
            break;
        }
        let h = &payload[cursor..cursor + header_len];
        let mut p = 0usize;
        let ts_secs = u32::from_be_bytes(h[p..p + 4].try_into().unwrap());
        p += 4;
        p += 1; // timestamp extension, unused downstream
        if extended {
            p += 1; // record extension, unused downstream
        }
        let priority = h[p];
        p += 1;
        let lon_raw = i32::from_be_bytes(h[p..p + 4].try_into().unwrap());
        p += 4;
        let lat_raw = i32::from_be_bytes(h[p..p + 4].try_into().unwrap());
        p += 4;
        let altitude_raw = u16::from_be_bytes(h[p..p + 2].try_into().unwrap());
        p += 2;
        let angle_raw = u16::from_be_bytes(h[p..p + 2].try_into().unwrap());
        p += 2;
        let satellites = h[p];
        p += 1;
        let speed = u16::from_be_bytes(h[p..p + 2].try_into().unwrap());
        p += 2;
        let hdop_raw = h[p];
        p += 1;
        let event_id: u16 = if extended {
            u16::from_be_bytes(h[p..p + 2].try_into().unwrap())
        } else {
            h[p] as u16
        };

        let timestamp: DateTime<Utc> = Utc
            .timestamp_opt(ts_secs as i64, 0)
            .single()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().unwrap());

        let mut record = Record {
            timestamp,
            priority,
            lon: lon_raw as f64 / 1e7,
            lat: lat_raw as f64 / 1e7,
            altitude: altitude_raw as f64 / 10.0,
            course: angle_raw as f64 / 100.0,
            satellites,
            speed,
            hdop: hdop_raw as f64 / 10.0,
            event_id,
            io_elements: BTreeMap::new(),
        };

        cursor += header_len;

        for &width in &[1usize, 2, 4, 8] {
            if cursor + 1 > payload.len() {
                records.push(record);
                break 'records;
            }
            let count = payload[cursor];
            cursor += 1;
            let mut section = BTreeMap::new();
            for _ in 0..count {
                let need = id_width + width;
                if cursor + need > payload.len() {
                    // Overrun: keep what this section already parsed and
                    // stop decoding entirely (we can no longer trust where
                    // the next record or section starts).
                    record.io_elements.insert(width as u8, section);
                    records.push(record);
                    break 'records;
                }
                let io_id = if id_width == 2 {
                    u16::from_be_bytes([payload[cursor], payload[cursor + 1]])
                } else {
                    payload[cursor] as u16
                };
                cursor += id_width;
                let value = read_be_i64(&payload[cursor..cursor + width]);
                cursor += width;
                section.insert(io_id, value);
            }
            record.io_elements.insert(width as u8, section);
        }

        records.push(record);
    }

    DecodedMessage::Records {
        imei,
        command_id,
        records,
        records_left,
    }
}

/// Reads a big-endian unsigned value of `bytes.len()` width (1, 2, 4, or 8).
/// The size-8 IO element is a raw `u64` on the wire; spec.md §4.2 mandates
/// clamping it to the `i64` range rather than bit-reinterpreting it, so a
/// value like all-0xFF (`u64::MAX`) becomes `i64::MAX`, not `-1`.
fn read_be_i64(bytes: &[u8]) -> i64 {
    let mut v: u64 = 0;
    for &b in bytes {
        v = (v << 8) | b as u64;
    }
    if bytes.len() == 8 {
        v.min(i64::MAX as u64) as i64
    } else {
        v as i64
    }
}

/// Identification payloads beyond the command id aren't fully specified by
/// the wire description this gateway was built from; fields are read
/// opportunistically (length-prefixed ASCII, in the style this codebase
/// uses for its other length-prefixed wire values) and left `None` once the
/// payload runs out rather than guessed at.
fn decode_identification(imei: String, command_id: u8, payload: &[u8]) -> DecodedMessage {
    let mut cursor = 0usize;
    let device_type = if cursor + 2 <= payload.len() {
        let v = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]);
        cursor += 2;
        Some(v)
    } else {
        None
    };

    let firmware = read_pascal_string(payload, &mut cursor);
    let imsi = read_pascal_string(payload, &mut cursor);
    let operator = read_pascal_string(payload, &mut cursor);

    DecodedMessage::Identification {
        imei,
        command_id,
        device_type,
        firmware,
        imsi,
        operator,
    }
}

fn read_pascal_string(payload: &[u8], cursor: &mut usize) -> Option<String> {
    if *cursor >= payload.len() {
        return None;
    }
    let len = payload[*cursor] as usize;
    let start = *cursor + 1;
    if start + len > payload.len() {
        return None;
    }
    let s = String::from_utf8_lossy(&payload[start..start + len]).into_owned();
    *cursor = start + len;
    Some(s)
}

fn build_ack_frame(response_command: u8, rest: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(1 + rest.len());
    inner.push(response_command);
    inner.extend_from_slice(rest);

    let length = inner.len() as u16;
    let mut frame = Vec::with_capacity(4 + inner.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&inner);

    let crc = crc16_kermit(&frame[2..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Records ACK (command 100): positive iff at least one record survived
/// normalization (spec.md §4.3).
pub fn encode_records_ack(positive: bool) -> Vec<u8> {
    build_ack_frame(100, &[if positive { 1 } else { 0 }])
}

/// Identification ACK (command 115): authorized, or rejected with a
/// backoff in minutes.
pub fn encode_identification_ack(authorized: bool, delay_minutes: Option<u8>) -> Vec<u8> {
    if authorized {
        build_ack_frame(115, &[0x01])
    } else {
        let mut rest = vec![0x02];
        if let Some(d) = delay_minutes {
            rest.push(d);
        }
        build_ack_frame(115, &rest)
    }
}

/// Heartbeat ACK (command 116).
pub fn encode_heartbeat_ack() -> Vec<u8> {
    build_ack_frame(116, &[0x01])
}

/// Generic ACK for an otherwise-unrecognized command, per the received
/// command id + 99 convention (spec.md §3 invariants).
pub fn encode_generic_ack(received_command_id: u8) -> Vec<u8> {
    build_ack_frame(received_command_id.wrapping_add(99), &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameReader, RuptelaFrameReader};

    fn single_record_bytes(lat: i32, lon: i32, speed: u16, ts: u32) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&ts.to_be_bytes());
        h.push(0); // ts ext
        h.push(1); // priority
        h.extend_from_slice(&lon.to_be_bytes());
        h.extend_from_slice(&lat.to_be_bytes());
        h.extend_from_slice(&100u16.to_be_bytes()); // altitude raw
        h.extend_from_slice(&9000u16.to_be_bytes()); // angle raw
        h.push(8); // satellites
        h.extend_from_slice(&speed.to_be_bytes());
        h.push(10); // hdop raw
        h.push(5); // event id
        h.extend_from_slice(&[0, 0, 0, 0]); // four empty IO sections (count=0 each)
        h
    }

    fn records_frame(imei: u64, records: &[Vec<u8>]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.push(0); // records left
        payload.push(records.len() as u8);
        for r in records {
            payload.extend_from_slice(r);
        }

        let mut inner = Vec::new();
        inner.extend_from_slice(&imei.to_be_bytes());
        inner.push(CMD_RECORDS);
        inner.extend_from_slice(&payload);

        let len = inner.len() as u16;
        let mut frame = Vec::new();
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&inner);
        let crc = crc16_kermit(&frame[2..]);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame
    }

    #[test]
    fn decodes_two_record_batch() {
        let r1 = single_record_bytes(356_938_035, -463_000_000, 50, 1_700_000_000);
        let r2 = single_record_bytes(356_938_036, -463_000_010, 0, 1_700_000_060);
        let frame = records_frame(356938035643809, &[r1, r2]);

        match decode(&frame) {
            DecodedMessage::Records {
                imei,
                records,
                records_left,
                ..
            } => {
                assert_eq!(imei, "356938035643809");
                assert_eq!(records.len(), 2);
                assert_eq!(records_left, 0);
                assert!((records[0].lat - 35.6938035).abs() < 1e-6);
            }
            other => panic!("expected Records, got {other:?}"),
        }
    }

    #[test]
    fn io_section_overrun_preserves_parsed_elements() {
        let mut record = single_record_bytes(356_938_035, -463_000_000, 50, 1_700_000_000);
        // Truncate right after declaring a count of 3 in the first (1-byte)
        // section but supplying only one (ioId, value) pair.
        let overrun_point = record.len() - 4; // start of the four-section header
        record.truncate(overrun_point);
        record.push(3); // claim 3 elements in the 1-byte-width section
        record.push(5); // ioId
        record.push(42); // value (only one pair present, not three)

        let frame = records_frame(356938035643809, &[record]);
        match decode(&frame) {
            DecodedMessage::Records { records, .. } => {
                assert_eq!(records.len(), 1);
                let sec = records[0].io_elements.get(&1).expect("section present");
                assert_eq!(sec.get(&5), Some(&42));
                assert_eq!(sec.len(), 1);
            }
            other => panic!("expected Records, got {other:?}"),
        }
    }

    #[test]
    fn size_8_io_value_saturates_instead_of_wrapping_negative() {
        assert_eq!(read_be_i64(&[0xFF; 8]), i64::MAX);
        assert_eq!(read_be_i64(&[0x00; 8]), 0);
    }

    #[test]
    fn size_1_io_value_is_unaffected_by_saturation() {
        assert_eq!(read_be_i64(&[0xFF]), 0xFF);
    }

    #[test]
    fn records_ack_round_trips_through_frame_reader() {
        let ack = encode_records_ack(true);
        let mut reader = RuptelaFrameReader::new();
        reader.push(&ack);
        let frame = reader.try_extract().unwrap().expect("valid frame");
        assert_eq!(frame.bytes, ack);
    }

    #[test]
    fn ack_command_id_is_received_plus_99() {
        assert_eq!(encode_heartbeat_ack()[2], 116);
        assert_eq!(encode_identification_ack(true, None)[2], 115);
        assert_eq!(encode_records_ack(true)[2], 100);
    }
}
