//! Frame Codec — decoders and encoders for both tracker families
//! (spec.md §4.2). `DecodedMessage` is the tagged union downstream code
//! dispatches on; it never inspects family-specific fields directly
//! (spec.md §9 "Dynamic message shapes").

pub mod jimi;
pub mod ruptela;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which frame family a message, serial, or protocol byte came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    Jimi(u8),
    Ruptela(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CellInfo {
    pub mcc: u16,
    pub mnc: u16,
    pub lac: u32,
    pub cell_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub course: f64,
    pub satellites: u8,
    pub speed: u16,
    pub hdop: f64,
    pub event_id: u16,
    /// Keyed by element byte-width (1, 2, 4, 8), then by IO id.
    pub io_elements: std::collections::BTreeMap<u8, std::collections::BTreeMap<u16, i64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Login {
        imei: String,
        type_id: u16,
        tz_lang: u16,
        serial: u16,
    },
    Heartbeat {
        /// Jimi frames always carry a trailing serial; Ruptela heartbeats
        /// are correlated by command id instead, so this is `None` there.
        serial: Option<u16>,
        protocol: ProtocolId,
    },
    TimeRequest {
        serial: u16,
    },
    GpsFix {
        ts: DateTime<Utc>,
        lat: f64,
        lon: f64,
        speed: u8,
        course: u16,
        satellites: u8,
        positioned: bool,
        real_time: bool,
        cell: CellInfo,
        serial: u16,
        protocol: ProtocolId,
    },
    Records {
        imei: String,
        command_id: u8,
        records: Vec<Record>,
        records_left: u8,
    },
    Identification {
        imei: String,
        command_id: u8,
        device_type: Option<u16>,
        firmware: Option<String>,
        imsi: Option<String>,
        operator: Option<String>,
    },
    Unknown {
        protocol: ProtocolId,
        serial: Option<u16>,
        payload: Vec<u8>,
    },
}
