//! Wire protocol parsing.
//!
//! This module defines the packet structures read from the trainer and the
//! stateless parsers that decode them. Parsers never panic on short or
//! malformed input; they return `None` and let the caller drop the sample.

use serde::Serialize;
use time::OffsetDateTime;

/// Helper macro to check if a specific bit is set in a 16-bit word.
macro_rules! is_bit_set {
    ($word:expr, $pos:expr) => {
        ($word & (1 << $pos)) != 0
    };
}

/// Helper macro to extract a `u16` value in little-endian format from a byte slice.
macro_rules! get_u16_le {
    ($slice:expr, $lsb:expr) => {
        (($slice[1 + $lsb] as u16) << 8) | $slice[$lsb] as u16
    };
}

/// Helper macro to extract an `i16` value in little-endian format from a byte slice.
macro_rules! get_i16_le {
    ($slice:expr, $lsb:expr) => {
        get_u16_le!($slice, $lsb) as i16
    };
}

/// Helper macro to extract a `u32` value in little-endian format from a byte slice.
macro_rules! get_u32_le {
    ($slice:expr, $lsb:expr) => {
        ((get_u16_le!($slice, $lsb + 2) as u32) << 16) | get_u16_le!($slice, $lsb) as u32
    };
}

/// Extracts an IEEE-754 float in little-endian format from a byte slice.
fn get_f32_le(slice: &[u8], lsb: usize) -> f32 {
    f32::from_bits(get_u32_le!(slice, lsb))
}

/// Status bit raised when the machine deloads the cables.
const STATUS_BIT_DELOAD: u16 = 0;
/// Status bit raised when the cable travels past the configured upper ROM bound.
const STATUS_BIT_ROM_HIGH: u16 = 1;
/// Status bit raised when the cable travels below the configured lower ROM bound.
const STATUS_BIT_ROM_LOW: u16 = 2;

/// A decoded real-time monitor packet.
///
/// Positions carry 0.1 mm resolution, loads 0.01 kg. The two reserved words
/// between position and load on each side are decoded but not interpreted;
/// they are surfaced for hardware diagnostics only.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct MonitorPacket {
    /// 32-bit device tick counter, combined from two 16-bit halves.
    pub ticks: u32,
    /// Cable A position in mm.
    pub pos_a_mm: f64,
    /// Cable B position in mm.
    pub pos_b_mm: f64,
    /// Cable A load in kg.
    pub load_a_kg: f64,
    /// Cable B load in kg.
    pub load_b_kg: f64,
    /// Status word, present only in the 18-byte packet form.
    pub status: Option<u16>,
    /// Raw reserved word on the A side (offsets 6-7).
    pub reserved_a: i16,
    /// Raw reserved word on the B side (offsets 12-13).
    pub reserved_b: i16,
}

impl MonitorPacket {
    pub fn status_deload(&self) -> bool {
        self.status.is_some_and(|s| is_bit_set!(s, STATUS_BIT_DELOAD))
    }

    pub fn status_rom_high(&self) -> bool {
        self.status.is_some_and(|s| is_bit_set!(s, STATUS_BIT_ROM_HIGH))
    }

    pub fn status_rom_low(&self) -> bool {
        self.status.is_some_and(|s| is_bit_set!(s, STATUS_BIT_ROM_LOW))
    }
}

/// A decoded diagnostic packet: fault codes plus temperature samples.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticPacket {
    /// 16-bit device fault codes; zero entries are idle slots.
    pub faults: Vec<u16>,
    /// Raw 8-bit temperature samples.
    pub temperatures: Vec<u8>,
}

impl DiagnosticPacket {
    /// True iff any reported fault code is non-zero.
    pub fn has_faults(&self) -> bool {
        self.faults.iter().any(|&f| f != 0)
    }

    /// The non-zero fault codes, for change detection and logging.
    pub fn active_faults(&self) -> Vec<u16> {
        self.faults.iter().copied().filter(|&f| f != 0).collect()
    }
}

/// Per-side force statistics polled from the heuristic characteristic.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct HeuristicSide {
    /// Peak concentric force in kg.
    pub peak_concentric_kg: f64,
    /// Average concentric force in kg.
    pub avg_concentric_kg: f64,
    /// Peak eccentric force in kg.
    pub peak_eccentric_kg: f64,
    /// Average eccentric force in kg.
    pub avg_eccentric_kg: f64,
    /// Peak velocity in mm/s.
    pub peak_velocity_mm_s: f64,
}

/// A decoded heuristic packet, timestamped at ingest.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct HeuristicPacket {
    pub side_a: HeuristicSide,
    pub side_b: HeuristicSide,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// A rep notification, in either the legacy or the modern wire form.
///
/// The format is selected purely by length: 6 bytes for legacy firmware,
/// 24 bytes for firmware that also reports ROM boundaries.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct RepNotification {
    /// Completed rep count for the session.
    pub rep_count: u32,
    /// Bit 0 = side A contributed, bit 1 = side B.
    pub side_mask: u8,
    /// Lower ROM boundary in mm (modern packets only).
    pub rom_low_mm: Option<f32>,
    /// Upper ROM boundary in mm (modern packets only).
    pub rom_high_mm: Option<f32>,
    /// Peak rep velocity in mm/s (modern packets only).
    pub peak_velocity_mm_s: Option<f32>,
    /// Rep duration in ms (modern packets only).
    pub duration_ms: Option<u32>,
}

const MONITOR_PACKET_MIN_LEN: usize = 16;
const MONITOR_PACKET_STATUS_LEN: usize = 18;
const HEURISTIC_PACKET_LEN: usize = 20;
const REP_PACKET_LEGACY_LEN: usize = 6;
const REP_PACKET_MODERN_LEN: usize = 24;

/// Parses a monitor packet.
///
/// Layout (little-endian): ticks low u16, ticks high u16, position A i16
/// (0.1 mm), reserved i16, load A u16 (0.01 kg), position B i16, reserved
/// i16, load B u16, then an optional status u16. Velocity is not on the
/// wire; it is computed downstream from successive positions.
pub fn parse_monitor_packet(data: &[u8]) -> Option<MonitorPacket> {
    if data.len() < MONITOR_PACKET_MIN_LEN {
        return None;
    }
    let ticks_low = get_u16_le!(data, 0) as u32;
    let ticks_high = get_u16_le!(data, 2) as u32;
    Some(MonitorPacket {
        ticks: (ticks_high << 16) | ticks_low,
        pos_a_mm: get_i16_le!(data, 4) as f64 / 10.0,
        reserved_a: get_i16_le!(data, 6),
        load_a_kg: get_u16_le!(data, 8) as f64 / 100.0,
        pos_b_mm: get_i16_le!(data, 10) as f64 / 10.0,
        reserved_b: get_i16_le!(data, 12),
        load_b_kg: get_u16_le!(data, 14) as f64 / 100.0,
        status: (data.len() >= MONITOR_PACKET_STATUS_LEN).then(|| get_u16_le!(data, 16)),
    })
}

/// Parses a diagnostic packet.
///
/// The first byte is the fault count, followed by that many 16-bit fault
/// codes; every remaining byte is an 8-bit temperature sample.
pub fn parse_diagnostic_packet(data: &[u8]) -> Option<DiagnosticPacket> {
    let fault_count = *data.first()? as usize;
    let temps_offset = 1 + 2 * fault_count;
    if data.len() < temps_offset {
        return None;
    }
    let faults = (0..fault_count)
        .map(|i| get_u16_le!(data, 1 + 2 * i))
        .collect();
    Some(DiagnosticPacket {
        faults,
        temperatures: data[temps_offset..].to_vec(),
    })
}

fn parse_heuristic_side(data: &[u8], offset: usize) -> HeuristicSide {
    HeuristicSide {
        peak_concentric_kg: get_u16_le!(data, offset) as f64 / 100.0,
        avg_concentric_kg: get_u16_le!(data, offset + 2) as f64 / 100.0,
        peak_eccentric_kg: get_u16_le!(data, offset + 4) as f64 / 100.0,
        avg_eccentric_kg: get_u16_le!(data, offset + 6) as f64 / 100.0,
        peak_velocity_mm_s: get_u16_le!(data, offset + 8) as f64 / 10.0,
    }
}

/// Parses a heuristic packet: ten 16-bit words, side A first.
pub fn parse_heuristic_packet(data: &[u8], timestamp: OffsetDateTime) -> Option<HeuristicPacket> {
    if data.len() < HEURISTIC_PACKET_LEN {
        return None;
    }
    Some(HeuristicPacket {
        side_a: parse_heuristic_side(data, 0),
        side_b: parse_heuristic_side(data, 10),
        timestamp,
    })
}

/// Parses a rep notification in either the 6-byte legacy form or the
/// 24-byte modern form. There is no version byte; length is the selector.
pub fn parse_rep_packet(data: &[u8]) -> Option<RepNotification> {
    match data.len() {
        REP_PACKET_LEGACY_LEN => Some(RepNotification {
            rep_count: get_u16_le!(data, 0) as u32,
            side_mask: data[2],
            rom_low_mm: None,
            rom_high_mm: None,
            peak_velocity_mm_s: None,
            duration_ms: None,
        }),
        REP_PACKET_MODERN_LEN => Some(RepNotification {
            rep_count: get_u32_le!(data, 0),
            side_mask: data[4],
            rom_low_mm: Some(get_f32_le(data, 8)),
            rom_high_mm: Some(get_f32_le(data, 12)),
            peak_velocity_mm_s: Some(get_f32_le(data, 16)),
            duration_ms: Some(get_u32_le!(data, 20)),
        }),
        _ => None,
    }
}

/// True when a notification payload length matches one of the rep forms.
pub fn is_rep_packet_len(len: usize) -> bool {
    len == REP_PACKET_LEGACY_LEN || len == REP_PACKET_MODERN_LEN
}
