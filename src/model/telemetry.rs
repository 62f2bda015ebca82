//! Telemetry and state types.
//!
//! This module defines the typed data the core emits to the outer system:
//! workout metrics, handle states, connection states and the descriptors of
//! discovered trainers. All states are closed sum types matched exhaustively.

use crate::core::constants::{SIMPLE_DETECTION_THRESHOLD_MM, TRAINER_PLUS_NAME_PREFIX, VFORM_NAME_PREFIX};
use btleplug::api::BDAddr;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Injectable monotonic millisecond clock.
///
/// Production binds this to the OS monotonic clock; tests substitute a
/// counter they advance by hand.
pub type MillisClock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// A monotonic clock anchored at its creation instant.
pub fn monotonic_clock() -> MillisClock {
    let origin = Instant::now();
    Arc::new(move || origin.elapsed().as_millis() as u64)
}

/// One validated, smoothed sample of the machine's physical state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct WorkoutMetric {
    /// Monotonic timestamp of ingest, in ms.
    pub timestamp_ms: u64,
    /// Device tick counter from the monitor packet.
    pub ticks: u32,
    /// Cable positions in mm, clamped to the valid range.
    pub pos_a_mm: f64,
    pub pos_b_mm: f64,
    /// EMA-smoothed signed velocities in mm/s.
    pub vel_a_mm_s: f64,
    pub vel_b_mm_s: f64,
    /// Cable loads in kg.
    pub load_a_kg: f64,
    pub load_b_kg: f64,
    /// Raw status word, zero when the packet carried none.
    pub status: u16,
}

/// Coarse per-side handle presence, true when that cable sits beyond the
/// simple detection threshold.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HandleDetection {
    pub left_detected: bool,
    pub right_detected: bool,
}

impl HandleDetection {
    pub fn from_positions(pos_a_mm: f64, pos_b_mm: f64) -> Self {
        Self {
            left_detected: pos_a_mm > SIMPLE_DETECTION_THRESHOLD_MM,
            right_detected: pos_b_mm > SIMPLE_DETECTION_THRESHOLD_MM,
        }
    }
}

/// Fine-grained handle state driven by the detector.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub enum HandleState {
    /// Waiting for the cables to settle before arming.
    #[default]
    WaitingForRest,
    /// Cables at (or accepted as) rest, ready for a grab.
    Released,
    /// A handle is held and moving; a set is in progress.
    Grabbed,
    /// A handle is lifted but not yet moving fast enough to count as grabbed.
    Moving,
}

/// Typed cause of a range-of-motion violation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum RomViolation {
    OutsideHigh,
    OutsideLow,
}

/// Hardware model, inferred from the advertised device name.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum HardwareModel {
    VForm,
    TrainerPlus,
    Unknown,
}

impl HardwareModel {
    pub fn from_device_name(name: &str) -> Self {
        if name.starts_with(VFORM_NAME_PREFIX) {
            HardwareModel::VForm
        } else if name.starts_with(TRAINER_PLUS_NAME_PREFIX) {
            HardwareModel::TrainerPlus
        } else {
            HardwareModel::Unknown
        }
    }

    /// True when the advertised name belongs to a supported trainer.
    pub fn is_recognized_name(name: &str) -> bool {
        !matches!(Self::from_device_name(name), HardwareModel::Unknown)
    }
}

/// A discovered trainer.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrainerDevice {
    /// The advertised name of the device.
    pub name: String,
    /// The unique Bluetooth address of the device.
    pub address: BDAddr,
}

/// Connection lifecycle state of the trainer link.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected {
        device_name: String,
        device_address: BDAddr,
        hardware_model: HardwareModel,
    },
    /// Terminal failure after retries are exhausted; the outer system must
    /// observe this state to recover.
    Error {
        message: String,
        cause: Option<String>,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}
