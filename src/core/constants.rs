//! Protocol constants for the cable trainer.
//!
//! Characteristic UUIDs, poll cadences and physical thresholds are frozen for
//! the lifetime of the process. Distances are millimeters, velocities mm/s,
//! loads kilograms.

use btleplug::api::bleuuid::uuid_from_u16;
use uuid::{uuid, Uuid};

/// UUID of the command characteristic (write, optionally with response).
pub const TX_UUID: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");
/// UUID of the monitor characteristic (polled read, 16-18 byte packets).
pub const MONITOR_UUID: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");
/// UUID of the diagnostic characteristic (polled read, faults + temperatures).
pub const DIAGNOSTIC_UUID: Uuid = uuid!("6e400004-b5a3-f393-e0a9-e50e24dcca9e");
/// UUID of the heuristic characteristic (polled read, force statistics).
pub const HEURISTIC_UUID: Uuid = uuid!("6e400005-b5a3-f393-e0a9-e50e24dcca9e");
/// UUID for the SIG Firmware Revision String characteristic.
pub const FIRMWARE_REVISION_UUID: Uuid = uuid_from_u16(0x2A26);
/// UUID for the SIG Software Revision String characteristic.
pub const VERSION_UUID: Uuid = uuid_from_u16(0x2A28);

/// Zero-byte keep-alive command sent on the TX characteristic.
pub const HEARTBEAT_NO_OP: [u8; 0] = [];

/// Device name prefix of V-Form machines.
pub const VFORM_NAME_PREFIX: &str = "Vee_";
/// Device name prefix of Trainer+ machines.
pub const TRAINER_PLUS_NAME_PREFIX: &str = "VIT";

// Poll cadences. The monitor loop has no success delay, the BLE round trip
// rate-limits it naturally.
pub const DIAGNOSTIC_POLL_INTERVAL_MS: u64 = 500;
pub const HEURISTIC_POLL_INTERVAL_MS: u64 = 250;
pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;
/// Per-read timeout for monitor and heartbeat reads.
pub const READ_TIMEOUT_MS: u64 = 1000;
/// Delay before retrying after a failed or timed-out monitor read.
pub const MONITOR_ERROR_DELAY_MS: u64 = 50;
/// Consecutive monitor timeouts after which the link is declared lost.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;
/// Base write backoff; attempt n waits n times this with the lock released.
pub const WRITE_RETRY_BASE_BACKOFF_MS: u64 = 50;
/// Auto-reconnect attempts after an unexpected transport disconnect.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Dwell required before Released/Grabbed transitions are taken.
pub const STATE_TRANSITION_DWELL_MS: u64 = 200;
/// Forced transition out of WaitingForRest after this long.
pub const WAITING_FOR_REST_TIMEOUT_MS: u64 = 3000;
/// Minimum spacing between deload callbacks.
pub const DELOAD_DEBOUNCE_MS: u64 = 2000;

// Rate limits for hot-path logging.
pub const MONITOR_LOG_EVERY: u64 = 200;
pub const HEURISTIC_LOG_EVERY: u64 = 100;
pub const DIAGNOSTIC_LOG_EVERY: u64 = 20;

// Handle-state thresholds.
pub const HANDLE_REST_THRESHOLD_MM: f64 = 5.0;
pub const HANDLE_GRABBED_THRESHOLD_MM: f64 = 50.0;
/// Baseline-relative grab threshold.
pub const GRAB_DELTA_THRESHOLD_MM: f64 = 50.0;
/// Baseline-relative release threshold.
pub const RELEASE_DELTA_THRESHOLD_MM: f64 = 20.0;
pub const SIMPLE_DETECTION_THRESHOLD_MM: f64 = 50.0;
pub const VELOCITY_THRESHOLD_MM_S: f64 = 50.0;
/// Lower threshold used in auto-start mode so a gentle first rep arms the machine.
pub const AUTO_START_VELOCITY_THRESHOLD_MM_S: f64 = 20.0;

// Sample validation. Range constants are floats so the hot path never
// converts per call.
pub const MIN_POSITION_MM: f64 = 0.0;
pub const MAX_POSITION_MM: f64 = 1200.0;
pub const POSITION_JUMP_THRESHOLD_MM: f64 = 20.0;
pub const MAX_WEIGHT_KG: f64 = 120.0;

/// Smoothing factor of the velocity EMA.
pub const VELOCITY_EMA_ALPHA: f64 = 0.3;

/// Fault code the device reports when reads and writes interleave on the
/// command characteristic.
pub const FAULT_BAD_PACKET_STRUCTURE: u16 = 16384;
