//! Monitor Data Processor
//!
//! Transforms raw monitor packets into validated, smoothed workout metrics.
//! The pipeline runs synchronously on the monitor polling task at 10-20 Hz
//! and feeds consumers rendering at 60 Hz, so it performs no allocation and
//! takes no lock. Stages: position clamp, status flags, tracking update,
//! validation, raw velocity, EMA smoothing, emit.

use crate::core::constants::{
    DELOAD_DEBOUNCE_MS, MAX_POSITION_MM, MAX_WEIGHT_KG, MIN_POSITION_MM,
    POSITION_JUMP_THRESHOLD_MM, VELOCITY_EMA_ALPHA,
};
use crate::model::protocol::MonitorPacket;
use crate::model::telemetry::{MillisClock, RomViolation, WorkoutMetric};
use log::debug;

pub type DeloadCallback = Box<dyn Fn() + Send + Sync>;
pub type RomViolationCallback = Box<dyn Fn(RomViolation) + Send + Sync>;

/// Observed inter-sample interval statistics, for diagnostics.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct PollRateStats {
    /// Number of measured intervals (samples minus one).
    pub intervals: u64,
    pub mean_interval_ms: f64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
}

/// Per-session monitor sample pipeline.
///
/// Owned by the polling engine and mutated only from the monitor task, so no
/// synchronization is needed; the tracking-update-before-validation rule is
/// total-ordered by construction.
pub struct MonitorDataProcessor {
    clock: MillisClock,
    on_deload: DeloadCallback,
    on_rom_violation: RomViolationCallback,
    /// Positions of the previous parsed sample. Updated before validation so
    /// a rejected jump cannot cascade into rejecting its successor.
    tracking_pos_a: Option<f64>,
    tracking_pos_b: Option<f64>,
    tracking_time_ms: Option<u64>,
    /// Most recent in-range positions, substituted for out-of-range reads.
    last_valid_pos_a: Option<f64>,
    last_valid_pos_b: Option<f64>,
    ema_vel_a: Option<f64>,
    ema_vel_b: Option<f64>,
    last_deload_ms: Option<u64>,
    interval_count: u64,
    interval_sum_ms: u64,
    interval_min_ms: u64,
    interval_max_ms: u64,
}

impl MonitorDataProcessor {
    pub fn new(
        clock: MillisClock,
        on_deload: DeloadCallback,
        on_rom_violation: RomViolationCallback,
    ) -> Self {
        Self {
            clock,
            on_deload,
            on_rom_violation,
            tracking_pos_a: None,
            tracking_pos_b: None,
            tracking_time_ms: None,
            last_valid_pos_a: None,
            last_valid_pos_b: None,
            ema_vel_a: None,
            ema_vel_b: None,
            last_deload_ms: None,
            interval_count: 0,
            interval_sum_ms: 0,
            interval_min_ms: u64::MAX,
            interval_max_ms: 0,
        }
    }

    /// Clears all per-session state. Callbacks and the clock survive.
    pub fn reset_for_new_session(&mut self) {
        self.tracking_pos_a = None;
        self.tracking_pos_b = None;
        self.tracking_time_ms = None;
        self.last_valid_pos_a = None;
        self.last_valid_pos_b = None;
        self.ema_vel_a = None;
        self.ema_vel_b = None;
        self.last_deload_ms = None;
        self.interval_count = 0;
        self.interval_sum_ms = 0;
        self.interval_min_ms = u64::MAX;
        self.interval_max_ms = 0;
    }

    /// Runs one packet through the pipeline.
    ///
    /// Returns `None` when the sample is rejected; processor state needed by
    /// later samples is still maintained.
    pub fn process(&mut self, packet: &MonitorPacket) -> Option<WorkoutMetric> {
        let now = (self.clock)();

        // Stage 1: clamp out-of-range positions to the last valid reading.
        let pos_a = match Self::clamp_position(packet.pos_a_mm, self.last_valid_pos_a) {
            Some(p) => p,
            None => {
                debug!("monitor sample dropped, position A {} out of range with no prior", packet.pos_a_mm);
                return None;
            }
        };
        let pos_b = match Self::clamp_position(packet.pos_b_mm, self.last_valid_pos_b) {
            Some(p) => p,
            None => {
                debug!("monitor sample dropped, position B {} out of range with no prior", packet.pos_b_mm);
                return None;
            }
        };
        if Self::in_range(packet.pos_a_mm) {
            self.last_valid_pos_a = Some(packet.pos_a_mm);
        }
        if Self::in_range(packet.pos_b_mm) {
            self.last_valid_pos_b = Some(packet.pos_b_mm);
        }

        // Stage 2: status flags.
        self.process_status_flags(packet, now);

        // Stage 3: tracking update, unconditionally before validation.
        let prev_pos_a = self.tracking_pos_a.replace(pos_a);
        let prev_pos_b = self.tracking_pos_b.replace(pos_b);
        let prev_time = self.tracking_time_ms.replace(now);

        if let Some(prev) = prev_time {
            let dt = now.saturating_sub(prev);
            self.interval_count += 1;
            self.interval_sum_ms += dt;
            self.interval_min_ms = self.interval_min_ms.min(dt);
            self.interval_max_ms = self.interval_max_ms.max(dt);
        }

        // Stage 4: validation against the previous sample's positions.
        if let Some(prev) = prev_pos_a {
            if (pos_a - prev).abs() > POSITION_JUMP_THRESHOLD_MM {
                debug!("monitor sample dropped, position A jump {:.1} mm", (pos_a - prev).abs());
                return None;
            }
        }
        if let Some(prev) = prev_pos_b {
            if (pos_b - prev).abs() > POSITION_JUMP_THRESHOLD_MM {
                debug!("monitor sample dropped, position B jump {:.1} mm", (pos_b - prev).abs());
                return None;
            }
        }
        if packet.load_a_kg > MAX_WEIGHT_KG || packet.load_b_kg > MAX_WEIGHT_KG {
            debug!("monitor sample dropped, load {}/{} kg over limit", packet.load_a_kg, packet.load_b_kg);
            return None;
        }

        // Stages 5 and 6: raw velocity, then EMA. The first sample of a
        // session has no previous timestamp; it emits zero velocity and does
        // not seed the EMA, so the seed is the first real velocity.
        let (vel_a, vel_b) = match (prev_time, prev_pos_a, prev_pos_b) {
            (Some(prev_t), Some(prev_a), Some(prev_b)) if now > prev_t => {
                let dt = (now - prev_t) as f64;
                let raw_a = (pos_a - prev_a) * 1000.0 / dt;
                let raw_b = (pos_b - prev_b) * 1000.0 / dt;
                (
                    Self::smooth(&mut self.ema_vel_a, raw_a),
                    Self::smooth(&mut self.ema_vel_b, raw_b),
                )
            }
            _ => (0.0, 0.0),
        };

        // Stage 7: emit.
        Some(WorkoutMetric {
            timestamp_ms: now,
            ticks: packet.ticks,
            pos_a_mm: pos_a,
            pos_b_mm: pos_b,
            vel_a_mm_s: vel_a,
            vel_b_mm_s: vel_b,
            load_a_kg: packet.load_a_kg,
            load_b_kg: packet.load_b_kg,
            status: packet.status.unwrap_or(0),
        })
    }

    /// Observed inter-sample interval statistics for the current session.
    pub fn poll_rate_stats(&self) -> PollRateStats {
        PollRateStats {
            intervals: self.interval_count,
            mean_interval_ms: if self.interval_count == 0 {
                0.0
            } else {
                self.interval_sum_ms as f64 / self.interval_count as f64
            },
            min_interval_ms: if self.interval_count == 0 { 0 } else { self.interval_min_ms },
            max_interval_ms: self.interval_max_ms,
        }
    }

    fn in_range(pos_mm: f64) -> bool {
        (MIN_POSITION_MM..=MAX_POSITION_MM).contains(&pos_mm)
    }

    fn clamp_position(pos_mm: f64, last_valid: Option<f64>) -> Option<f64> {
        if Self::in_range(pos_mm) {
            Some(pos_mm)
        } else {
            last_valid
        }
    }

    fn smooth(ema: &mut Option<f64>, raw: f64) -> f64 {
        let next = match *ema {
            Some(prev) => VELOCITY_EMA_ALPHA * raw + (1.0 - VELOCITY_EMA_ALPHA) * prev,
            None => raw,
        };
        *ema = Some(next);
        next
    }

    fn process_status_flags(&mut self, packet: &MonitorPacket, now: u64) {
        if packet.status_deload() {
            let due = match self.last_deload_ms {
                Some(last) => now.saturating_sub(last) >= DELOAD_DEBOUNCE_MS,
                None => true,
            };
            if due {
                self.last_deload_ms = Some(now);
                (self.on_deload)();
            }
        }
        if packet.status_rom_high() {
            (self.on_rom_violation)(RomViolation::OutsideHigh);
        }
        if packet.status_rom_low() {
            (self.on_rom_violation)(RomViolation::OutsideLow);
        }
    }
}
