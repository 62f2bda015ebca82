//! Handle State Detector
//!
//! Drives the four-state handle machine on each workout metric: resting
//! cables, armed handles, an active grab and plain movement. Grab and
//! release transitions require their trigger condition to hold for a dwell
//! period, and grabs are measured against a captured rest baseline so
//! overhead-pulley setups whose cables never return to zero still detect
//! cleanly.

use crate::core::constants::{
    AUTO_START_VELOCITY_THRESHOLD_MM_S, GRAB_DELTA_THRESHOLD_MM, HANDLE_GRABBED_THRESHOLD_MM,
    HANDLE_REST_THRESHOLD_MM, RELEASE_DELTA_THRESHOLD_MM, STATE_TRANSITION_DWELL_MS,
    VELOCITY_THRESHOLD_MM_S, WAITING_FOR_REST_TIMEOUT_MS,
};
use crate::model::telemetry::{HandleDetection, HandleState, MillisClock, WorkoutMetric};
use log::debug;
use tokio::sync::watch;

const HANDLE_A_BIT: u8 = 0b01;
const HANDLE_B_BIT: u8 = 0b10;

/// Four-state handle machine with hysteresis and baseline tracking.
///
/// Owned by the polling engine and driven only from the monitor task; state
/// is published on watch channels for outside observers.
pub struct HandleStateDetector {
    clock: MillisClock,
    state_tx: watch::Sender<HandleState>,
    detection_tx: watch::Sender<HandleDetection>,
    state: HandleState,
    enabled: bool,
    auto_start: bool,
    /// Rest positions captured when WaitingForRest resolves; grab and
    /// release become baseline-relative once set.
    rest_baseline_a: Option<f64>,
    rest_baseline_b: Option<f64>,
    waiting_since_ms: Option<u64>,
    grab_since_ms: Option<u64>,
    release_since_ms: Option<u64>,
    /// Bit 0 = side A active, bit 1 = side B. Set on the grab transition,
    /// consulted by the release condition, cleared on release.
    active_handles_mask: u8,
    min_position_seen: Option<f64>,
    max_position_seen: Option<f64>,
}

impl HandleStateDetector {
    pub fn new(
        clock: MillisClock,
        state_tx: watch::Sender<HandleState>,
        detection_tx: watch::Sender<HandleDetection>,
    ) -> Self {
        Self {
            clock,
            state_tx,
            detection_tx,
            state: HandleState::WaitingForRest,
            enabled: false,
            auto_start: false,
            rest_baseline_a: None,
            rest_baseline_b: None,
            waiting_since_ms: None,
            grab_since_ms: None,
            release_since_ms: None,
            active_handles_mask: 0,
            min_position_seen: None,
            max_position_seen: None,
        }
    }

    /// Arms the detector for a new set, resetting timers and baselines.
    pub fn enable(&mut self, auto_start: bool) {
        self.enabled = true;
        self.auto_start = auto_start;
        self.rest_baseline_a = None;
        self.rest_baseline_b = None;
        self.waiting_since_ms = Some((self.clock)());
        self.grab_since_ms = None;
        self.release_since_ms = None;
        self.active_handles_mask = 0;
        self.min_position_seen = None;
        self.max_position_seen = None;
        self.set_state(HandleState::WaitingForRest);
    }

    /// Disarms the detector and clears the captured baselines.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.rest_baseline_a = None;
        self.rest_baseline_b = None;
        self.waiting_since_ms = None;
        self.grab_since_ms = None;
        self.release_since_ms = None;
        self.active_handles_mask = 0;
        self.set_state(HandleState::WaitingForRest);
    }

    /// Restarts the state machine, preserving enabled/auto-start mode.
    pub fn reset(&mut self) {
        self.waiting_since_ms = self.enabled.then(|| (self.clock)());
        self.grab_since_ms = None;
        self.release_since_ms = None;
        self.active_handles_mask = 0;
        self.min_position_seen = None;
        self.max_position_seen = None;
        self.set_state(HandleState::WaitingForRest);
    }

    /// Arms the detector for a Just Lift set: auto-start thresholds, fresh
    /// rest wait.
    pub fn enable_just_lift_waiting(&mut self) {
        self.enable(true);
    }

    pub fn is_auto_start_mode(&self) -> bool {
        self.auto_start
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn min_position_seen(&self) -> Option<f64> {
        self.min_position_seen
    }

    pub fn max_position_seen(&self) -> Option<f64> {
        self.max_position_seen
    }

    /// Feeds one metric through the machine.
    pub fn process_metric(&mut self, metric: &WorkoutMetric) {
        if !self.enabled {
            return;
        }
        let now = (self.clock)();
        let pos_a = metric.pos_a_mm;
        let pos_b = metric.pos_b_mm;

        self.detection_tx
            .send_replace(HandleDetection::from_positions(pos_a, pos_b));
        self.track_position_extremes(pos_a, pos_b);

        match self.state {
            HandleState::WaitingForRest => self.step_waiting_for_rest(now, pos_a, pos_b),
            HandleState::Released | HandleState::Moving => {
                self.step_released_or_moving(now, metric)
            }
            HandleState::Grabbed => self.step_grabbed(now, pos_a, pos_b),
        }
    }

    fn step_waiting_for_rest(&mut self, now: u64, pos_a: f64, pos_b: f64) {
        if pos_a < HANDLE_REST_THRESHOLD_MM && pos_b < HANDLE_REST_THRESHOLD_MM {
            self.capture_baseline(pos_a, pos_b);
            self.set_state(HandleState::Released);
            return;
        }
        let waited = self
            .waiting_since_ms
            .map(|since| now.saturating_sub(since) >= WAITING_FOR_REST_TIMEOUT_MS)
            .unwrap_or(false);
        if waited {
            if pos_a > HANDLE_GRABBED_THRESHOLD_MM || pos_b > HANDLE_GRABBED_THRESHOLD_MM {
                // Pre-tensioned cables never rest; a virtual zero baseline
                // lets the first grab register immediately.
                self.capture_baseline(0.0, 0.0);
            } else {
                // Elevated rest, e.g. an overhead pulley.
                self.capture_baseline(pos_a, pos_b);
            }
            self.set_state(HandleState::Released);
        }
    }

    fn step_released_or_moving(&mut self, now: u64, metric: &WorkoutMetric) {
        let velocity_threshold = if self.auto_start {
            AUTO_START_VELOCITY_THRESHOLD_MM_S
        } else {
            VELOCITY_THRESHOLD_MM_S
        };
        let grabbed_a = self.is_grabbed_position(metric.pos_a_mm, self.rest_baseline_a);
        let grabbed_b = self.is_grabbed_position(metric.pos_b_mm, self.rest_baseline_b);
        let active_a = grabbed_a && metric.vel_a_mm_s.abs() > velocity_threshold;
        let active_b = grabbed_b && metric.vel_b_mm_s.abs() > velocity_threshold;

        if active_a || active_b {
            match self.grab_since_ms {
                None => self.grab_since_ms = Some(now),
                Some(since) if now.saturating_sub(since) >= STATE_TRANSITION_DWELL_MS => {
                    self.active_handles_mask = (active_a as u8 * HANDLE_A_BIT)
                        | (active_b as u8 * HANDLE_B_BIT);
                    self.grab_since_ms = None;
                    self.set_state(HandleState::Grabbed);
                    return;
                }
                Some(_) => {}
            }
        } else {
            self.grab_since_ms = None;
        }

        if grabbed_a || grabbed_b {
            self.set_state(HandleState::Moving);
        } else {
            self.set_state(HandleState::Released);
        }
    }

    fn step_grabbed(&mut self, now: u64, pos_a: f64, pos_b: f64) {
        let released_a = self.is_released_position(pos_a, self.rest_baseline_a);
        let released_b = self.is_released_position(pos_b, self.rest_baseline_b);
        let release_condition = match self.active_handles_mask {
            mask if mask == HANDLE_A_BIT => released_a,
            mask if mask == HANDLE_B_BIT => released_b,
            _ => released_a && released_b,
        };

        if release_condition {
            match self.release_since_ms {
                None => self.release_since_ms = Some(now),
                Some(since) if now.saturating_sub(since) >= STATE_TRANSITION_DWELL_MS => {
                    self.active_handles_mask = 0;
                    self.release_since_ms = None;
                    self.set_state(HandleState::Released);
                }
                Some(_) => {}
            }
        } else {
            self.release_since_ms = None;
        }
    }

    fn is_grabbed_position(&self, pos: f64, baseline: Option<f64>) -> bool {
        match baseline {
            Some(base) => pos - base > GRAB_DELTA_THRESHOLD_MM,
            None => pos > HANDLE_GRABBED_THRESHOLD_MM,
        }
    }

    fn is_released_position(&self, pos: f64, baseline: Option<f64>) -> bool {
        match baseline {
            Some(base) => pos - base < RELEASE_DELTA_THRESHOLD_MM,
            None => pos < HANDLE_REST_THRESHOLD_MM,
        }
    }

    fn capture_baseline(&mut self, pos_a: f64, pos_b: f64) {
        debug!("rest baseline captured at ({:.1}, {:.1}) mm", pos_a, pos_b);
        self.rest_baseline_a = Some(pos_a);
        self.rest_baseline_b = Some(pos_b);
    }

    fn track_position_extremes(&mut self, pos_a: f64, pos_b: f64) {
        let low = pos_a.min(pos_b);
        let high = pos_a.max(pos_b);
        self.min_position_seen = Some(self.min_position_seen.map_or(low, |m| m.min(low)));
        self.max_position_seen = Some(self.max_position_seen.map_or(high, |m| m.max(high)));
    }

    fn set_state(&mut self, state: HandleState) {
        if self.state != state {
            debug!("handle state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }
}
