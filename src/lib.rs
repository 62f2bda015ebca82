//! Cable Trainer Control
//!
//! This crate drives a cable-resistance training machine over Bluetooth Low
//! Energy: it serializes all device I/O, decodes the real-time telemetry
//! stream, tracks the handle state machine for rep and auto-start detection,
//! and supervises the connection lifecycle with bounded reconnects. The
//! outer workout layer consumes typed telemetry streams and feeds commands
//! back in; it never touches the peripheral directly.

/// Core utilities shared throughout the crate.
pub mod core {
    /// Protocol constants: UUIDs, cadences and physical thresholds.
    pub mod constants;
    /// Command events and telemetry channels for inter-layer communication.
    pub mod events;
}

/// Public API traits.
pub mod api {
    /// Asynchronous control-plane traits and adapter seams.
    pub mod controller;
    /// Read-only model traits.
    pub mod model;
}

/// Data types of the wire protocol and the emitted telemetry.
pub mod model {
    /// Wire packet structures and stateless parsers.
    pub mod protocol;
    /// Workout metrics, handle states and connection states.
    pub mod telemetry;
}

/// Component implementations.
pub mod components {
    /// Connection lifecycle supervisor with scan and auto-reconnect.
    pub mod connection;
    /// Four-state handle detector with hysteresis and baselines.
    pub mod detector;
    /// Disco-mode LED scheme cycler.
    pub mod led;
    /// The four polling loops and their task supervision.
    pub mod polling;
    /// Monitor sample validation, smoothing and status-flag handling.
    pub mod processor;
    /// Serialization of BLE reads and writes with bounded write retry.
    pub mod queue;
}

pub use crate::api::controller::TrainerControlApi;
pub use crate::components::connection::{PlatformTrainerConnection, TrainerConnection};
pub use crate::core::events::{TelemetryChannels, TrainerCommandEvent};
pub use crate::model::telemetry::{
    ConnectionState, HandleDetection, HandleState, HardwareModel, RomViolation, WorkoutMetric,
};
