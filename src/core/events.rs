//! Core Events
//!
//! This module defines the inbound command events and the outbound telemetry
//! channels that connect the core to the outer workout layer. Commands
//! forward to the control trait; telemetry flows over per-stream channels
//! with latest-value semantics for states and broadcast semantics for events.

use anyhow::Result;
use event_bridge::EventBridge;
use tokio::sync::{broadcast, watch};

use crate::api::controller::TrainerControlApi;
use crate::model::protocol::{HeuristicPacket, RepNotification};
use crate::model::telemetry::{
    ConnectionState, HandleDetection, HandleState, RomViolation, WorkoutMetric,
};

type HandlerResult = Result<()>;

/// Commands accepted from the outer system, forwarded to the supervisor.
#[derive(Debug, Clone, EventBridge)]
#[forward_to_trait(TrainerControlApi)]
#[trait_returned_type(HandlerResult)]
pub enum TrainerCommandEvent {
    Scan,
    StopScanning,
    Connect(String),
    Disconnect,
    SendCommand(Vec<u8>),
    StartMonitorPolling(bool),
    StopMonitorOnly,
    RestartAll,
    EnableJustLiftWaiting,
    SetLastColorSchemeIndex(usize),
}

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// The outbound channel bundle.
///
/// States (`connection`, `handle_state`, `handle_detection`) ride on watch
/// channels so late subscribers observe the current value; measurements and
/// events ride on bounded broadcast channels where a lagging consumer loses
/// oldest entries rather than stalling the producers.
#[derive(Debug)]
pub struct TelemetryChannels {
    pub metrics: broadcast::Sender<WorkoutMetric>,
    pub heuristics: broadcast::Sender<HeuristicPacket>,
    pub reps: broadcast::Sender<RepNotification>,
    pub deload_events: broadcast::Sender<()>,
    pub rom_violations: broadcast::Sender<RomViolation>,
    pub ble_errors: broadcast::Sender<String>,
    pub command_responses: broadcast::Sender<Vec<u8>>,
    pub handle_state: watch::Sender<HandleState>,
    pub handle_detection: watch::Sender<HandleDetection>,
    pub connection_state: watch::Sender<ConnectionState>,
}

impl TelemetryChannels {
    pub fn new() -> Self {
        Self {
            metrics: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            heuristics: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            reps: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            deload_events: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            rom_violations: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            ble_errors: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            command_responses: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
            handle_state: watch::channel(HandleState::default()).0,
            handle_detection: watch::channel(HandleDetection::default()).0,
            connection_state: watch::channel(ConnectionState::default()).0,
        }
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<WorkoutMetric> {
        self.metrics.subscribe()
    }

    pub fn subscribe_heuristics(&self) -> broadcast::Receiver<HeuristicPacket> {
        self.heuristics.subscribe()
    }

    pub fn subscribe_reps(&self) -> broadcast::Receiver<RepNotification> {
        self.reps.subscribe()
    }

    pub fn subscribe_deload_events(&self) -> broadcast::Receiver<()> {
        self.deload_events.subscribe()
    }

    pub fn subscribe_rom_violations(&self) -> broadcast::Receiver<RomViolation> {
        self.rom_violations.subscribe()
    }

    pub fn subscribe_ble_errors(&self) -> broadcast::Receiver<String> {
        self.ble_errors.subscribe()
    }

    pub fn subscribe_command_responses(&self) -> broadcast::Receiver<Vec<u8>> {
        self.command_responses.subscribe()
    }

    pub fn watch_handle_state(&self) -> watch::Receiver<HandleState> {
        self.handle_state.subscribe()
    }

    pub fn watch_handle_detection(&self) -> watch::Receiver<HandleDetection> {
        self.handle_detection.subscribe()
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }
}

impl Default for TelemetryChannels {
    fn default() -> Self {
        Self::new()
    }
}
