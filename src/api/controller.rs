//! Control-plane traits.
//!
//! This module defines the asynchronous APIs the outer workout layer drives
//! the core through, plus the adapter seams that let tests substitute mock
//! Bluetooth centrals and peripherals for the platform implementations.

use anyhow::Result;
use async_trait::async_trait;
use btleplug::api::Central;
use std::time::Duration;

/// TrainerControlApi trait
///
/// The command surface of the connection supervisor. Every inbound
/// `TrainerCommandEvent` forwards to one of these methods.
#[async_trait]
pub trait TrainerControlApi: Send + Sync {
    /// Start scanning for trainers on the selected adapter.
    async fn scan(&mut self) -> Result<()>;

    /// Stop an active scan. Guarded so redundant calls do not re-emit state.
    async fn stop_scanning(&mut self) -> Result<()>;

    /// Connect to a previously discovered trainer by address string.
    async fn connect(&mut self, address: String) -> Result<()>;

    /// Intentionally tear down the connection and all polling.
    async fn disconnect(&mut self) -> Result<()>;

    /// Serialize an opaque command onto the TX characteristic.
    ///
    /// The core does not interpret the bytes; they are written through the
    /// operation queue with bounded busy-retry.
    async fn send_command(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Await the next device response frame, or time out.
    async fn await_response(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// (Re)start monitor polling for a fresh session.
    async fn start_monitor_polling(&mut self, auto_start: bool) -> Result<()>;

    /// Stop only the monitor loop; diagnostic, heuristic and heartbeat
    /// polling keep running.
    async fn stop_monitor_only(&mut self) -> Result<()>;

    /// Restart the monitor loop unconditionally and revive any other loop
    /// whose task has gone away.
    async fn restart_all(&mut self) -> Result<()>;

    /// Arm the detector for a Just Lift set and ensure auto-start polling.
    async fn enable_just_lift_waiting(&mut self) -> Result<()>;

    /// LED-scheme passthrough; a safe no-op when no schemes are registered.
    async fn set_last_color_scheme_index(&mut self, index: usize) -> Result<()>;
}

/// AdapterDiscovery trait
///
/// Discovery seam over the platform Bluetooth manager so tests can inject
/// mock centrals.
#[async_trait]
pub trait AdapterDiscovery<A: Central + DisplayName> {
    /// Discover available Bluetooth adapters.
    async fn discover_adapters() -> Result<Vec<A>>;
}

/// DisplayName trait
///
/// Uniform access to a human-readable name for adapters and peripherals.
#[async_trait]
pub trait DisplayName {
    /// Get the name to display for the implementing object.
    async fn get_name(&self) -> Result<String>;
}
