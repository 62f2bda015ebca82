//! Read-only model traits.
//!
//! These interfaces expose the connection supervisor's observable state
//! without granting mutation rights.

use crate::model::telemetry::{ConnectionState, TrainerDevice};
use std::{fmt::Debug, sync::Arc};
use tokio::sync::RwLock;

pub trait ConnectionModelApi: Debug + Send + Sync {
    /// Gets the list of discovered trainers, updated while scanning.
    fn get_devices(&self) -> &Arc<RwLock<Vec<TrainerDevice>>>;

    /// Gets the scanning status.
    fn is_scanning(&self) -> bool;

    /// Gets the current connection lifecycle state.
    fn get_connection_state(&self) -> ConnectionState;

    /// Gets the firmware revision read on connect, if any.
    fn get_firmware_revision(&self) -> Option<String>;
}
