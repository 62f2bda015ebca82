//! BLE Operation Queue
//!
//! The underlying transport does not serialize operations itself; a read
//! interleaved with a write on the command characteristic corrupts packet
//! framing and the device answers with fault 16384. This module guarantees
//! that at most one BLE read or write is outstanding on a peripheral, and
//! provides the bounded-retry write primitive used by every command path.

use crate::core::constants::WRITE_RETRY_BASE_BACKOFF_MS;
use btleplug::api::{Characteristic, Peripheral, WriteType};
use log::{debug, warn};
use std::future::Future;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Default attempt count for [`OperationQueue::write`].
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

/// Classifies transient congestion errors worth retrying.
///
/// The transport reports these only by description (`Busy`,
/// `WriteRequestBusy`), so classification is a substring match.
fn is_busy_error(error: &btleplug::Error) -> bool {
    error.to_string().to_lowercase().contains("busy")
}

/// Serializes all reads and writes against one peripheral.
///
/// The lock is not reentrant: callers must not nest `read`/`write` inside
/// `with_lock`.
#[derive(Debug, Default)]
pub struct OperationQueue {
    lock: Mutex<()>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    /// Runs a caller-supplied BLE read closure under the serialization lock.
    ///
    /// Reads are never retried; the underlying error is returned as is.
    pub async fn read<F, Fut>(&self, op: F) -> btleplug::Result<Vec<u8>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = btleplug::Result<Vec<u8>>> + Send,
    {
        let _guard = self.lock.lock().await;
        op().await
    }

    /// Writes `data` to `characteristic`, retrying busy-class failures.
    ///
    /// Each attempt holds the lock only for the write itself; backoffs of
    /// `50 * attempt` ms run with the lock released so concurrent reads can
    /// proceed. Non-busy errors fail fast. Returns the last error when all
    /// attempts are exhausted.
    pub async fn write<P: Peripheral>(
        &self,
        peripheral: &P,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
        max_retries: u32,
    ) -> btleplug::Result<()> {
        let mut attempt: u32 = 0;
        loop {
            let result = {
                let _guard = self.lock.lock().await;
                peripheral.write(characteristic, data, write_type).await
            };
            match result {
                Ok(()) => {
                    if attempt > 0 {
                        debug!("write to {} succeeded on attempt {}", characteristic.uuid, attempt + 1);
                    }
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries.max(1) || !is_busy_error(&e) {
                        return Err(e);
                    }
                    let backoff = WRITE_RETRY_BASE_BACKOFF_MS * attempt as u64;
                    warn!(
                        "busy write to {} (attempt {}), backing off {} ms: {}",
                        characteristic.uuid, attempt, backoff, e
                    );
                    sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    /// Single-attempt write, used by the heartbeat no-op path.
    pub async fn write_simple<P: Peripheral>(
        &self,
        peripheral: &P,
        characteristic: &Characteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> btleplug::Result<()> {
        self.write(peripheral, characteristic, data, write_type, 1).await
    }

    /// Compound-operation escape hatch for read-modify-write sequences.
    ///
    /// Takes the same lock as `read` and `write`.
    pub async fn with_lock<F, Fut, T>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = T> + Send,
    {
        let _guard = self.lock.lock().await;
        op().await
    }
}
