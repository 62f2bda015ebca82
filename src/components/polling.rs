//! Polling Engine
//!
//! Owns the four polling loops that keep a connected trainer alive and
//! streaming: monitor (position/load hot path), diagnostic (faults and
//! temperatures), heuristic (force statistics) and heartbeat (keep-alive).
//! Each loop runs on its own task handle so cancelling one never disturbs
//! the others; the monitor loop additionally counts consecutive read
//! timeouts and reports a lost connection at the threshold.

use crate::components::detector::HandleStateDetector;
use crate::components::processor::{MonitorDataProcessor, PollRateStats};
use crate::components::queue::OperationQueue;
use crate::core::constants::{
    DIAGNOSTIC_LOG_EVERY, DIAGNOSTIC_POLL_INTERVAL_MS, DIAGNOSTIC_UUID, HEARTBEAT_INTERVAL_MS,
    HEARTBEAT_NO_OP, HEURISTIC_LOG_EVERY, HEURISTIC_POLL_INTERVAL_MS, HEURISTIC_UUID,
    MAX_CONSECUTIVE_TIMEOUTS, MONITOR_ERROR_DELAY_MS, MONITOR_LOG_EVERY, MONITOR_UUID,
    READ_TIMEOUT_MS, TX_UUID,
};
use crate::core::events::TelemetryChannels;
use crate::model::protocol::{
    parse_diagnostic_packet, parse_heuristic_packet, parse_monitor_packet, HeuristicPacket,
};
use crate::model::telemetry::{MillisClock, WorkoutMetric};
use anyhow::{anyhow, Result};
use btleplug::api::{Characteristic, Peripheral, WriteType};
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

/// Connection-lost callback, injected so the engine never back-references
/// its supervisor.
pub type ConnectionLostCallback = Arc<dyn Fn() + Send + Sync>;

fn characteristic_by_uuid<P: Peripheral>(peripheral: &P, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

#[derive(Default)]
struct TaskSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TaskSlot {
    fn active(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

fn respawn(slot: &StdMutex<TaskSlot>, handle: JoinHandle<()>) {
    let mut slot = slot.lock().unwrap();
    if let Some(old) = slot.handle.take() {
        old.abort();
    }
    slot.generation += 1;
    slot.handle = Some(handle);
}

fn stop(slot: &StdMutex<TaskSlot>) {
    let mut slot = slot.lock().unwrap();
    if let Some(handle) = slot.handle.take() {
        handle.abort();
    }
}

fn slot_active(slot: &StdMutex<TaskSlot>) -> bool {
    slot.lock().unwrap().active()
}

/// Supervises the monitor, diagnostic, heuristic and heartbeat loops for one
/// BLE session. All `start`/`stop` entry points are safe to call from any
/// task.
pub struct PollingEngine {
    queue: Arc<OperationQueue>,
    processor: Arc<StdMutex<MonitorDataProcessor>>,
    detector: Arc<StdMutex<HandleStateDetector>>,
    metrics_tx: broadcast::Sender<WorkoutMetric>,
    heuristics_tx: broadcast::Sender<HeuristicPacket>,
    on_connection_lost: ConnectionLostCallback,
    /// Serializes monitor-loop bodies so at most one monitor loop touches
    /// the peripheral, whatever start/stop interleaving produced it.
    monitor_lock: Arc<Mutex<()>>,
    consecutive_timeouts: Arc<AtomicU32>,
    monitor_slot: Arc<StdMutex<TaskSlot>>,
    diagnostic_slot: Arc<StdMutex<TaskSlot>>,
    heuristic_slot: Arc<StdMutex<TaskSlot>>,
    heartbeat_slot: Arc<StdMutex<TaskSlot>>,
}

impl PollingEngine {
    /// Builds the engine and the processor/detector it owns, wiring their
    /// outputs into the shared telemetry channels.
    pub fn new(
        queue: Arc<OperationQueue>,
        clock: MillisClock,
        channels: &TelemetryChannels,
        on_connection_lost: ConnectionLostCallback,
    ) -> Self {
        let deload_tx = channels.deload_events.clone();
        let rom_tx = channels.rom_violations.clone();
        let processor = MonitorDataProcessor::new(
            clock.clone(),
            Box::new(move || {
                let _ = deload_tx.send(());
            }),
            Box::new(move |violation| {
                let _ = rom_tx.send(violation);
            }),
        );
        let detector = HandleStateDetector::new(
            clock,
            channels.handle_state.clone(),
            channels.handle_detection.clone(),
        );
        Self {
            queue,
            processor: Arc::new(StdMutex::new(processor)),
            detector: Arc::new(StdMutex::new(detector)),
            metrics_tx: channels.metrics.clone(),
            heuristics_tx: channels.heuristics.clone(),
            on_connection_lost,
            monitor_lock: Arc::new(Mutex::new(())),
            consecutive_timeouts: Arc::new(AtomicU32::new(0)),
            monitor_slot: Arc::new(StdMutex::new(TaskSlot::default())),
            diagnostic_slot: Arc::new(StdMutex::new(TaskSlot::default())),
            heuristic_slot: Arc::new(StdMutex::new(TaskSlot::default())),
            heartbeat_slot: Arc::new(StdMutex::new(TaskSlot::default())),
        }
    }

    /// Starts all four loops for a fresh session.
    pub fn start_all<P: Peripheral + 'static>(&self, peripheral: Arc<P>) -> Result<()> {
        self.start_monitor_polling(peripheral.clone(), false)?;
        self.spawn_diagnostic(&peripheral);
        self.spawn_heuristic(&peripheral);
        self.spawn_heartbeat(&peripheral);
        Ok(())
    }

    /// Cancels any running monitor loop, resets the processor for a new
    /// session, optionally arms the detector in auto-start mode, and starts
    /// the monitor loop.
    pub fn start_monitor_polling<P: Peripheral + 'static>(
        &self,
        peripheral: Arc<P>,
        for_auto_start: bool,
    ) -> Result<()> {
        let monitor_char = characteristic_by_uuid(&*peripheral, MONITOR_UUID)
            .ok_or_else(|| anyhow!("device has no monitor characteristic"))?;
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
        self.processor.lock().unwrap().reset_for_new_session();
        if for_auto_start {
            self.detector.lock().unwrap().enable(true);
        }
        respawn(
            &self.monitor_slot,
            tokio::spawn(Self::run_monitor_loop(
                peripheral,
                monitor_char,
                self.queue.clone(),
                self.processor.clone(),
                self.detector.clone(),
                self.metrics_tx.clone(),
                self.monitor_lock.clone(),
                self.consecutive_timeouts.clone(),
                self.on_connection_lost.clone(),
            )),
        );
        Ok(())
    }

    /// Cancels all four loops and resets the per-session counters.
    pub fn stop_all(&self) {
        stop(&self.monitor_slot);
        stop(&self.diagnostic_slot);
        stop(&self.heuristic_slot);
        stop(&self.heartbeat_slot);
        self.consecutive_timeouts.store(0, Ordering::SeqCst);
    }

    /// Cancels only the monitor loop. Diagnostic, heuristic and heartbeat
    /// polling keep running so the link stays alive between sets.
    pub fn stop_monitor_only(&self) {
        stop(&self.monitor_slot);
    }

    /// Restarts the monitor loop unconditionally; the other loops are
    /// started only when their task is no longer active.
    pub fn restart_all<P: Peripheral + 'static>(&self, peripheral: Arc<P>) -> Result<()> {
        self.start_monitor_polling(peripheral.clone(), false)?;
        if !slot_active(&self.diagnostic_slot) {
            self.spawn_diagnostic(&peripheral);
        }
        if !slot_active(&self.heuristic_slot) {
            self.spawn_heuristic(&peripheral);
        }
        if !slot_active(&self.heartbeat_slot) {
            self.spawn_heartbeat(&peripheral);
        }
        Ok(())
    }

    /// Conditionally revives the diagnostic and heartbeat loops; the monitor
    /// loop is untouched.
    pub fn restart_diagnostic_and_heartbeat<P: Peripheral + 'static>(&self, peripheral: Arc<P>) {
        if !slot_active(&self.diagnostic_slot) {
            self.spawn_diagnostic(&peripheral);
        }
        if !slot_active(&self.heartbeat_slot) {
            self.spawn_heartbeat(&peripheral);
        }
    }

    /// Arms the detector for a Just Lift set.
    pub fn enable_just_lift_waiting(&self) {
        self.detector.lock().unwrap().enable_just_lift_waiting();
    }

    /// Disarms the detector, clearing its baselines.
    pub fn disable_detector(&self) {
        self.detector.lock().unwrap().disable();
    }

    pub fn is_auto_start_mode(&self) -> bool {
        self.detector.lock().unwrap().is_auto_start_mode()
    }

    /// Lowest cable position observed this session, either side.
    pub fn min_position_seen(&self) -> Option<f64> {
        self.detector.lock().unwrap().min_position_seen()
    }

    /// Highest cable position observed this session, either side.
    pub fn max_position_seen(&self) -> Option<f64> {
        self.detector.lock().unwrap().max_position_seen()
    }

    /// Observed monitor inter-sample statistics for the current session.
    pub fn poll_rate_stats(&self) -> PollRateStats {
        self.processor.lock().unwrap().poll_rate_stats()
    }

    pub fn monitor_active(&self) -> bool {
        slot_active(&self.monitor_slot)
    }

    pub fn diagnostic_active(&self) -> bool {
        slot_active(&self.diagnostic_slot)
    }

    pub fn heuristic_active(&self) -> bool {
        slot_active(&self.heuristic_slot)
    }

    pub fn heartbeat_active(&self) -> bool {
        slot_active(&self.heartbeat_slot)
    }

    #[cfg(test)]
    fn task_generations(&self) -> (u64, u64, u64, u64) {
        (
            self.monitor_slot.lock().unwrap().generation,
            self.diagnostic_slot.lock().unwrap().generation,
            self.heuristic_slot.lock().unwrap().generation,
            self.heartbeat_slot.lock().unwrap().generation,
        )
    }

    fn spawn_diagnostic<P: Peripheral + 'static>(&self, peripheral: &Arc<P>) {
        match characteristic_by_uuid(&**peripheral, DIAGNOSTIC_UUID) {
            Some(characteristic) => respawn(
                &self.diagnostic_slot,
                tokio::spawn(Self::run_diagnostic_loop(
                    peripheral.clone(),
                    characteristic,
                    self.queue.clone(),
                )),
            ),
            None => warn!("device has no diagnostic characteristic, fault polling disabled"),
        }
    }

    fn spawn_heuristic<P: Peripheral + 'static>(&self, peripheral: &Arc<P>) {
        match characteristic_by_uuid(&**peripheral, HEURISTIC_UUID) {
            Some(characteristic) => respawn(
                &self.heuristic_slot,
                tokio::spawn(Self::run_heuristic_loop(
                    peripheral.clone(),
                    characteristic,
                    self.queue.clone(),
                    self.heuristics_tx.clone(),
                )),
            ),
            None => warn!("device has no heuristic characteristic, force telemetry disabled"),
        }
    }

    fn spawn_heartbeat<P: Peripheral + 'static>(&self, peripheral: &Arc<P>) {
        match characteristic_by_uuid(&**peripheral, TX_UUID) {
            Some(characteristic) => respawn(
                &self.heartbeat_slot,
                tokio::spawn(Self::run_heartbeat_loop(
                    peripheral.clone(),
                    characteristic,
                    self.queue.clone(),
                )),
            ),
            None => warn!("device has no TX characteristic, heartbeat disabled"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_monitor_loop<P: Peripheral>(
        peripheral: Arc<P>,
        characteristic: Characteristic,
        queue: Arc<OperationQueue>,
        processor: Arc<StdMutex<MonitorDataProcessor>>,
        detector: Arc<StdMutex<HandleStateDetector>>,
        metrics_tx: broadcast::Sender<WorkoutMetric>,
        monitor_lock: Arc<Mutex<()>>,
        consecutive_timeouts: Arc<AtomicU32>,
        on_connection_lost: ConnectionLostCallback,
    ) {
        let mut samples: u64 = 0;
        loop {
            // Enter the mutex unconditionally; checking an is-locked flag
            // first races against concurrent start/stop.
            let read_result = {
                let _guard = monitor_lock.lock().await;
                timeout(
                    Duration::from_millis(READ_TIMEOUT_MS),
                    queue.read(|| async { peripheral.read(&characteristic).await }),
                )
                .await
            };

            let bytes = match read_result {
                Err(_) | Ok(Err(btleplug::Error::TimedOut(_))) => {
                    let timeouts = consecutive_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!("monitor read timeout {}/{}", timeouts, MAX_CONSECUTIVE_TIMEOUTS);
                    if timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                        info!("monitor timeouts exhausted, reporting connection lost");
                        (on_connection_lost)();
                        return;
                    }
                    sleep(Duration::from_millis(MONITOR_ERROR_DELAY_MS)).await;
                    continue;
                }
                Ok(Err(e)) => {
                    consecutive_timeouts.store(0, Ordering::SeqCst);
                    debug!("monitor read failed: {}", e);
                    sleep(Duration::from_millis(MONITOR_ERROR_DELAY_MS)).await;
                    continue;
                }
                Ok(Ok(bytes)) => {
                    consecutive_timeouts.store(0, Ordering::SeqCst);
                    bytes
                }
            };

            match parse_monitor_packet(&bytes) {
                None => warn!("dropping malformed monitor packet of {} bytes", bytes.len()),
                Some(packet) => {
                    let metric = processor.lock().unwrap().process(&packet);
                    if let Some(metric) = metric {
                        detector.lock().unwrap().process_metric(&metric);
                        let _ = metrics_tx.send(metric);
                        samples += 1;
                        if samples % MONITOR_LOG_EVERY == 0 {
                            trace!(
                                "monitor sample #{}: pos ({:.1}, {:.1}) mm, load ({:.2}, {:.2}) kg",
                                samples,
                                metric.pos_a_mm,
                                metric.pos_b_mm,
                                metric.load_a_kg,
                                metric.load_b_kg
                            );
                        }
                    }
                }
            }
            // No delay on success; the BLE round trip rate-limits the loop.
        }
    }

    async fn run_diagnostic_loop<P: Peripheral>(
        peripheral: Arc<P>,
        characteristic: Characteristic,
        queue: Arc<OperationQueue>,
    ) {
        let mut reads: u64 = 0;
        let mut last_faults: Vec<u16> = Vec::new();
        loop {
            match queue.read(|| async { peripheral.read(&characteristic).await }).await {
                Ok(bytes) => match parse_diagnostic_packet(&bytes) {
                    Some(packet) => {
                        reads += 1;
                        let faults = packet.active_faults();
                        if faults != last_faults {
                            if packet.has_faults() {
                                warn!("device fault set changed: {:?}", faults);
                            } else {
                                info!("device faults cleared");
                            }
                            last_faults = faults;
                        }
                        if reads % DIAGNOSTIC_LOG_EVERY == 0 {
                            debug!(
                                "diagnostic read #{}: temperatures {:?}",
                                reads, packet.temperatures
                            );
                        }
                    }
                    None => warn!("dropping malformed diagnostic packet of {} bytes", bytes.len()),
                },
                Err(e) => debug!("diagnostic read failed: {}", e),
            }
            sleep(Duration::from_millis(DIAGNOSTIC_POLL_INTERVAL_MS)).await;
        }
    }

    async fn run_heuristic_loop<P: Peripheral>(
        peripheral: Arc<P>,
        characteristic: Characteristic,
        queue: Arc<OperationQueue>,
        heuristics_tx: broadcast::Sender<HeuristicPacket>,
    ) {
        let mut reads: u64 = 0;
        loop {
            match queue.read(|| async { peripheral.read(&characteristic).await }).await {
                Ok(bytes) => {
                    match parse_heuristic_packet(&bytes, OffsetDateTime::now_utc()) {
                        Some(packet) => {
                            reads += 1;
                            let _ = heuristics_tx.send(packet);
                            if reads % HEURISTIC_LOG_EVERY == 0 {
                                trace!(
                                    "heuristic read #{}: peak ({:.2}, {:.2}) kg",
                                    reads,
                                    packet.side_a.peak_concentric_kg,
                                    packet.side_b.peak_concentric_kg
                                );
                            }
                        }
                        None => {
                            warn!("dropping malformed heuristic packet of {} bytes", bytes.len())
                        }
                    }
                }
                Err(e) => debug!("heuristic read failed: {}", e),
            }
            sleep(Duration::from_millis(HEURISTIC_POLL_INTERVAL_MS)).await;
        }
    }

    /// The TX characteristic is typically write-only; the read is attempted
    /// first and the no-op write is the fallback that actually keeps the
    /// link alive.
    async fn run_heartbeat_loop<P: Peripheral>(
        peripheral: Arc<P>,
        characteristic: Characteristic,
        queue: Arc<OperationQueue>,
    ) {
        loop {
            sleep(Duration::from_millis(HEARTBEAT_INTERVAL_MS)).await;
            let read = timeout(
                Duration::from_millis(READ_TIMEOUT_MS),
                queue.read(|| async { peripheral.read(&characteristic).await }),
            )
            .await;
            if !matches!(read, Ok(Ok(_))) {
                if let Err(e) = queue
                    .write_simple(
                        &*peripheral,
                        &characteristic,
                        &HEARTBEAT_NO_OP,
                        WriteType::WithResponse,
                    )
                    .await
                {
                    debug!("heartbeat no-op failed: {}", e);
                }
            }
        }
    }
}
