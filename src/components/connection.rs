//! Connection Supervisor
//!
//! Owns the peripheral handle for a single BLE session: scanning with a
//! trainer name filter, connect and service discovery, post-connect firmware
//! reads, the notification router and the auto-reconnect supervisor. All
//! traffic to the device funnels through the operation queue; all state
//! changes surface on the connection-state watch channel.

use crate::api::controller::{AdapterDiscovery, DisplayName, TrainerControlApi};
use crate::api::model::ConnectionModelApi;
use crate::components::led::DiscoModeCycler;
use crate::components::polling::PollingEngine;
use crate::components::queue::{OperationQueue, DEFAULT_WRITE_RETRIES};
use crate::core::constants::{
    DIAGNOSTIC_UUID, FIRMWARE_REVISION_UUID, HEURISTIC_UUID, MAX_RECONNECT_ATTEMPTS, MONITOR_UUID,
    TX_UUID, VERSION_UUID,
};
use crate::core::events::TelemetryChannels;
use crate::model::protocol::{is_rep_packet_len, parse_rep_packet, RepNotification};
use crate::model::telemetry::{
    monotonic_clock, ConnectionState, HardwareModel, TrainerDevice,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral, ScanFilter, WriteType,
};
use futures::StreamExt;
use log::{debug, info, warn};
use std::fmt::Debug;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

const DEVICE_LIST_REFRESH_SECS: u64 = 5;

/// Everything the LED cycler needs to push bytes at the device without a
/// back-reference to the supervisor.
#[derive(Clone)]
struct CommandSink<P: Peripheral> {
    peripheral: Arc<P>,
    tx_char: Characteristic,
    queue: Arc<OperationQueue>,
}

fn characteristic_by_uuid<P: Peripheral>(peripheral: &P, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

/// Connection lifecycle supervisor for one trainer.
///
/// # Type Parameters
/// - `A`: Bluetooth central, abstracted so tests can substitute mocks
pub struct TrainerConnection<A: Central + DisplayName + AdapterDiscovery<A> + 'static>
where
    A::Peripheral: DisplayName,
{
    channels: Arc<TelemetryChannels>,
    queue: Arc<OperationQueue>,
    engine: Arc<PollingEngine>,
    /// Signalled by the polling engine when monitor timeouts exhaust.
    lost_tx: broadcast::Sender<()>,
    adapter: Option<Arc<A>>,
    devices: Arc<RwLock<Vec<TrainerDevice>>>,
    scanning: bool,
    peri_updater_handle: Option<JoinHandle<Result<()>>>,
    router_handle: Option<JoinHandle<()>>,
    supervisor_handle: Option<JoinHandle<()>>,
    peripheral: Option<Arc<A::Peripheral>>,
    tx_char: Option<Characteristic>,
    command_sink: Arc<StdMutex<Option<CommandSink<A::Peripheral>>>>,
    disco: DiscoModeCycler,
    connected_device: Option<TrainerDevice>,
    firmware_revision: Option<String>,
}

impl<A: Central + DisplayName + AdapterDiscovery<A> + 'static> Drop for TrainerConnection<A>
where
    A::Peripheral: DisplayName,
{
    /// Stops polling and every owned task when the supervisor goes away.
    fn drop(&mut self) {
        self.engine.stop_all();
        for handle in [&self.supervisor_handle, &self.router_handle] {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        if let Some(handle) = &self.peri_updater_handle {
            handle.abort();
        }
    }
}

impl<A: Central + DisplayName + AdapterDiscovery<A> + 'static> Debug for TrainerConnection<A>
where
    A::Peripheral: DisplayName,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerConnection")
            .field("scanning", &self.scanning)
            .field("connected_device", &self.connected_device)
            .field("firmware_revision", &self.firmware_revision)
            .finish()
    }
}

impl<A: Central + DisplayName + AdapterDiscovery<A> + 'static> TrainerConnection<A>
where
    A::Peripheral: DisplayName,
{
    pub fn new(channels: Arc<TelemetryChannels>) -> Self {
        let queue = Arc::new(OperationQueue::new());
        let lost_tx = broadcast::channel(4).0;
        let lost_signal = lost_tx.clone();
        let engine = Arc::new(PollingEngine::new(
            queue.clone(),
            monotonic_clock(),
            &channels,
            Arc::new(move || {
                let _ = lost_signal.send(());
            }),
        ));

        let command_sink: Arc<StdMutex<Option<CommandSink<A::Peripheral>>>> =
            Arc::new(StdMutex::new(None));
        let disco_sink = command_sink.clone();
        let disco = DiscoModeCycler::new(Arc::new(move |bytes: Vec<u8>| {
            let sink = disco_sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                tokio::spawn(async move {
                    if let Err(e) = sink
                        .queue
                        .write(
                            &*sink.peripheral,
                            &sink.tx_char,
                            &bytes,
                            WriteType::WithResponse,
                            DEFAULT_WRITE_RETRIES,
                        )
                        .await
                    {
                        warn!("LED scheme write failed: {}", e);
                    }
                });
            }
            Ok(())
        }));

        Self {
            channels,
            queue,
            engine,
            lost_tx,
            adapter: None,
            devices: Arc::new(RwLock::new(Vec::new())),
            scanning: false,
            peri_updater_handle: None,
            router_handle: None,
            supervisor_handle: None,
            peripheral: None,
            tx_char: None,
            command_sink,
            disco,
            connected_device: None,
            firmware_revision: None,
        }
    }

    pub fn polling_engine(&self) -> &Arc<PollingEngine> {
        &self.engine
    }

    pub fn channels(&self) -> &Arc<TelemetryChannels> {
        &self.channels
    }

    /// Registers the opaque LED scheme commands the cycler steps through.
    pub fn set_led_schemes(&mut self, schemes: Vec<Vec<u8>>) {
        self.disco.set_schemes(schemes);
    }

    /// Sends the next LED scheme command.
    pub fn advance_led_scheme(&mut self) -> Result<()> {
        self.disco.advance()
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.channels.connection_state.borrow() != state {
            self.channels.connection_state.send_replace(state);
        }
    }

    async fn ensure_adapter(&mut self) -> Result<Arc<A>> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = A::discover_adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no Bluetooth adapter available"))?;
        info!("using Bluetooth adapter {}", adapter.get_name().await?);
        let adapter = Arc::new(adapter);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    fn connected_peripheral(&self) -> Result<Arc<A::Peripheral>> {
        self.peripheral
            .clone()
            .ok_or_else(|| anyhow!("no trainer connected"))
    }

    /// Refreshes the discovered-device list while a scan is running. Only
    /// devices with a recognized trainer name prefix are listed.
    async fn run_device_updater(
        adapter: Arc<A>,
        devices: Arc<RwLock<Vec<TrainerDevice>>>,
    ) -> Result<()> {
        loop {
            let peripherals = adapter.peripherals().await?;
            let mut descriptors = Vec::new();
            for peripheral in &peripherals {
                let address = peripheral.address();
                if let Ok(name) = peripheral.get_name().await {
                    if HardwareModel::is_recognized_name(&name) {
                        descriptors.push(TrainerDevice { name, address });
                    }
                }
            }
            descriptors.sort();
            *devices.write().await = descriptors;
            tokio::time::sleep(Duration::from_secs(DEVICE_LIST_REFRESH_SECS)).await;
        }
    }

    /// Routes device-initiated notifications: rep-sized frames become rep
    /// notifications, frames on the polled characteristics are ignored, and
    /// everything else is a command response.
    async fn run_notification_router(
        peripheral: Arc<A::Peripheral>,
        reps_tx: broadcast::Sender<RepNotification>,
        responses_tx: broadcast::Sender<Vec<u8>>,
    ) {
        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("could not open notification stream: {}", e);
                return;
            }
        };
        while let Some(notification) = stream.next().await {
            if is_rep_packet_len(notification.value.len()) {
                if let Some(rep) = parse_rep_packet(&notification.value) {
                    let _ = reps_tx.send(rep);
                    continue;
                }
            }
            let uuid = notification.uuid;
            if uuid == MONITOR_UUID || uuid == DIAGNOSTIC_UUID || uuid == HEURISTIC_UUID {
                continue;
            }
            let _ = responses_tx.send(notification.value);
        }
        warn!("notification stream ended");
    }

    async fn reattach(peripheral: &A::Peripheral) -> Result<()> {
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok(())
    }

    /// Watches for transport disconnects and engine lost signals while
    /// connected, and drives the bounded reconnect policy.
    async fn run_session_supervisor(
        adapter: Arc<A>,
        peripheral: Arc<A::Peripheral>,
        engine: Arc<PollingEngine>,
        state_tx: watch::Sender<ConnectionState>,
        ble_errors: broadcast::Sender<String>,
        mut lost_rx: broadcast::Receiver<()>,
        connected_state: ConnectionState,
    ) {
        let mut events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("could not open adapter event stream: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral.id() => {
                        warn!("transport disconnect from {}", peripheral.address());
                    }
                    Some(_) => continue,
                    None => return,
                },
                lost = lost_rx.recv() => match lost {
                    Ok(()) => info!("monitor loop reported connection lost"),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
            if !state_tx.borrow().is_connected() {
                continue;
            }

            engine.stop_all();
            state_tx.send_replace(ConnectionState::Connecting);
            let mut reconnected = false;
            for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
                match Self::reattach(&peripheral).await {
                    Ok(()) => {
                        if let Err(e) = engine.start_all(peripheral.clone()) {
                            warn!("polling restart after reconnect failed: {}", e);
                        }
                        info!("reconnected to {} on attempt {}", peripheral.address(), attempt);
                        state_tx.send_replace(connected_state.clone());
                        reconnected = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            "reconnect attempt {}/{} failed: {}",
                            attempt, MAX_RECONNECT_ATTEMPTS, e
                        );
                        let _ = ble_errors.send(format!(
                            "reconnect attempt {}/{} failed: {}",
                            attempt, MAX_RECONNECT_ATTEMPTS, e
                        ));
                    }
                }
            }
            if !reconnected {
                let message = "connection lost, reconnect attempts exhausted".to_string();
                let _ = ble_errors.send(message.clone());
                state_tx.send_replace(ConnectionState::Error { message, cause: None });
                return;
            }
        }
    }

    /// Reads a SIG string characteristic through the queue, if present.
    async fn read_string_characteristic(&self, uuid: Uuid) -> Option<String> {
        let peripheral = self.peripheral.clone()?;
        let characteristic = characteristic_by_uuid(&*peripheral, uuid)?;
        match self
            .queue
            .read(|| async { peripheral.read(&characteristic).await })
            .await
        {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).trim().to_string()),
            Err(e) => {
                debug!("string characteristic {} read failed: {}", uuid, e);
                None
            }
        }
    }

    async fn halt_scan(&mut self) {
        if let (true, Some(adapter)) = (self.scanning, self.adapter.as_ref()) {
            if let Err(e) = adapter.stop_scan().await {
                debug!("stop scan failed: {}", e);
            }
        }
        if let Some(handle) = self.peri_updater_handle.take() {
            handle.abort();
        }
        self.scanning = false;
    }
}

#[async_trait]
impl<A: Central + DisplayName + AdapterDiscovery<A> + 'static> TrainerControlApi
    for TrainerConnection<A>
where
    A::Peripheral: DisplayName,
{
    async fn scan(&mut self) -> Result<()> {
        if self.scanning {
            return Err(anyhow!("already scanning"));
        }
        let adapter = self.ensure_adapter().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        self.scanning = true;
        self.set_state(ConnectionState::Scanning);
        if self.peri_updater_handle.is_none() {
            self.peri_updater_handle = Some(tokio::spawn(Self::run_device_updater(
                adapter,
                self.devices.clone(),
            )));
        }
        Ok(())
    }

    async fn stop_scanning(&mut self) -> Result<()> {
        if !self.scanning {
            return Err(anyhow!("stop scan requested but no scan active"));
        }
        self.halt_scan().await;
        if !self.channels.connection_state.borrow().is_connected() {
            self.set_state(ConnectionState::Disconnected);
        }
        Ok(())
    }

    async fn connect(&mut self, address: String) -> Result<()> {
        let adapter = self.ensure_adapter().await?;
        self.halt_scan().await;
        self.set_state(ConnectionState::Connecting);

        let result: Result<()> = async {
            let peripherals = adapter.peripherals().await?;
            let peripheral = peripherals
                .into_iter()
                .find(|p| p.address().to_string() == address)
                .ok_or_else(|| anyhow!("no discovered trainer with address {}", address))?;
            let device_name = peripheral.get_name().await.unwrap_or_else(|_| "unknown".into());
            let hardware_model = HardwareModel::from_device_name(&device_name);

            peripheral.connect().await?;
            peripheral.discover_services().await?;
            let peripheral = Arc::new(peripheral);

            let tx_char = characteristic_by_uuid(&*peripheral, TX_UUID)
                .ok_or_else(|| anyhow!("trainer exposes no TX characteristic"))?;
            self.tx_char = Some(tx_char.clone());
            self.peripheral = Some(peripheral.clone());
            *self.command_sink.lock().unwrap() = Some(CommandSink {
                peripheral: peripheral.clone(),
                tx_char,
                queue: self.queue.clone(),
            });

            // Post-connect configuration. Link priority and MTU are managed
            // by the platform stack; the revision reads double as a link
            // sanity check.
            self.firmware_revision = self.read_string_characteristic(FIRMWARE_REVISION_UUID).await;
            if let Some(rev) = &self.firmware_revision {
                info!("trainer firmware revision {}", rev);
            }
            if let Some(version) = self.read_string_characteristic(VERSION_UUID).await {
                info!("trainer software version {}", version);
            }

            if let Some(monitor_char) = characteristic_by_uuid(&*peripheral, MONITOR_UUID) {
                if let Err(e) = peripheral.subscribe(&monitor_char).await {
                    debug!("monitor subscription failed: {}", e);
                }
            }
            if let Some(handle) = self.router_handle.take() {
                handle.abort();
            }
            self.router_handle = Some(tokio::spawn(Self::run_notification_router(
                peripheral.clone(),
                self.channels.reps.clone(),
                self.channels.command_responses.clone(),
            )));

            self.engine.start_all(peripheral.clone())?;

            let device = TrainerDevice {
                name: device_name.clone(),
                address: peripheral.address(),
            };
            self.connected_device = Some(device.clone());
            let connected_state = ConnectionState::Connected {
                device_name,
                device_address: device.address,
                hardware_model,
            };
            self.set_state(connected_state.clone());

            if let Some(handle) = self.supervisor_handle.take() {
                handle.abort();
            }
            self.supervisor_handle = Some(tokio::spawn(Self::run_session_supervisor(
                adapter.clone(),
                peripheral,
                self.engine.clone(),
                self.channels.connection_state.clone(),
                self.channels.ble_errors.clone(),
                self.lost_tx.subscribe(),
                connected_state,
            )));
            Ok(())
        }
        .await;

        if let Err(e) = &result {
            let message = format!("connect to {} failed", address);
            let _ = self.channels.ble_errors.send(format!("{}: {}", message, e));
            self.set_state(ConnectionState::Error {
                message,
                cause: Some(e.to_string()),
            });
        }
        result
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(handle) = self.supervisor_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.router_handle.take() {
            handle.abort();
        }
        self.engine.stop_all();
        self.engine.disable_detector();
        *self.command_sink.lock().unwrap() = None;
        self.tx_char = None;
        self.connected_device = None;
        self.firmware_revision = None;
        if let Some(peripheral) = self.peripheral.take() {
            if let Err(e) = peripheral.disconnect().await {
                debug!("peripheral disconnect failed: {}", e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send_command(&mut self, bytes: Vec<u8>) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        let tx_char = self
            .tx_char
            .clone()
            .ok_or_else(|| anyhow!("no TX characteristic resolved"))?;
        self.queue
            .write(
                &*peripheral,
                &tx_char,
                &bytes,
                WriteType::WithResponse,
                DEFAULT_WRITE_RETRIES,
            )
            .await?;
        Ok(())
    }

    async fn await_response(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut responses = self.channels.command_responses.subscribe();
        let response = tokio::time::timeout(timeout, responses.recv())
            .await
            .map_err(|_| anyhow!("timed out waiting for device response"))??;
        Ok(response)
    }

    async fn start_monitor_polling(&mut self, auto_start: bool) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        self.engine.start_monitor_polling(peripheral, auto_start)
    }

    async fn stop_monitor_only(&mut self) -> Result<()> {
        self.engine.stop_monitor_only();
        Ok(())
    }

    async fn restart_all(&mut self) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        self.engine.restart_all(peripheral)
    }

    async fn enable_just_lift_waiting(&mut self) -> Result<()> {
        let peripheral = self.connected_peripheral()?;
        self.engine.enable_just_lift_waiting();
        if !self.engine.monitor_active() {
            // detector is already armed; the monitor loop just needs to run
            self.engine.start_monitor_polling(peripheral, false)?;
        }
        Ok(())
    }

    async fn set_last_color_scheme_index(&mut self, index: usize) -> Result<()> {
        self.disco.set_last_color_scheme_index(index);
        Ok(())
    }
}

impl<A: Central + DisplayName + AdapterDiscovery<A> + 'static> ConnectionModelApi
    for TrainerConnection<A>
where
    A::Peripheral: DisplayName,
{
    fn get_devices(&self) -> &Arc<RwLock<Vec<TrainerDevice>>> {
        &self.devices
    }

    fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn get_connection_state(&self) -> ConnectionState {
        self.channels.connection_state.borrow().clone()
    }

    fn get_firmware_revision(&self) -> Option<String> {
        self.firmware_revision.clone()
    }
}

#[async_trait]
impl DisplayName for btleplug::platform::Adapter {
    async fn get_name(&self) -> Result<String> {
        Ok(self.adapter_info().await?)
    }
}

#[async_trait]
impl AdapterDiscovery<btleplug::platform::Adapter> for btleplug::platform::Adapter {
    async fn discover_adapters() -> Result<Vec<btleplug::platform::Adapter>> {
        let manager = btleplug::platform::Manager::new().await?;
        let adapters = manager.adapters().await?;
        Ok(adapters)
    }
}

#[async_trait]
impl DisplayName for btleplug::platform::Peripheral {
    async fn get_name(&self) -> Result<String> {
        if let Some(props) = self.properties().await? {
            if let Some(name) = props.local_name {
                return Ok(name);
            }
        }
        Err(anyhow!("No name found"))
    }
}

/// The production supervisor type, bound to the platform Bluetooth stack.
pub type PlatformTrainerConnection = TrainerConnection<btleplug::platform::Adapter>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::READ_TIMEOUT_MS;
    use btleplug::api::{
        BDAddr, CentralState, CharPropFlags, Descriptor, PeripheralProperties, Service,
        ValueNotification,
    };
    use btleplug::platform::PeripheralId;
    use futures::stream::Stream;
    use mockall::mock;
    use std::collections::BTreeSet;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        Peripheral{}

        impl Clone for Peripheral {
            fn clone(&self) -> Self;
        }

        impl std::fmt::Debug for Peripheral {
            fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
        }

        #[async_trait]
        impl Peripheral for Peripheral {
            fn id(&self) -> PeripheralId;
            fn address(&self) -> BDAddr;
            async fn properties(&self) -> btleplug::Result<Option<PeripheralProperties>>;
            fn services(&self) -> BTreeSet<Service>;
            fn characteristics(&self) -> BTreeSet<Characteristic> {
                self.services()
                    .iter()
                    .flat_map(|service| service.characteristics.clone().into_iter())
                    .collect()
            }
            async fn is_connected(&self) -> btleplug::Result<bool>;
            async fn connect(&self) -> btleplug::Result<()>;
            async fn disconnect(&self) -> btleplug::Result<()>;
            async fn discover_services(&self) -> btleplug::Result<()>;
            async fn write(
                &self,
                characteristic: &Characteristic,
                data: &[u8],
                write_type: WriteType,
            ) -> btleplug::Result<()>;
            async fn read(&self, characteristic: &Characteristic) -> btleplug::Result<Vec<u8>>;
            async fn subscribe(&self, characteristic: &Characteristic) -> btleplug::Result<()>;
            async fn unsubscribe(&self, characteristic: &Characteristic) -> btleplug::Result<()>;
            async fn notifications(&self) -> btleplug::Result<Pin<Box<dyn Stream<Item = ValueNotification> + Send>>>;
            async fn write_descriptor(&self, descriptor: &Descriptor, data: &[u8]) -> btleplug::Result<()>;
            async fn read_descriptor(&self, descriptor: &Descriptor) -> btleplug::Result<Vec<u8>>;
        }

        #[async_trait]
        impl DisplayName for Peripheral {
            async fn get_name(&self) -> Result<String>;
        }
    }

    mock! {
        Adapter{}
        impl Clone for Adapter {
            fn clone(&self) -> Self;
        }

        impl std::fmt::Debug for Adapter {
            fn fmt<'a>(&self, f: &mut std::fmt::Formatter<'a>) -> std::fmt::Result;
        }

        #[async_trait]
        impl DisplayName for Adapter {
            async fn get_name(&self) -> Result<String>;
        }

        #[async_trait]
        impl AdapterDiscovery<MockAdapter> for Adapter {
            async fn discover_adapters() -> Result<Vec<MockAdapter>>;
        }

        #[async_trait]
        impl Central for Adapter {
            type Peripheral = MockPeripheral;

            async fn events(&self) -> btleplug::Result<Pin<Box<dyn Stream<Item = CentralEvent> + Send>>>;

            async fn start_scan(&self, filter: ScanFilter) -> btleplug::Result<()>;

            async fn stop_scan(&self) -> btleplug::Result<()>;

            async fn peripherals(&self) -> btleplug::Result<Vec<MockPeripheral>>;

            async fn peripheral(&self, id: &PeripheralId) -> btleplug::Result<MockPeripheral>;

            async fn add_peripheral(&self, address: &PeripheralId) -> btleplug::Result<MockPeripheral>;

            async fn adapter_info(&self) -> btleplug::Result<String>;

            async fn adapter_state(&self) -> btleplug::Result<CentralState>;
        }
    }

    fn trainer_service() -> BTreeSet<Service> {
        let characteristics = [
            MONITOR_UUID,
            DIAGNOSTIC_UUID,
            HEURISTIC_UUID,
            TX_UUID,
            FIRMWARE_REVISION_UUID,
        ]
        .iter()
        .map(|&uuid| Characteristic {
            uuid,
            service_uuid: Uuid::nil(),
            properties: CharPropFlags::default(),
            descriptors: BTreeSet::new(),
        })
        .collect();
        let mut services = BTreeSet::new();
        services.insert(Service {
            uuid: Uuid::nil(),
            primary: true,
            characteristics,
        });
        services
    }

    fn monitor_packet_bytes() -> Vec<u8> {
        vec![
            0xE8, 0x03, 0x00, 0x00, 0xDC, 0x05, 0x00, 0x00, 0x88, 0x13, 0xC8, 0x05, 0x00, 0x00,
            0x88, 0x13, 0x00, 0x00,
        ]
    }

    /// Healthy trainer peripheral: all reads answered, connect succeeds.
    fn healthy_peripheral(notifications: Vec<ValueNotification>) -> MockPeripheral {
        let mut peripheral = MockPeripheral::new();
        peripheral.expect_address().returning(BDAddr::default);
        peripheral
            .expect_get_name()
            .returning(|| Ok("Vee_Rig".to_string()));
        peripheral.expect_connect().returning(|| Ok(()));
        peripheral.expect_disconnect().returning(|| Ok(()));
        peripheral.expect_discover_services().returning(|| Ok(()));
        peripheral.expect_services().returning(trainer_service);
        peripheral.expect_subscribe().returning(|_| Ok(()));
        peripheral.expect_read().returning(|characteristic| {
            if characteristic.uuid == MONITOR_UUID {
                Ok(monitor_packet_bytes())
            } else if characteristic.uuid == DIAGNOSTIC_UUID {
                Ok(vec![0])
            } else if characteristic.uuid == HEURISTIC_UUID {
                Ok(vec![0u8; 20])
            } else if characteristic.uuid == FIRMWARE_REVISION_UUID {
                Ok(b"2.4.1".to_vec())
            } else {
                Err(btleplug::Error::NotSupported("write-only".into()))
            }
        });
        peripheral.expect_write().returning(|_, _, _| Ok(()));
        peripheral.expect_notifications().return_once(move || {
            Ok(Box::pin(
                futures::stream::iter(notifications).chain(futures::stream::pending()),
            ))
        });
        peripheral
    }

    fn adapter_with_peripheral(
        make_peripheral: impl Fn() -> MockPeripheral + Send + 'static,
    ) -> MockAdapter {
        let mut adapter = MockAdapter::new();
        adapter
            .expect_get_name()
            .returning(|| Ok("MockAdapter".to_string()));
        adapter.expect_start_scan().returning(|_| Ok(()));
        adapter.expect_stop_scan().returning(|| Ok(()));
        adapter
            .expect_events()
            .returning(|| Ok(Box::pin(futures::stream::pending())));
        adapter
            .expect_peripherals()
            .returning(move || Ok(vec![make_peripheral()]));
        adapter
    }

    fn connection_with_adapter(adapter: MockAdapter) -> TrainerConnection<MockAdapter> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut connection = TrainerConnection::new(Arc::new(TelemetryChannels::new()));
        connection.adapter = Some(Arc::new(adapter));
        connection
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let connection = TrainerConnection::<MockAdapter>::new(Arc::new(TelemetryChannels::new()));
        assert_eq!(connection.get_connection_state(), ConnectionState::Disconnected);
        assert!(!connection.is_scanning());
        assert!(connection.get_devices().read().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scan_filters_recognized_trainers() {
        let adapter = adapter_with_peripheral(|| {
            let mut peripheral = MockPeripheral::new();
            peripheral.expect_address().returning(BDAddr::default);
            peripheral
                .expect_get_name()
                .returning(|| Ok("Vee_Rig".to_string()));
            peripheral
        });
        let mut connection = connection_with_adapter(adapter);

        connection.scan().await.unwrap();
        assert!(connection.is_scanning());
        assert_eq!(connection.get_connection_state(), ConnectionState::Scanning);
        // second scan is rejected while the first is active
        assert!(connection.scan().await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let devices = connection.get_devices().read().await.clone();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Vee_Rig");

        connection.stop_scanning().await.unwrap();
        assert!(!connection.is_scanning());
        assert_eq!(connection.get_connection_state(), ConnectionState::Disconnected);
        assert!(connection.stop_scanning().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_reaches_connected_state() {
        let adapter = adapter_with_peripheral(|| healthy_peripheral(Vec::new()));
        let mut connection = connection_with_adapter(adapter);

        connection
            .connect(BDAddr::default().to_string())
            .await
            .unwrap();
        match connection.get_connection_state() {
            ConnectionState::Connected { device_name, hardware_model, .. } => {
                assert_eq!(device_name, "Vee_Rig");
                assert_eq!(hardware_model, HardwareModel::VForm);
            }
            state => panic!("expected Connected, got {:?}", state),
        }
        assert_eq!(connection.get_firmware_revision().as_deref(), Some("2.4.1"));
        assert!(connection.polling_engine().monitor_active());
        assert!(connection.polling_engine().heartbeat_active());

        connection.disconnect().await.unwrap();
        assert_eq!(connection.get_connection_state(), ConnectionState::Disconnected);
        assert!(!connection.polling_engine().monitor_active());
    }

    #[tokio::test]
    async fn test_connect_unknown_address_fails() {
        let adapter = adapter_with_peripheral(|| {
            let mut peripheral = MockPeripheral::new();
            peripheral.expect_address().returning(BDAddr::default);
            peripheral
        });
        let mut connection = connection_with_adapter(adapter);
        let mut errors = connection.channels().subscribe_ble_errors();

        let result = connection.connect("11:22:33:44:55:66".to_string()).await;
        assert!(result.is_err());
        assert!(matches!(
            connection.get_connection_state(),
            ConnectionState::Error { .. }
        ));
        assert!(errors.recv().await.unwrap().contains("11:22:33:44:55:66"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_command_goes_through_queue() {
        let sent = Arc::new(AtomicUsize::new(0));
        let sent_in_mock = sent.clone();
        let adapter = adapter_with_peripheral(move || {
            let mut peripheral = MockPeripheral::new();
            let sent = sent_in_mock.clone();
            peripheral.expect_address().returning(BDAddr::default);
            peripheral
                .expect_get_name()
                .returning(|| Ok("Vee_Rig".to_string()));
            peripheral.expect_connect().returning(|| Ok(()));
            peripheral.expect_discover_services().returning(|| Ok(()));
            peripheral.expect_services().returning(trainer_service);
            peripheral.expect_subscribe().returning(|_| Ok(()));
            peripheral.expect_read().returning(|_| {
                Err(btleplug::Error::NotSupported("quiet".into()))
            });
            peripheral
                .expect_notifications()
                .returning(|| Ok(Box::pin(futures::stream::pending())));
            peripheral.expect_write().returning(move |characteristic, data, write_type| {
                assert_eq!(characteristic.uuid, TX_UUID);
                assert!(matches!(write_type, WriteType::WithResponse));
                if data == [0xA0, 0x01] {
                    sent.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            });
            peripheral
        });
        let mut connection = connection_with_adapter(adapter);

        connection
            .connect(BDAddr::default().to_string())
            .await
            .unwrap();
        connection.send_command(vec![0xA0, 0x01]).await.unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 1);

        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_command_requires_connection() {
        let mut connection =
            TrainerConnection::<MockAdapter>::new(Arc::new(TelemetryChannels::new()));
        assert!(connection.send_command(vec![0x01]).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_notification_router_splits_reps_and_responses() {
        let notifications = vec![
            ValueNotification {
                uuid: MONITOR_UUID,
                value: vec![3, 0, 0b01, 0, 0, 0],
            },
            ValueNotification {
                uuid: TX_UUID,
                value: vec![0xBE, 0xEF],
            },
        ];
        let adapter = adapter_with_peripheral(move || healthy_peripheral(notifications.clone()));
        let mut connection = connection_with_adapter(adapter);
        let mut reps = connection.channels().subscribe_reps();
        let mut responses = connection.channels().subscribe_command_responses();

        connection
            .connect(BDAddr::default().to_string())
            .await
            .unwrap();

        let rep = tokio::time::timeout(Duration::from_millis(500), reps.recv())
            .await
            .expect("rep within deadline")
            .unwrap();
        assert_eq!(rep.rep_count, 3);
        assert_eq!(rep.side_mask, 0b01);

        let response = tokio::time::timeout(Duration::from_millis(500), responses.recv())
            .await
            .expect("response within deadline")
            .unwrap();
        assert_eq!(response, vec![0xBE, 0xEF]);

        connection.disconnect().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_await_response_times_out_without_traffic() {
        let adapter = adapter_with_peripheral(|| healthy_peripheral(Vec::new()));
        let mut connection = connection_with_adapter(adapter);
        connection
            .connect(BDAddr::default().to_string())
            .await
            .unwrap();

        let result = connection.await_response(Duration::from_millis(50)).await;
        assert!(result.is_err());

        connection.disconnect().await.unwrap();
    }

    /// Monitor reads time out until the connection-lost threshold, then the
    /// supervisor reconnects and polling resumes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_auto_reconnect_after_connection_lost() {
        let adapter = adapter_with_peripheral(|| {
            let reads = AtomicUsize::new(0);
            let mut peripheral = MockPeripheral::new();
            peripheral.expect_address().returning(BDAddr::default);
            peripheral
                .expect_get_name()
                .returning(|| Ok("Vee_Rig".to_string()));
            peripheral.expect_connect().returning(|| Ok(()));
            peripheral.expect_discover_services().returning(|| Ok(()));
            peripheral.expect_services().returning(trainer_service);
            peripheral.expect_subscribe().returning(|_| Ok(()));
            peripheral
                .expect_notifications()
                .returning(|| Ok(Box::pin(futures::stream::pending())));
            peripheral.expect_write().returning(|_, _, _| Ok(()));
            peripheral.expect_read().returning(move |characteristic| {
                if characteristic.uuid == MONITOR_UUID {
                    if reads.fetch_add(1, Ordering::SeqCst) < 5 {
                        Err(btleplug::Error::TimedOut(
                            std::time::Duration::from_millis(READ_TIMEOUT_MS),
                        ))
                    } else {
                        Ok(monitor_packet_bytes())
                    }
                } else if characteristic.uuid == FIRMWARE_REVISION_UUID {
                    Ok(b"2.4.1".to_vec())
                } else {
                    Err(btleplug::Error::NotSupported("quiet".into()))
                }
            });
            peripheral
        });
        let mut connection = connection_with_adapter(adapter);

        connection
            .connect(BDAddr::default().to_string())
            .await
            .unwrap();
        assert!(connection.get_connection_state().is_connected());
        let mut states = connection.channels().watch_connection_state();

        // five timeouts (~250 ms) trigger the lost signal; the supervisor
        // reconnects on the first attempt and restarts polling
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        let mut saw_connecting = false;
        while tokio::time::Instant::now() < deadline {
            if states.changed().await.is_err() {
                break;
            }
            let state = states.borrow_and_update().clone();
            if state == ConnectionState::Connecting {
                saw_connecting = true;
            }
            if saw_connecting && state.is_connected() {
                break;
            }
        }
        assert!(saw_connecting, "supervisor should pass through Connecting");
        assert!(connection.get_connection_state().is_connected());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connection.polling_engine().monitor_active());

        connection.disconnect().await.unwrap();
    }

    /// Reconnect attempts exhaust and the terminal error state is emitted.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_exhaustion_surfaces_terminal_error() {
        let adapter = adapter_with_peripheral(|| {
            let connects = AtomicUsize::new(0);
            let mut peripheral = MockPeripheral::new();
            peripheral.expect_address().returning(BDAddr::default);
            peripheral
                .expect_get_name()
                .returning(|| Ok("Vee_Rig".to_string()));
            peripheral.expect_discover_services().returning(|| Ok(()));
            peripheral.expect_services().returning(trainer_service);
            peripheral.expect_subscribe().returning(|_| Ok(()));
            peripheral
                .expect_notifications()
                .returning(|| Ok(Box::pin(futures::stream::pending())));
            peripheral.expect_write().returning(|_, _, _| Ok(()));
            peripheral.expect_connect().returning(move || {
                if connects.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(())
                } else {
                    Err(btleplug::Error::NotConnected)
                }
            });
            peripheral.expect_read().returning(|characteristic| {
                if characteristic.uuid == MONITOR_UUID {
                    Err(btleplug::Error::TimedOut(
                        std::time::Duration::from_millis(READ_TIMEOUT_MS),
                    ))
                } else {
                    Err(btleplug::Error::NotSupported("quiet".into()))
                }
            });
            peripheral
        });
        let mut connection = connection_with_adapter(adapter);
        let mut errors = connection.channels().subscribe_ble_errors();
        let mut states = connection.channels().watch_connection_state();

        connection
            .connect(BDAddr::default().to_string())
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            assert!(tokio::time::Instant::now() < deadline, "no terminal error seen");
            states.changed().await.unwrap();
            let state = states.borrow_and_update().clone();
            if matches!(state, ConnectionState::Error { .. }) {
                break;
            }
        }

        // three attempt warnings plus the terminal message
        let mut messages = Vec::new();
        while let Ok(message) = errors.try_recv() {
            messages.push(message);
        }
        assert_eq!(
            messages.iter().filter(|m| m.contains("failed:")).count(),
            3
        );
        assert!(messages.iter().any(|m| m.contains("exhausted")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enable_just_lift_waiting_arms_and_polls() {
        let adapter = adapter_with_peripheral(|| healthy_peripheral(Vec::new()));
        let mut connection = connection_with_adapter(adapter);
        connection
            .connect(BDAddr::default().to_string())
            .await
            .unwrap();

        connection.stop_monitor_only().await.unwrap();
        assert!(!connection.polling_engine().monitor_active());
        assert!(connection.polling_engine().heartbeat_active());

        connection.enable_just_lift_waiting().await.unwrap();
        assert!(connection.polling_engine().is_auto_start_mode());
        assert!(connection.polling_engine().monitor_active());

        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_last_color_scheme_index_is_safe_without_schemes() {
        let mut connection =
            TrainerConnection::<MockAdapter>::new(Arc::new(TelemetryChannels::new()));
        connection.set_last_color_scheme_index(3).await.unwrap();
        assert!(connection.advance_led_scheme().is_ok());
    }
}
