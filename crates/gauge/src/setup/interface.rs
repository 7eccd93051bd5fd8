use super::coordinator::SetupStateCoordinator;
use super::state::StateUpdate;
use obd_gauge_bluetooth::{
    BluetoothCapability, BluetoothDevice, BluetoothError, BluetoothResult, PairingStatus,
};
use obd_gauge_worker::{
    AsyncOperationManager, OperationCallback, OperationId, OperationType, SubmitOptions,
};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub type DeviceFoundCallback = Arc<dyn Fn(&BluetoothDevice) + Send + Sync>;

/// Named bucket holding the one operation whose results still matter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Init,
    Discovery,
    Pairing,
    ConnectionTest,
}

impl Slot {
    pub const ALL: [Slot; 4] = [
        Slot::Init,
        Slot::Discovery,
        Slot::Pairing,
        Slot::ConnectionTest,
    ];
}

#[derive(Debug, Default)]
struct SlotEntry {
    generation: u64,
    operation: Option<OperationId>,
}

enum Readiness {
    Pending,
    Ready(Arc<dyn BluetoothCapability>),
    Failed(String),
}

/// Blocks dependent work until the capability exists or is known to be
/// unavailable.
struct PairingGate {
    readiness: Mutex<Readiness>,
    changed: Condvar,
}

impl PairingGate {
    fn new() -> Self {
        Self {
            readiness: Mutex::new(Readiness::Pending),
            changed: Condvar::new(),
        }
    }

    fn resolve(&self, readiness: Readiness) {
        *self.readiness.lock() = readiness;
        self.changed.notify_all();
    }

    /// Back to pending unless a capability is already available.
    fn reset(&self) {
        let mut readiness = self.readiness.lock();
        if !matches!(*readiness, Readiness::Ready(_)) {
            *readiness = Readiness::Pending;
        }
    }

    fn has_failed(&self) -> bool {
        matches!(*self.readiness.lock(), Readiness::Failed(_))
    }

    fn current(&self) -> Option<Arc<dyn BluetoothCapability>> {
        match &*self.readiness.lock() {
            Readiness::Ready(capability) => Some(capability.clone()),
            _ => None,
        }
    }

    fn wait(&self, timeout: Duration) -> BluetoothResult<Arc<dyn BluetoothCapability>> {
        let deadline = Instant::now() + timeout;
        let mut readiness = self.readiness.lock();
        loop {
            match &*readiness {
                Readiness::Ready(capability) => return Ok(capability.clone()),
                Readiness::Failed(reason) => {
                    return Err(BluetoothError::NotAvailable(reason.clone()))
                }
                Readiness::Pending => {}
            }
            if self.changed.wait_until(&mut readiness, deadline).timed_out() {
                if matches!(*readiness, Readiness::Pending) {
                    // Later callers fail fast instead of waiting again.
                    *readiness = Readiness::Failed("initialisation timed out".to_string());
                    self.changed.notify_all();
                    return Err(BluetoothError::Timeout(
                        "waiting for Bluetooth initialisation".to_string(),
                    ));
                }
            }
        }
    }
}

struct Shared {
    coordinator: Arc<SetupStateCoordinator>,
    gate: PairingGate,
    slots: Mutex<HashMap<Slot, SlotEntry>>,
}

impl Shared {
    fn is_current(&self, slot: Slot, generation: u64) -> bool {
        self.slots
            .lock()
            .get(&slot)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Applies updates only if no newer submission or cancellation has
    /// happened for `slot`.
    /// The generation check runs under the coordinator's lock, so a
    /// concurrent cancel either lands after the update or discards it.
    fn apply(&self, slot: Slot, generation: u64, updates: Vec<StateUpdate>) -> bool {
        let applied = self
            .coordinator
            .update_state_if(|| self.is_current(slot, generation), updates)
            .is_some();
        if !applied {
            debug!("Discarding stale {:?} update (generation {})", slot, generation);
        }
        applied
    }

    fn fail(&self, slot: Slot, generation: u64, error: &BluetoothError) {
        warn!("{:?} failed: {}", slot, error);
        self.apply(
            slot,
            generation,
            vec![
                StateUpdate::PairingStatus(PairingStatus::Failed),
                StateUpdate::ErrorMessage(Some(error.user_message().to_string())),
            ],
        );
    }

    /// Starts a new generation for `slot`, returning it with the id of the
    /// operation it supersedes.
    fn claim(&self, slot: Slot) -> (u64, Option<OperationId>) {
        let mut slots = self.slots.lock();
        let entry = slots.entry(slot).or_default();
        entry.generation += 1;
        (entry.generation, entry.operation.take())
    }

    fn record(&self, slot: Slot, generation: u64, id: OperationId) {
        let mut slots = self.slots.lock();
        let entry = slots.entry(slot).or_default();
        if entry.generation == generation {
            entry.operation = Some(id);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveProgress {
    pub has_active_operations: bool,
    pub progress: f32,
    pub message: String,
    pub operation_type: Option<OperationType>,
}

impl ActiveProgress {
    fn idle() -> Self {
        Self {
            has_active_operations: false,
            progress: 0.0,
            message: String::new(),
            operation_type: None,
        }
    }
}

/// Runs the long Bluetooth operations on the worker pool and folds their
/// outcomes into the setup state.
///
/// Each operation belongs to a [`Slot`]. Submitting to a slot supersedes
/// whatever ran there before: the old operation is cancelled if it has not
/// started, and its results are discarded if it has.
pub struct BluetoothSetupInterface {
    manager: Arc<AsyncOperationManager>,
    shared: Arc<Shared>,
    init_timeout: Duration,
}

impl BluetoothSetupInterface {
    pub fn new(
        manager: Arc<AsyncOperationManager>,
        coordinator: Arc<SetupStateCoordinator>,
        init_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            shared: Arc::new(Shared {
                coordinator,
                gate: PairingGate::new(),
                slots: Mutex::new(HashMap::new()),
            }),
            init_timeout,
        }
    }

    /// Builds the capability on a worker, since probing the controller
    /// can block for seconds.
    pub fn initialize<F>(&self, factory: F) -> OperationId
    where
        F: FnOnce() -> BluetoothResult<Arc<dyn BluetoothCapability>> + Send + 'static,
    {
        let shared = self.shared.clone();
        let (generation, previous) = shared.claim(Slot::Init);
        if let Some(previous) = previous {
            self.manager.cancel_operation(previous);
        }
        shared.gate.reset();
        let task_shared = shared.clone();

        let id = self
            .manager
            .submit_operation(OperationType::BluetoothInit, move |reporter| {
                reporter.report(0.1, "Starting Bluetooth");
                match factory() {
                    Ok(capability) => {
                        task_shared.gate.resolve(Readiness::Ready(capability));
                        info!("Bluetooth capability ready");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Bluetooth unavailable: {}", e);
                        task_shared.gate.resolve(Readiness::Failed(e.to_string()));
                        task_shared.apply(
                            Slot::Init,
                            generation,
                            vec![StateUpdate::ErrorMessage(Some(
                                e.user_message().to_string(),
                            ))],
                        );
                        Err(e.into())
                    }
                }
            });
        shared.record(Slot::Init, generation, id);
        id
    }

    /// True once initialisation failed, timed out or was cancelled.
    pub fn needs_initialization(&self) -> bool {
        self.shared.gate.has_failed()
    }

    /// Waits up to the init timeout for the capability. Fails immediately
    /// once initialisation is known to have failed.
    pub fn ensure_pairing_initialized(&self) -> BluetoothResult<Arc<dyn BluetoothCapability>> {
        self.shared.gate.wait(self.init_timeout)
    }

    pub fn slot_operation(&self, slot: Slot) -> Option<OperationId> {
        self.shared
            .slots
            .lock()
            .get(&slot)
            .and_then(|entry| entry.operation)
    }

    fn supersede(&self, slot: Slot) -> u64 {
        let (generation, previous) = self.shared.claim(slot);
        if let Some(previous) = previous {
            if self.manager.cancel_operation(previous) {
                debug!("Cancelled queued {:?} operation {}", slot, previous);
            }
        }
        generation
    }

    fn options(progress_callback: Option<OperationCallback>, device: &str) -> SubmitOptions {
        SubmitOptions {
            callback: progress_callback,
            ..SubmitOptions::default()
        }
        .metadata("device", device)
    }

    pub fn start_discovery(
        &self,
        progress_callback: Option<OperationCallback>,
        device_found_callback: Option<DeviceFoundCallback>,
        show_all_devices: bool,
    ) -> OperationId {
        let generation = self.supersede(Slot::Discovery);
        let shared = self.shared.clone();
        let init_timeout = self.init_timeout;
        let scan_timeout = shared.coordinator.get_state().discovery_timeout;
        let options = SubmitOptions {
            callback: progress_callback,
            ..SubmitOptions::default()
        };

        let task_shared = shared.clone();
        let id = self.manager.submit_operation_with(
            OperationType::DeviceDiscovery,
            options,
            move |reporter| {
                let shared = task_shared;
                let capability = match shared.gate.wait(init_timeout) {
                    Ok(capability) => capability,
                    Err(e) => {
                        shared.fail(Slot::Discovery, generation, &e);
                        return Err(e.into());
                    }
                };

                shared.apply(
                    Slot::Discovery,
                    generation,
                    vec![
                        StateUpdate::PairingStatus(PairingStatus::Discovering),
                        StateUpdate::DiscoveredDevices(Vec::new()),
                        StateUpdate::DiscoveryProgress(0.0),
                        StateUpdate::ErrorMessage(None),
                    ],
                );
                reporter.report(0.0, "Searching for adapters");

                let progress = |fraction: f32| {
                    reporter.report(fraction, "Searching for adapters");
                    shared.apply(
                        Slot::Discovery,
                        generation,
                        vec![StateUpdate::DiscoveryProgress(fraction)],
                    );
                };
                let found = |device: &BluetoothDevice| {
                    shared.coordinator.add_discovered_device_if(
                        || shared.is_current(Slot::Discovery, generation),
                        device.clone(),
                    );
                    if let Some(callback) = &device_found_callback {
                        callback(device);
                    }
                };

                match capability.discover_devices(scan_timeout, &progress, &found, show_all_devices)
                {
                    Ok(devices) => {
                        info!("Discovery found {} devices", devices.len());
                        reporter.report(1.0, format!("Found {} devices", devices.len()));
                        shared.apply(
                            Slot::Discovery,
                            generation,
                            vec![
                                StateUpdate::DiscoveredDevices(devices.clone()),
                                StateUpdate::DiscoveryProgress(1.0),
                                StateUpdate::PairingStatus(PairingStatus::Idle),
                            ],
                        );
                        Ok(devices)
                    }
                    Err(e) => {
                        shared.fail(Slot::Discovery, generation, &e);
                        Err(e.into())
                    }
                }
            },
        );
        shared.record(Slot::Discovery, generation, id);
        id
    }

    pub fn start_pairing(
        &self,
        device: BluetoothDevice,
        progress_callback: Option<OperationCallback>,
    ) -> OperationId {
        let generation = self.supersede(Slot::Pairing);
        let shared = self.shared.clone();
        let init_timeout = self.init_timeout;
        let options = Self::options(progress_callback, &device.mac_address);

        let task_shared = shared.clone();
        let id = self.manager.submit_operation_with(
            OperationType::DevicePairing,
            options,
            move |reporter| {
                let shared = task_shared;
                let capability = match shared.gate.wait(init_timeout) {
                    Ok(capability) => capability,
                    Err(e) => {
                        shared.fail(Slot::Pairing, generation, &e);
                        return Err(e.into());
                    }
                };

                shared.apply(
                    Slot::Pairing,
                    generation,
                    vec![
                        StateUpdate::PairingStatus(PairingStatus::Connecting),
                        StateUpdate::ErrorMessage(None),
                    ],
                );

                let status = |status: PairingStatus, message: &str| {
                    reporter.report(pairing_progress(status), message);
                    shared.apply(
                        Slot::Pairing,
                        generation,
                        vec![StateUpdate::PairingStatus(status)],
                    );
                };

                match capability.pair_device(&device, &status) {
                    Ok(true) => {
                        info!("Paired with {}", device.mac_address);
                        let mut paired = device;
                        paired.is_paired = true;
                        shared.apply(
                            Slot::Pairing,
                            generation,
                            vec![
                                StateUpdate::SelectedDevice(Some(paired)),
                                StateUpdate::PairingStatus(PairingStatus::Success),
                            ],
                        );
                        Ok(true)
                    }
                    Ok(false) => {
                        warn!("Pairing with {} was rejected", device.mac_address);
                        shared.apply(
                            Slot::Pairing,
                            generation,
                            vec![
                                StateUpdate::PairingStatus(PairingStatus::Failed),
                                StateUpdate::ErrorMessage(Some(
                                    "Pairing was rejected. Check the PIN.".to_string(),
                                )),
                            ],
                        );
                        Ok(false)
                    }
                    Err(e) => {
                        shared.fail(Slot::Pairing, generation, &e);
                        Err(e.into())
                    }
                }
            },
        );
        shared.record(Slot::Pairing, generation, id);
        id
    }

    pub fn start_connection_test(
        &self,
        device: BluetoothDevice,
        progress_callback: Option<OperationCallback>,
    ) -> OperationId {
        let generation = self.supersede(Slot::ConnectionTest);
        let shared = self.shared.clone();
        let init_timeout = self.init_timeout;
        let options = Self::options(progress_callback, &device.mac_address);

        let task_shared = shared.clone();
        let id = self.manager.submit_operation_with(
            OperationType::ObdConnectionTest,
            options,
            move |reporter| {
                let shared = task_shared;
                let capability = match shared.gate.wait(init_timeout) {
                    Ok(capability) => capability,
                    Err(e) => {
                        shared.fail(Slot::ConnectionTest, generation, &e);
                        return Err(e.into());
                    }
                };

                shared.apply(
                    Slot::ConnectionTest,
                    generation,
                    vec![
                        StateUpdate::PairingStatus(PairingStatus::Testing),
                        StateUpdate::ErrorMessage(None),
                    ],
                );

                let step = Cell::new(0.0f32);
                let status = |message: &str| {
                    step.set((step.get() + 0.2).min(0.9));
                    reporter.report(step.get(), message);
                };

                match capability.test_obd_connection(&device, &status) {
                    Ok(true) => {
                        info!("{} answered as an OBD adapter", device.mac_address);
                        let mut verified = device;
                        verified.connection_verified = true;
                        shared.apply(
                            Slot::ConnectionTest,
                            generation,
                            vec![
                                StateUpdate::SelectedDevice(Some(verified)),
                                StateUpdate::PairingStatus(PairingStatus::Success),
                            ],
                        );
                        Ok(true)
                    }
                    Ok(false) => {
                        shared.apply(
                            Slot::ConnectionTest,
                            generation,
                            vec![
                                StateUpdate::PairingStatus(PairingStatus::Failed),
                                StateUpdate::ErrorMessage(Some(
                                    BluetoothError::Protocol(String::new())
                                        .user_message()
                                        .to_string(),
                                )),
                            ],
                        );
                        Ok(false)
                    }
                    Err(e) => {
                        shared.fail(Slot::ConnectionTest, generation, &e);
                        Err(e.into())
                    }
                }
            },
        );
        shared.record(Slot::ConnectionTest, generation, id);
        id
    }

    /// Supersedes every slot, cancels whatever is still queued and asks the
    /// capability to abort its own scan or pairing.
    pub fn cancel_operations(&self) {
        for slot in Slot::ALL {
            let (_, previous) = self.shared.claim(slot);
            let Some(id) = previous else {
                continue;
            };
            if self.manager.cancel_operation(id) {
                debug!("Cancelled queued {:?} operation {}", slot, id);
                if slot == Slot::Init {
                    self.shared
                        .gate
                        .resolve(Readiness::Failed("initialisation cancelled".to_string()));
                }
            }
        }

        if let Some(capability) = self.shared.gate.current() {
            capability.cancel_discovery();
            capability.cancel_pairing();
        }

        let coordinator = &self.shared.coordinator;
        if coordinator.get_state().pairing_status.is_busy() {
            coordinator.update(StateUpdate::PairingStatus(PairingStatus::Idle));
        }
    }

    /// Progress of the first active slot, in slot order.
    pub fn get_active_operation_progress(&self) -> ActiveProgress {
        for slot in Slot::ALL {
            let Some(id) = self.slot_operation(slot) else {
                continue;
            };
            let Some(op) = self.manager.get_operation_status(id) else {
                continue;
            };
            if op.status.is_active() {
                return ActiveProgress {
                    has_active_operations: true,
                    progress: op.progress,
                    message: op.progress_message().unwrap_or_default().to_string(),
                    operation_type: Some(op.operation_type),
                };
            }
        }
        ActiveProgress::idle()
    }
}

fn pairing_progress(status: PairingStatus) -> f32 {
    match status {
        PairingStatus::Idle | PairingStatus::Discovering => 0.1,
        PairingStatus::Connecting => 0.3,
        PairingStatus::Testing => 0.7,
        PairingStatus::Success | PairingStatus::Failed => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::SetupScreen;
    use obd_gauge_worker::{AsyncOperation, OperationStatus, WorkerConfig};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeBluetooth {
        devices: Vec<BluetoothDevice>,
        scan_time: Duration,
        accept_pairing: bool,
        obd_answers: bool,
        scans: AtomicUsize,
        discovery_cancelled: AtomicBool,
    }

    impl Default for FakeBluetooth {
        fn default() -> Self {
            Self {
                devices: vec![
                    BluetoothDevice::new("00:1D:A5:68:98:8B", "OBDII").with_signal_strength(-50),
                    BluetoothDevice::new("98:D3:31:F5:2A:11", "HC-05").with_signal_strength(-70),
                ],
                scan_time: Duration::from_millis(20),
                accept_pairing: true,
                obd_answers: true,
                scans: AtomicUsize::new(0),
                discovery_cancelled: AtomicBool::new(false),
            }
        }
    }

    impl BluetoothCapability for FakeBluetooth {
        fn discover_devices(
            &self,
            _timeout: Duration,
            progress: &dyn Fn(f32),
            device_found: &dyn Fn(&BluetoothDevice),
            _show_all_devices: bool,
        ) -> BluetoothResult<Vec<BluetoothDevice>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            progress(0.5);
            for device in &self.devices {
                device_found(device);
            }
            std::thread::sleep(self.scan_time);
            if self.discovery_cancelled.load(Ordering::SeqCst) {
                return Err(BluetoothError::Cancelled);
            }
            progress(1.0);
            Ok(self.devices.clone())
        }

        fn pair_device(
            &self,
            _device: &BluetoothDevice,
            status: &dyn Fn(PairingStatus, &str),
        ) -> BluetoothResult<bool> {
            status(PairingStatus::Connecting, "Sending PIN");
            status(PairingStatus::Testing, "Trusting device");
            Ok(self.accept_pairing)
        }

        fn test_obd_connection(
            &self,
            _device: &BluetoothDevice,
            status: &dyn Fn(&str),
        ) -> BluetoothResult<bool> {
            status("Resetting adapter");
            Ok(self.obd_answers)
        }

        fn cancel_discovery(&self) {
            self.discovery_cancelled.store(true, Ordering::SeqCst);
        }

        fn cancel_pairing(&self) {}
    }

    struct Harness {
        manager: Arc<AsyncOperationManager>,
        coordinator: Arc<SetupStateCoordinator>,
        bluetooth: BluetoothSetupInterface,
    }

    impl Harness {
        fn new(init_timeout: Duration) -> Self {
            let manager = Arc::new(AsyncOperationManager::new(WorkerConfig {
                max_workers: 2,
                join_timeout_ms: 1_000,
                poll_interval_ms: 20,
            }));
            manager.start().expect("start workers");
            let coordinator = Arc::new(SetupStateCoordinator::default());
            let bluetooth =
                BluetoothSetupInterface::new(manager.clone(), coordinator.clone(), init_timeout);
            Self {
                manager,
                coordinator,
                bluetooth,
            }
        }

        fn with_fake(fake: Arc<FakeBluetooth>) -> Self {
            let harness = Self::new(Duration::from_secs(2));
            harness
                .bluetooth
                .initialize(move || Ok(fake as Arc<dyn BluetoothCapability>));
            harness
        }

        fn wait_terminal(&self, id: OperationId) -> AsyncOperation {
            let deadline = Instant::now() + Duration::from_secs(3);
            loop {
                if let Some(op) = self.manager.get_operation_status(id) {
                    if op.is_terminal() {
                        return op;
                    }
                }
                assert!(Instant::now() < deadline, "operation {id} never finished");
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.manager.stop();
        }
    }

    #[test]
    fn discovery_fills_state_and_reports_devices() {
        let fake = Arc::new(FakeBluetooth::default());
        let harness = Harness::with_fake(fake);

        let found = Arc::new(AtomicUsize::new(0));
        let terminal = Arc::new(Mutex::new(Vec::new()));
        let f = found.clone();
        let t = terminal.clone();
        let callback: OperationCallback = Arc::new(move |op: &AsyncOperation| {
            if op.is_terminal() {
                t.lock().push(op.status);
            }
        });

        let id = harness.bluetooth.start_discovery(
            Some(callback),
            Some(Arc::new(move |_: &BluetoothDevice| {
                f.fetch_add(1, Ordering::SeqCst);
            })),
            false,
        );
        let op = harness.wait_terminal(id);

        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.result_as::<Vec<BluetoothDevice>>().map(Vec::len), Some(2));
        assert_eq!(found.load(Ordering::SeqCst), 2);
        assert_eq!(*terminal.lock(), vec![OperationStatus::Completed]);

        let state = harness.coordinator.get_state();
        assert_eq!(state.discovered_devices.len(), 2);
        assert_eq!(state.pairing_status, PairingStatus::Idle);
        assert_eq!(state.discovery_progress, 1.0);
    }

    #[test]
    fn second_discovery_supersedes_first() {
        let fake = Arc::new(FakeBluetooth {
            scan_time: Duration::from_millis(50),
            ..FakeBluetooth::default()
        });
        let harness = Harness::with_fake(fake);

        let first = harness.bluetooth.start_discovery(None, None, false);
        let second = harness.bluetooth.start_discovery(None, None, false);

        assert_ne!(first, second);
        assert_eq!(harness.bluetooth.slot_operation(Slot::Discovery), Some(second));

        harness.wait_terminal(first);
        assert_eq!(harness.wait_terminal(second).status, OperationStatus::Completed);

        let state = harness.coordinator.get_state();
        assert_eq!(state.discovered_devices.len(), 2);
        assert_eq!(state.pairing_status, PairingStatus::Idle);
    }

    #[test]
    fn failed_initialisation_fails_fast() {
        let harness = Harness::new(Duration::from_secs(30));
        let init = harness.bluetooth.initialize(|| {
            Err(BluetoothError::NotAvailable("no controller".to_string()))
        });
        assert_eq!(harness.wait_terminal(init).status, OperationStatus::Failed);

        let started = Instant::now();
        let id = harness.bluetooth.start_discovery(None, None, false);
        let op = harness.wait_terminal(id);

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(op.status, OperationStatus::Failed);
        let error = op.error.as_ref().expect("error recorded");
        assert!(matches!(
            error.downcast_ref::<BluetoothError>(),
            Some(BluetoothError::NotAvailable(_))
        ));

        let state = harness.coordinator.get_state();
        assert_eq!(state.pairing_status, PairingStatus::Failed);
        assert!(state.error_message.is_some());
    }

    #[test]
    fn readiness_wait_times_out_then_degrades() {
        let harness = Harness::new(Duration::from_millis(50));

        let first = harness.bluetooth.start_discovery(None, None, false);
        let op = harness.wait_terminal(first);
        assert!(matches!(
            op.error.as_ref().and_then(|e| e.downcast_ref::<BluetoothError>()),
            Some(BluetoothError::Timeout(_))
        ));

        assert!(matches!(
            harness.bluetooth.ensure_pairing_initialized(),
            Err(BluetoothError::NotAvailable(_))
        ));
    }

    #[test]
    fn gate_timeout_wakes_other_waiters() {
        let gate = Arc::new(PairingGate::new());
        let waiter = gate.clone();
        let long = std::thread::spawn(move || {
            let started = Instant::now();
            let failed = waiter.wait(Duration::from_secs(10)).is_err();
            (started.elapsed(), failed)
        });
        std::thread::sleep(Duration::from_millis(20));

        assert!(matches!(
            gate.wait(Duration::from_millis(50)),
            Err(BluetoothError::Timeout(_))
        ));
        let (elapsed, failed) = long.join().expect("waiter thread");
        assert!(failed);
        assert!(elapsed < Duration::from_secs(5), "waiter slept {elapsed:?}");
    }

    #[test]
    fn initialising_again_recovers_from_failure() {
        let harness = Harness::new(Duration::from_secs(2));
        let failed = harness.bluetooth.initialize(|| {
            Err(BluetoothError::NotAvailable("no controller".to_string()))
        });
        harness.wait_terminal(failed);
        assert!(harness.bluetooth.needs_initialization());

        let fake = Arc::new(FakeBluetooth::default());
        let retried = harness
            .bluetooth
            .initialize(move || Ok(fake as Arc<dyn BluetoothCapability>));
        assert!(!harness.bluetooth.needs_initialization());
        assert_eq!(harness.wait_terminal(retried).status, OperationStatus::Completed);

        let id = harness.bluetooth.start_discovery(None, None, false);
        assert_eq!(harness.wait_terminal(id).status, OperationStatus::Completed);
    }

    #[test]
    fn update_from_cancelled_generation_is_discarded() {
        let harness = Harness::new(Duration::from_millis(50));
        let shared = harness.bluetooth.shared.clone();
        let (stale, _) = shared.claim(Slot::Discovery);

        harness.bluetooth.cancel_operations();
        assert!(!shared.apply(
            Slot::Discovery,
            stale,
            vec![StateUpdate::PairingStatus(PairingStatus::Discovering)],
        ));
        shared.fail(Slot::Discovery, stale, &BluetoothError::Cancelled);

        let state = harness.coordinator.get_state();
        assert_eq!(state.pairing_status, PairingStatus::Idle);
        assert_eq!(state.error_message, None);

        let (current, _) = shared.claim(Slot::Discovery);
        assert!(shared.apply(
            Slot::Discovery,
            current,
            vec![StateUpdate::PairingStatus(PairingStatus::Discovering)],
        ));
    }

    #[test]
    fn pairing_success_marks_device_paired() {
        let harness = Harness::with_fake(Arc::new(FakeBluetooth::default()));
        let device = BluetoothDevice::new("00:1D:A5:68:98:8B", "OBDII");
        harness
            .coordinator
            .handle_setup_action(crate::setup::SetupAction::SelectDevice {
                device: Some(device.clone()),
            });

        let id = harness.bluetooth.start_pairing(device, None);
        let op = harness.wait_terminal(id);

        assert_eq!(op.result_as::<bool>(), Some(&true));
        assert_eq!(op.metadata.get("device").map(String::as_str), Some("00:1D:A5:68:98:8B"));
        let state = harness.coordinator.get_state();
        assert_eq!(state.current_screen, SetupScreen::Pairing);
        assert_eq!(state.pairing_status, PairingStatus::Success);
        assert!(state.selected_device.is_some_and(|d| d.is_paired));
    }

    #[test]
    fn rejected_pairing_records_error() {
        let fake = Arc::new(FakeBluetooth {
            accept_pairing: false,
            ..FakeBluetooth::default()
        });
        let harness = Harness::with_fake(fake);

        let id = harness
            .bluetooth
            .start_pairing(BluetoothDevice::new("00:1D:A5:68:98:8B", "OBDII"), None);
        assert_eq!(harness.wait_terminal(id).result_as::<bool>(), Some(&false));

        let state = harness.coordinator.get_state();
        assert_eq!(state.pairing_status, PairingStatus::Failed);
        assert!(state.error_message.is_some());
    }

    #[test]
    fn connection_test_verifies_device() {
        let harness = Harness::with_fake(Arc::new(FakeBluetooth::default()));
        let device = BluetoothDevice::new("00:1D:A5:68:98:8B", "OBDII");

        let id = harness.bluetooth.start_connection_test(device, None);
        let op = harness.wait_terminal(id);

        assert_eq!(op.operation_type, OperationType::ObdConnectionTest);
        assert_eq!(op.result_as::<bool>(), Some(&true));
        let state = harness.coordinator.get_state();
        assert_eq!(state.pairing_status, PairingStatus::Success);
        assert!(state.selected_device.is_some_and(|d| d.connection_verified));
    }

    #[test]
    fn cancel_discards_running_discovery() {
        let fake = Arc::new(FakeBluetooth {
            scan_time: Duration::from_millis(200),
            ..FakeBluetooth::default()
        });
        let harness = Harness::with_fake(fake.clone());

        let id = harness.bluetooth.start_discovery(None, None, false);
        let deadline = Instant::now() + Duration::from_secs(2);
        while fake.scans.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "scan never started");
            std::thread::sleep(Duration::from_millis(5));
        }

        harness.bluetooth.cancel_operations();
        assert!(fake.discovery_cancelled.load(Ordering::SeqCst));
        assert_eq!(harness.bluetooth.slot_operation(Slot::Discovery), None);

        harness.wait_terminal(id);
        let state = harness.coordinator.get_state();
        assert_eq!(state.pairing_status, PairingStatus::Idle);
        assert_ne!(state.error_message.as_deref(), Some(BluetoothError::Cancelled.user_message()));
    }

    #[test]
    fn active_progress_follows_running_slot() {
        let fake = Arc::new(FakeBluetooth {
            scan_time: Duration::from_millis(200),
            ..FakeBluetooth::default()
        });
        let harness = Harness::with_fake(fake);
        harness.wait_terminal(
            harness
                .bluetooth
                .slot_operation(Slot::Init)
                .expect("init tracked"),
        );
        assert!(!harness.bluetooth.get_active_operation_progress().has_active_operations);

        let id = harness.bluetooth.start_discovery(None, None, false);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let progress = harness.bluetooth.get_active_operation_progress();
            if progress.progress > 0.0 {
                assert!(progress.has_active_operations);
                assert_eq!(progress.operation_type, Some(OperationType::DeviceDiscovery));
                assert_eq!(progress.message, "Searching for adapters");
                break;
            }
            assert!(Instant::now() < deadline, "no progress observed");
            std::thread::sleep(Duration::from_millis(5));
        }

        harness.wait_terminal(id);
        assert_eq!(
            harness.bluetooth.get_active_operation_progress(),
            ActiveProgress::idle()
        );
    }
}
