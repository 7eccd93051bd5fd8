use super::action::SetupAction;
use super::state::{SetupScreen, SetupState, StateField, StateUpdate};
use super::visibility::ControlVisibility;
use obd_gauge_bluetooth::{BluetoothDevice, PairingStatus};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub type ScreenTransitionCallback = Arc<dyn Fn(SetupScreen, SetupScreen) + Send + Sync>;
pub type StateChangeCallback = Arc<dyn Fn(&[StateField]) + Send + Sync>;

/// What happened while the state lock was held, delivered to observers
/// once it is released.
#[derive(Default)]
struct Changes {
    transition: Option<(SetupScreen, SetupScreen)>,
    fields: Vec<StateField>,
}

impl Changes {
    fn record(&mut self, field: Option<StateField>) {
        if let Some(field) = field {
            if !self.fields.contains(&field) {
                self.fields.push(field);
            }
        }
    }

    fn apply(&mut self, state: &mut SetupState, update: StateUpdate) {
        self.record(state.apply(update));
    }
}

/// Single source of truth for the pairing wizard.
///
/// Every read and write goes through one lock. Observers run after the
/// lock is released, on the thread that caused the change.
pub struct SetupStateCoordinator {
    state: Mutex<SetupState>,
    screen_callbacks: Mutex<Vec<ScreenTransitionCallback>>,
    state_callbacks: Mutex<Vec<StateChangeCallback>>,
    visibility: Mutex<ControlVisibility>,
}

impl Default for SetupStateCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(12), ControlVisibility::default())
    }
}

impl SetupStateCoordinator {
    pub fn new(discovery_timeout: Duration, visibility: ControlVisibility) -> Self {
        Self {
            state: Mutex::new(SetupState::new(discovery_timeout)),
            screen_callbacks: Mutex::new(Vec::new()),
            state_callbacks: Mutex::new(Vec::new()),
            visibility: Mutex::new(visibility),
        }
    }

    pub fn get_state(&self) -> SetupState {
        self.state.lock().clone()
    }

    /// Applies the updates atomically and returns the fields whose value
    /// actually changed. Observers are only told when that list is
    /// non-empty.
    pub fn update_state(&self, updates: impl IntoIterator<Item = StateUpdate>) -> Vec<StateField> {
        self.with_state(|state, changes| {
            for update in updates {
                changes.apply(state, update);
            }
            changes.fields.clone()
        })
    }

    /// Like [`update_state`](Self::update_state), but `still_valid` is
    /// checked under the state lock first. Returns `None`, changing
    /// nothing, when it fails.
    pub fn update_state_if(
        &self,
        still_valid: impl FnOnce() -> bool,
        updates: impl IntoIterator<Item = StateUpdate>,
    ) -> Option<Vec<StateField>> {
        self.with_state(|state, changes| {
            if !still_valid() {
                return None;
            }
            for update in updates {
                changes.apply(state, update);
            }
            Some(changes.fields.clone())
        })
    }

    pub fn update(&self, update: StateUpdate) -> bool {
        !self.update_state([update]).is_empty()
    }

    /// Appends a device seen during the running discovery. Returns false
    /// when a device with that MAC is already listed.
    pub fn add_discovered_device(&self, device: BluetoothDevice) -> bool {
        self.add_discovered_device_if(|| true, device)
    }

    /// [`add_discovered_device`](Self::add_discovered_device) guarded by a
    /// check made under the state lock.
    pub fn add_discovered_device_if(
        &self,
        still_valid: impl FnOnce() -> bool,
        device: BluetoothDevice,
    ) -> bool {
        self.with_state(|state, changes| {
            if !still_valid() || state.discovered_devices.contains(&device) {
                return false;
            }
            state.discovered_devices.push(device);
            changes.record(Some(StateField::DiscoveredDevices));
            true
        })
    }

    /// Returns false, without side effects or notifications, when `screen`
    /// is already current.
    pub fn transition_to_screen(&self, screen: SetupScreen) -> bool {
        self.with_state(|state, changes| enter_screen(state, screen, changes))
    }

    pub fn handle_setup_action(&self, action: SetupAction) -> bool {
        debug!("Setup action {}", action);
        self.with_state(|state, changes| match action {
            SetupAction::StartDiscovery => {
                start_discovery(state, changes);
                true
            }
            SetupAction::SelectDevice { device: None } => {
                error!("select_device requires a device");
                false
            }
            SetupAction::SelectDevice {
                device: Some(device),
            } => {
                info!("Selected {} ({})", device.display_name(), device.mac_address);
                changes.apply(state, StateUpdate::SelectedDevice(Some(device)));
                changes.apply(state, StateUpdate::PairingStatus(PairingStatus::Idle));
                changes.apply(state, StateUpdate::ErrorMessage(None));
                enter_screen(state, SetupScreen::Pairing, changes);
                true
            }
            SetupAction::Retry => retry(state, changes),
            SetupAction::Back => {
                let target = back_target(state.current_screen);
                enter_screen(state, target, changes);
                true
            }
            SetupAction::Next => next(state, changes),
            SetupAction::Cancel => {
                reset_discovery(state, changes);
                changes.apply(state, StateUpdate::PairingStatus(PairingStatus::Idle));
                enter_screen(state, SetupScreen::Welcome, changes);
                true
            }
            SetupAction::Complete => {
                complete(state, changes);
                true
            }
        })
    }

    /// Dispatches an action by the name the UI emits.
    pub fn handle_named_action(&self, name: &str, device: Option<BluetoothDevice>) -> bool {
        match SetupAction::from_name(name, device) {
            Some(action) => self.handle_setup_action(action),
            None => {
                warn!("Unknown setup action: {}", name);
                false
            }
        }
    }

    pub fn complete_setup(&self) {
        self.with_state(complete);
    }

    pub fn register_screen_transition_callback(
        &self,
        callback: impl Fn(SetupScreen, SetupScreen) + Send + Sync + 'static,
    ) {
        self.screen_callbacks.lock().push(Arc::new(callback));
    }

    pub fn register_state_change_callback(
        &self,
        callback: impl Fn(&[StateField]) + Send + Sync + 'static,
    ) {
        self.state_callbacks.lock().push(Arc::new(callback));
    }

    pub fn register_interaction(&self) {
        self.visibility.lock().register_interaction();
    }

    /// Opacity for on-screen controls, 0 (hidden) to 255.
    pub fn controls_alpha(&self) -> u8 {
        self.visibility.lock().alpha()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SetupState, &mut Changes) -> R) -> R {
        let mut changes = Changes::default();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut changes)
        };
        self.notify(changes);
        result
    }

    fn notify(&self, changes: Changes) {
        if let Some((old, new)) = changes.transition {
            let callbacks = self.screen_callbacks.lock().clone();
            for callback in callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(old, new))).is_err() {
                    error!("Screen transition callback panicked ({} -> {})", old, new);
                }
            }
        }

        if !changes.fields.is_empty() {
            let callbacks = self.state_callbacks.lock().clone();
            for callback in callbacks {
                if catch_unwind(AssertUnwindSafe(|| callback(&changes.fields))).is_err() {
                    error!("State change callback panicked");
                }
            }
        }
    }
}

fn enter_screen(state: &mut SetupState, screen: SetupScreen, changes: &mut Changes) -> bool {
    let old = state.current_screen;
    if old == screen {
        return false;
    }

    changes.apply(state, StateUpdate::CurrentScreen(screen));
    match screen {
        SetupScreen::Discovery => {
            changes.apply(state, StateUpdate::PairingStatus(PairingStatus::Idle));
        }
        SetupScreen::DeviceList => {
            changes.apply(state, StateUpdate::ScrollOffset(0));
        }
        SetupScreen::Pairing => {
            if state.selected_device.is_none() {
                warn!("Entered pairing without a selected device");
            }
        }
        SetupScreen::Complete => {
            changes.apply(state, StateUpdate::SetupComplete(true));
        }
        _ => {}
    }

    info!("Setup screen {} -> {}", old, screen);
    // A later transition in the same call replaces the new end but keeps
    // the original start.
    let from = changes.transition.map_or(old, |(from, _)| from);
    changes.transition = Some((from, screen));
    true
}

fn reset_discovery(state: &mut SetupState, changes: &mut Changes) {
    changes.apply(state, StateUpdate::DiscoveredDevices(Vec::new()));
    changes.apply(state, StateUpdate::DiscoveryProgress(0.0));
    changes.apply(state, StateUpdate::ErrorMessage(None));
}

fn start_discovery(state: &mut SetupState, changes: &mut Changes) {
    reset_discovery(state, changes);
    enter_screen(state, SetupScreen::Discovery, changes);
}

fn complete(state: &mut SetupState, changes: &mut Changes) {
    changes.apply(state, StateUpdate::SetupComplete(true));
    enter_screen(state, SetupScreen::Complete, changes);
}

fn retry(state: &mut SetupState, changes: &mut Changes) -> bool {
    match state.current_screen {
        SetupScreen::DeviceList | SetupScreen::Discovery => {
            start_discovery(state, changes);
            true
        }
        SetupScreen::Pairing | SetupScreen::Test => {
            if state.selected_device.is_none() {
                error!("Cannot retry {} without a selected device", state.current_screen);
                return false;
            }
            changes.apply(state, StateUpdate::PairingStatus(PairingStatus::Idle));
            changes.apply(state, StateUpdate::ErrorMessage(None));
            true
        }
        screen => {
            warn!("Nothing to retry on {}", screen);
            false
        }
    }
}

fn back_target(screen: SetupScreen) -> SetupScreen {
    match screen {
        SetupScreen::DeviceList => SetupScreen::Discovery,
        SetupScreen::Pairing | SetupScreen::Test => SetupScreen::DeviceList,
        SetupScreen::Complete => SetupScreen::Test,
        _ => SetupScreen::Welcome,
    }
}

fn next(state: &mut SetupState, changes: &mut Changes) -> bool {
    let target = match state.current_screen {
        SetupScreen::Welcome => SetupScreen::Discovery,
        SetupScreen::Discovery if !state.discovered_devices.is_empty() => SetupScreen::DeviceList,
        SetupScreen::DeviceList if state.selected_device.is_some() => SetupScreen::Pairing,
        SetupScreen::Pairing if state.pairing_status == PairingStatus::Success => SetupScreen::Test,
        SetupScreen::Test => {
            complete(state, changes);
            return true;
        }
        screen => {
            warn!("Cannot advance from {} yet", screen);
            return false;
        }
    };
    enter_screen(state, target, changes);
    true
}
