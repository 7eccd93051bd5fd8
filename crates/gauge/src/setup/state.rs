use obd_gauge_bluetooth::{BluetoothDevice, PairingStatus};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupScreen {
    Welcome,
    Discovery,
    DeviceList,
    Pairing,
    Test,
    Complete,
    CurrentDevice,
    DeviceManagement,
    Confirmation,
}

impl SetupScreen {
    pub fn title(&self) -> &'static str {
        match self {
            SetupScreen::Welcome => "Welcome",
            SetupScreen::Discovery => "Searching",
            SetupScreen::DeviceList => "Select Adapter",
            SetupScreen::Pairing => "Pairing",
            SetupScreen::Test => "Testing",
            SetupScreen::Complete => "Ready",
            SetupScreen::CurrentDevice => "Current Adapter",
            SetupScreen::DeviceManagement => "Manage Adapters",
            SetupScreen::Confirmation => "Confirm",
        }
    }
}

impl fmt::Display for SetupScreen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupScreen::Welcome => "WELCOME",
            SetupScreen::Discovery => "DISCOVERY",
            SetupScreen::DeviceList => "DEVICE_LIST",
            SetupScreen::Pairing => "PAIRING",
            SetupScreen::Test => "TEST",
            SetupScreen::Complete => "COMPLETE",
            SetupScreen::CurrentDevice => "CURRENT_DEVICE",
            SetupScreen::DeviceManagement => "DEVICE_MANAGEMENT",
            SetupScreen::Confirmation => "CONFIRMATION",
        };
        f.write_str(name)
    }
}

/// Wizard progress. Only the coordinator mutates it; everyone else works
/// on snapshots.
#[derive(Debug, Clone)]
pub struct SetupState {
    pub current_screen: SetupScreen,
    pub discovered_devices: Vec<BluetoothDevice>,
    pub selected_device: Option<BluetoothDevice>,
    pub pairing_status: PairingStatus,
    pub setup_complete: bool,
    pub error_message: Option<String>,
    pub discovery_progress: f32,
    pub discovery_timeout: Duration,
    /// Cursor into `discovered_devices` on the device list.
    pub scroll_offset: usize,
}

impl Default for SetupState {
    fn default() -> Self {
        Self::new(Duration::from_secs(12))
    }
}

impl SetupState {
    pub fn new(discovery_timeout: Duration) -> Self {
        Self {
            current_screen: SetupScreen::Welcome,
            discovered_devices: Vec::new(),
            selected_device: None,
            pairing_status: PairingStatus::Idle,
            setup_complete: false,
            error_message: None,
            discovery_progress: 0.0,
            discovery_timeout,
            scroll_offset: 0,
        }
    }

    pub fn highlighted_device(&self) -> Option<&BluetoothDevice> {
        self.discovered_devices.get(self.scroll_offset)
    }

    /// Applies one update, returning the field if its value changed.
    pub(crate) fn apply(&mut self, update: StateUpdate) -> Option<StateField> {
        let field = update.field();
        let changed = match update {
            StateUpdate::CurrentScreen(screen) => replace(&mut self.current_screen, screen),
            StateUpdate::DiscoveredDevices(devices) => {
                let same = self.discovered_devices.len() == devices.len()
                    && self
                        .discovered_devices
                        .iter()
                        .zip(&devices)
                        .all(|(a, b)| same_device(a, b));
                self.discovered_devices = devices;
                !same
            }
            StateUpdate::SelectedDevice(device) => {
                let same = match (&self.selected_device, &device) {
                    (Some(a), Some(b)) => same_device(a, b),
                    (None, None) => true,
                    _ => false,
                };
                self.selected_device = device;
                !same
            }
            StateUpdate::PairingStatus(status) => replace(&mut self.pairing_status, status),
            StateUpdate::SetupComplete(complete) => replace(&mut self.setup_complete, complete),
            StateUpdate::ErrorMessage(message) => replace(&mut self.error_message, message),
            StateUpdate::DiscoveryProgress(progress) => {
                let progress = if progress.is_nan() {
                    0.0
                } else {
                    progress.clamp(0.0, 1.0)
                };
                replace(&mut self.discovery_progress, progress)
            }
            StateUpdate::DiscoveryTimeout(timeout) => replace(&mut self.discovery_timeout, timeout),
            StateUpdate::ScrollOffset(offset) => replace(&mut self.scroll_offset, offset),
        };
        changed.then_some(field)
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

// Device equality is the MAC alone, which would hide pairing and
// verification changes from observers.
fn same_device(a: &BluetoothDevice, b: &BluetoothDevice) -> bool {
    a.mac_address == b.mac_address
        && a.name == b.name
        && a.signal_strength == b.signal_strength
        && a.is_paired == b.is_paired
        && a.connection_verified == b.connection_verified
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateField {
    CurrentScreen,
    DiscoveredDevices,
    SelectedDevice,
    PairingStatus,
    SetupComplete,
    ErrorMessage,
    DiscoveryProgress,
    DiscoveryTimeout,
    ScrollOffset,
}

impl StateField {
    pub fn name(&self) -> &'static str {
        match self {
            StateField::CurrentScreen => "current_screen",
            StateField::DiscoveredDevices => "discovered_devices",
            StateField::SelectedDevice => "selected_device",
            StateField::PairingStatus => "pairing_status",
            StateField::SetupComplete => "setup_complete",
            StateField::ErrorMessage => "error_message",
            StateField::DiscoveryProgress => "discovery_progress",
            StateField::DiscoveryTimeout => "discovery_timeout",
            StateField::ScrollOffset => "scroll_offset",
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single field assignment for [`SetupStateCoordinator::update_state`].
///
/// [`SetupStateCoordinator::update_state`]: super::SetupStateCoordinator::update_state
#[derive(Debug, Clone)]
pub enum StateUpdate {
    CurrentScreen(SetupScreen),
    DiscoveredDevices(Vec<BluetoothDevice>),
    SelectedDevice(Option<BluetoothDevice>),
    PairingStatus(PairingStatus),
    SetupComplete(bool),
    ErrorMessage(Option<String>),
    DiscoveryProgress(f32),
    DiscoveryTimeout(Duration),
    ScrollOffset(usize),
}

impl StateUpdate {
    pub fn field(&self) -> StateField {
        match self {
            StateUpdate::CurrentScreen(_) => StateField::CurrentScreen,
            StateUpdate::DiscoveredDevices(_) => StateField::DiscoveredDevices,
            StateUpdate::SelectedDevice(_) => StateField::SelectedDevice,
            StateUpdate::PairingStatus(_) => StateField::PairingStatus,
            StateUpdate::SetupComplete(_) => StateField::SetupComplete,
            StateUpdate::ErrorMessage(_) => StateField::ErrorMessage,
            StateUpdate::DiscoveryProgress(_) => StateField::DiscoveryProgress,
            StateUpdate::DiscoveryTimeout(_) => StateField::DiscoveryTimeout,
            StateUpdate::ScrollOffset(_) => StateField::ScrollOffset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_values_are_not_reported() {
        let mut state = SetupState::default();
        assert_eq!(state.apply(StateUpdate::PairingStatus(PairingStatus::Idle)), None);
        assert_eq!(
            state.apply(StateUpdate::PairingStatus(PairingStatus::Discovering)),
            Some(StateField::PairingStatus)
        );
        assert_eq!(state.pairing_status, PairingStatus::Discovering);
    }

    #[test]
    fn progress_is_clamped() {
        let mut state = SetupState::default();
        state.apply(StateUpdate::DiscoveryProgress(1.5));
        assert_eq!(state.discovery_progress, 1.0);
        state.apply(StateUpdate::DiscoveryProgress(-0.2));
        assert_eq!(state.discovery_progress, 0.0);
        state.apply(StateUpdate::DiscoveryProgress(f32::NAN));
        assert_eq!(state.discovery_progress, 0.0);
    }

    #[test]
    fn device_flag_changes_are_detected() {
        let device = BluetoothDevice::new("00:1D:A5:68:98:8B", "OBDII");
        let mut state = SetupState::default();
        assert!(state
            .apply(StateUpdate::SelectedDevice(Some(device.clone())))
            .is_some());

        let mut verified = device;
        verified.connection_verified = true;
        assert_eq!(
            state.apply(StateUpdate::SelectedDevice(Some(verified))),
            Some(StateField::SelectedDevice)
        );
    }

    #[test]
    fn screen_names_match_wizard_identifiers() {
        assert_eq!(SetupScreen::DeviceList.to_string(), "DEVICE_LIST");
        assert_eq!(StateField::ScrollOffset.to_string(), "scroll_offset");
    }
}
