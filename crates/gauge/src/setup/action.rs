use obd_gauge_bluetooth::BluetoothDevice;
use std::fmt;

#[derive(Debug, Clone)]
pub enum SetupAction {
    StartDiscovery,
    SelectDevice { device: Option<BluetoothDevice> },
    Retry,
    Back,
    Next,
    Cancel,
    Complete,
}

impl SetupAction {
    /// Maps an action name emitted by the UI. `device` is only used by
    /// `select_device`.
    pub fn from_name(name: &str, device: Option<BluetoothDevice>) -> Option<Self> {
        let action = match name.trim().to_ascii_lowercase().as_str() {
            "start_discovery" => SetupAction::StartDiscovery,
            "select_device" => SetupAction::SelectDevice { device },
            "retry" => SetupAction::Retry,
            "back" => SetupAction::Back,
            "next" => SetupAction::Next,
            "cancel" => SetupAction::Cancel,
            "complete" => SetupAction::Complete,
            _ => return None,
        };
        Some(action)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SetupAction::StartDiscovery => "start_discovery",
            SetupAction::SelectDevice { .. } => "select_device",
            SetupAction::Retry => "retry",
            SetupAction::Back => "back",
            SetupAction::Next => "next",
            SetupAction::Cancel => "cancel",
            SetupAction::Complete => "complete",
        }
    }
}

impl fmt::Display for SetupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
