//! The pairing wizard: screen state machine, its coordinator and the
//! glue that runs Bluetooth work on the operation manager.

mod action;
mod coordinator;
mod interface;
mod state;
mod visibility;

pub use action::SetupAction;
pub use coordinator::{ScreenTransitionCallback, SetupStateCoordinator, StateChangeCallback};
pub use interface::{ActiveProgress, BluetoothSetupInterface, DeviceFoundCallback, Slot};
pub use state::{SetupScreen, SetupState, StateField, StateUpdate};
pub use visibility::ControlVisibility;
