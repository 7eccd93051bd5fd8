pub mod bluetoothctl;
pub mod capability;
pub mod classify;
pub mod elm327;
pub mod error;
pub mod types;

pub use bluetoothctl::{BluetoothCtl, BluetoothCtlConfig};
pub use capability::BluetoothCapability;
pub use error::{BluetoothError, BluetoothResult};
pub use types::*;
