use crate::error::BluetoothResult;
use crate::types::{BluetoothDevice, PairingStatus};
use std::time::Duration;

/// Blocking Bluetooth operations the setup flow depends on.
///
/// Every method may block for seconds and is meant to run on a worker
/// thread, never on the render thread.
pub trait BluetoothCapability: Send + Sync {
    /// Scans for devices. `progress` receives the elapsed fraction of
    /// `timeout`; `device_found` is called once per newly seen candidate.
    fn discover_devices(
        &self,
        timeout: Duration,
        progress: &dyn Fn(f32),
        device_found: &dyn Fn(&BluetoothDevice),
        show_all_devices: bool,
    ) -> BluetoothResult<Vec<BluetoothDevice>>;

    fn pair_device(
        &self,
        device: &BluetoothDevice,
        status: &dyn Fn(PairingStatus, &str),
    ) -> BluetoothResult<bool>;

    fn test_obd_connection(
        &self,
        device: &BluetoothDevice,
        status: &dyn Fn(&str),
    ) -> BluetoothResult<bool>;

    fn cancel_discovery(&self);

    fn cancel_pairing(&self);
}
