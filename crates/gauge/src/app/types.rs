use crate::setup::{SetupScreen, StateField};
use obd_gauge_bluetooth::{BluetoothCapability, BluetoothResult};
use obd_gauge_worker::{OperationId, OperationStatus, OperationType};
use std::sync::Arc;

/// Builds the Bluetooth capability; called again when a previous attempt
/// failed.
pub type CapabilityFactory =
    Arc<dyn Fn() -> BluetoothResult<Arc<dyn BluetoothCapability>> + Send + Sync>;

/// Notifications from the coordinator and the worker pool, drained on the
/// render thread.
#[derive(Debug, Clone)]
pub enum SetupEvent {
    ScreenChanged {
        from: SetupScreen,
        to: SetupScreen,
    },
    StateChanged(Vec<StateField>),
    OperationFinished {
        id: OperationId,
        operation_type: OperationType,
        status: OperationStatus,
        error: Option<String>,
    },
}
