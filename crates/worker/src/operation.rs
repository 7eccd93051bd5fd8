use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Metadata key carrying the last human-readable progress message.
pub const PROGRESS_MESSAGE_KEY: &str = "progress_message";

pub type OperationOutput = Arc<dyn Any + Send + Sync>;
pub type OperationCallback = Arc<dyn Fn(&AsyncOperation) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    BluetoothInit,
    DeviceDiscovery,
    DevicePairing,
    ObdConnectionTest,
    GeneralTask,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::BluetoothInit => "bluetooth_init",
            OperationType::DeviceDiscovery => "device_discovery",
            OperationType::DevicePairing => "device_pairing",
            OperationType::ObdConnectionTest => "obd_connection_test",
            OperationType::GeneralTask => "general_task",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }
}

/// Tracked state of one submitted background task.
///
/// Records are created `Pending`, mutated only by the worker executing them
/// and handed out as clones, so a record obtained from the manager is a
/// point-in-time snapshot.
#[derive(Clone)]
pub struct AsyncOperation {
    pub id: OperationId,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub progress: f32,
    pub result: Option<OperationOutput>,
    pub error: Option<Arc<anyhow::Error>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

impl AsyncOperation {
    pub fn new(
        id: OperationId,
        operation_type: OperationType,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            operation_type,
            status: OperationStatus::Pending,
            progress: 0.0,
            result: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn set_progress(&mut self, progress: f32) {
        self.progress = clamp_progress(progress);
    }

    pub fn progress_message(&self) -> Option<&str> {
        self.metadata.get(PROGRESS_MESSAGE_KEY).map(String::as_str)
    }

    pub fn result_as<T: Any>(&self) -> Option<&T> {
        self.result.as_deref().and_then(|r| r.downcast_ref::<T>())
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| format!("{e:#}"))
    }

    pub(crate) fn mark_running(&mut self) {
        self.status = OperationStatus::Running;
    }

    pub(crate) fn complete(&mut self, output: OperationOutput) {
        self.status = OperationStatus::Completed;
        self.result = Some(output);
        self.progress = 1.0;
        self.end_time = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: anyhow::Error) {
        self.status = OperationStatus::Failed;
        self.error = Some(Arc::new(error));
        self.end_time = Some(Utc::now());
    }

    pub(crate) fn cancel(&mut self) {
        self.status = OperationStatus::Cancelled;
        self.end_time = Some(Utc::now());
    }
}

impl fmt::Debug for AsyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("id", &self.id)
            .field("operation_type", &self.operation_type)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .field("has_result", &self.result.is_some())
            .field("error", &self.error_message())
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .field("metadata", &self.metadata)
            .finish()
    }
}

pub(crate) fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}
