use crate::operation::{
    clamp_progress, AsyncOperation, OperationCallback, OperationId, OperationStatus,
    PROGRESS_MESSAGE_KEY,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub(crate) type OperationTable = Arc<Mutex<HashMap<OperationId, AsyncOperation>>>;

/// Handle a running task uses to publish fractional progress.
///
/// Every task receives one. Reports outside `[0.0, 1.0]` are clamped and
/// reports arriving after the operation left `Running` are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    target: Option<Target>,
}

#[derive(Clone)]
struct Target {
    id: OperationId,
    operations: OperationTable,
    callback: Option<OperationCallback>,
}

impl ProgressReporter {
    pub(crate) fn new(
        id: OperationId,
        operations: OperationTable,
        callback: Option<OperationCallback>,
    ) -> Self {
        Self {
            target: Some(Target {
                id,
                operations,
                callback,
            }),
        }
    }

    /// A reporter that discards everything.
    pub fn noop() -> Self {
        Self { target: None }
    }

    pub fn operation_id(&self) -> Option<OperationId> {
        self.target.as_ref().map(|t| t.id)
    }

    pub fn report(&self, fraction: f32, message: impl Into<String>) {
        let Some(target) = &self.target else {
            return;
        };

        let snapshot = {
            let mut operations = target.operations.lock();
            let Some(op) = operations.get_mut(&target.id) else {
                return;
            };
            if op.status != OperationStatus::Running {
                return;
            }
            op.progress = clamp_progress(fraction);
            op.metadata
                .insert(PROGRESS_MESSAGE_KEY.to_string(), message.into());
            op.clone()
        };

        if let Some(callback) = &target.callback {
            notify(callback, &snapshot);
        }
    }
}

pub(crate) fn notify(callback: &OperationCallback, op: &AsyncOperation) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(op)));
    if result.is_err() {
        warn!("Operation callback for {} panicked", op.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationType;

    #[test]
    fn noop_reporter_ignores_reports() {
        let reporter = ProgressReporter::noop();
        reporter.report(0.5, "halfway");
        assert!(reporter.operation_id().is_none());
    }

    #[test]
    fn reports_only_apply_while_running() {
        let table: OperationTable = Arc::new(Mutex::new(HashMap::new()));
        let id = OperationId(1);
        table.lock().insert(
            id,
            AsyncOperation::new(id, OperationType::GeneralTask, HashMap::new()),
        );
        let reporter = ProgressReporter::new(id, table.clone(), None);

        reporter.report(0.4, "queued");
        assert_eq!(table.lock()[&id].progress, 0.0);

        if let Some(op) = table.lock().get_mut(&id) {
            op.mark_running();
        }
        reporter.report(1.7, "scanning");
        let op = table.lock()[&id].clone();
        assert_eq!(op.progress, 1.0);
        assert_eq!(op.progress_message(), Some("scanning"));
    }
}
