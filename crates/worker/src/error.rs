use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid worker count: {0}")]
    InvalidWorkerCount(usize),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Recorded as the operation error when a task panics instead of returning.
#[derive(Debug, Error)]
#[error("Task panicked: {message}")]
pub struct TaskPanicked {
    pub message: String,
}

impl TaskPanicked {
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self { message }
    }
}
