pub mod config;
pub mod error;
pub mod manager;
pub mod operation;
pub mod progress;

pub use config::WorkerConfig;
pub use error::{TaskPanicked, WorkerError};
pub use manager::{AsyncOperationManager, SubmitOptions};
pub use operation::{
    AsyncOperation, OperationCallback, OperationId, OperationStatus, OperationType,
    PROGRESS_MESSAGE_KEY,
};
pub use progress::ProgressReporter;
