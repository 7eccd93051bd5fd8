use thiserror::Error;

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("Bluetooth not available: {0}")]
    NotAvailable(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BluetoothError {
    pub fn user_message(&self) -> &'static str {
        match self {
            BluetoothError::NotAvailable(_) => "Bluetooth is not available on this device.",
            BluetoothError::CommandFailed(_) => "Bluetooth command failed. Please try again.",
            BluetoothError::Timeout(_) => "The adapter did not respond in time.",
            BluetoothError::Cancelled => "Cancelled.",
            BluetoothError::DeviceNotFound(_) => "Adapter not found. Is it powered on?",
            BluetoothError::Protocol(_) => "The device did not answer like an OBD adapter.",
            BluetoothError::Io(_) => "Could not talk to the adapter.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BluetoothError::Timeout(_)
                | BluetoothError::CommandFailed(_)
                | BluetoothError::DeviceNotFound(_)
                | BluetoothError::Io(_)
        )
    }
}

pub type BluetoothResult<T> = Result<T, BluetoothError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_available_is_not_retryable() {
        let err = BluetoothError::NotAvailable("no controller".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Bluetooth not available: no controller");
    }

    #[test]
    fn timeouts_are_retryable() {
        assert!(BluetoothError::Timeout("scan".to_string()).is_retryable());
        assert!(!BluetoothError::Cancelled.is_retryable());
    }
}
