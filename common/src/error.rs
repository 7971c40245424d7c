use thiserror::Error;

use crate::config::Configuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("dry and wet calibration endpoints are both {reading}")]
    Degenerate { reading: i32 },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HardwareError {
    pub message: String,
}

impl HardwareError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("manual irrigation is disabled while auto mode is active")]
    AutoModeActive,
    #[error("malformed request: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Rejected(#[from] RejectReason),
    /// The update was applied in memory but could not be persisted.
    #[error("configuration applied but not persisted: {source}")]
    Storage {
        #[source]
        source: StorageError,
        config: Configuration,
    },
}
