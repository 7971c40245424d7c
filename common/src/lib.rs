pub mod calibration;
pub mod config;
pub mod controller;
pub mod error;
pub mod facade;
pub mod hardware;
pub mod scheduler;
pub mod store;
pub mod system;

pub use calibration::moisture_percent;
pub use config::{ConfigPatch, Configuration, ControllerConfig, NetworkConfig};
pub use controller::{ControlState, IrrigationController};
pub use error::{CalibrationError, ControlError, HardwareError, RejectReason, StorageError};
pub use facade::{
    body_len_within, ControlCommand, ControlFacade, ControlReply, ControlRequest, ControlResponse,
    Device, ErrorBody, SensorSnapshot,
};
pub use hardware::{MoistureSensor, Relay};
pub use scheduler::{wrapping_clock_ms, IntervalGate, PollScheduler};
pub use store::{ConfigBackend, ConfigStore, FileBackend, MemoryBackend};
pub use system::{IrrigationSystem, ServiceOutcome};
