//! The surface the network layer talks to. Requests are plain values so they
//! can be queued onto the control loop and answered from there.

use serde::{Deserialize, Serialize};

use crate::{
    config::{ConfigPatch, Configuration},
    controller::ControlState,
    error::{ControlError, RejectReason},
};

/// Target of a control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Irrigation,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlCommand {
    pub device: Device,
    pub state: bool,
}

impl ControlCommand {
    pub fn from_json(body: &[u8]) -> Result<Self, RejectReason> {
        serde_json::from_slice(body).map_err(|err| RejectReason::Malformed(err.to_string()))
    }
}

impl ConfigPatch {
    pub fn from_json(body: &[u8]) -> Result<Self, RejectReason> {
        serde_json::from_slice(body).map_err(|err| RejectReason::Malformed(err.to_string()))
    }
}

/// Checks a declared request body length against `limit` before anything is
/// buffered. A missing length means an empty body.
pub fn body_len_within(declared: Option<u64>, limit: usize) -> Result<usize, RejectReason> {
    let Some(declared) = declared else {
        return Ok(0);
    };
    match usize::try_from(declared) {
        Ok(len) if len <= limit => Ok(len),
        _ => Err(RejectReason::Malformed(format!(
            "request body of {declared} bytes exceeds {limit}"
        ))),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub moisture: f32,
    pub irrigation: bool,
    #[serde(rename = "autoMode")]
    pub auto_mode: bool,
    pub state: ControlState,
    #[serde(rename = "calibrationValid")]
    pub calibration_valid: bool,
    #[serde(rename = "storageHealthy")]
    pub storage_healthy: bool,
    #[serde(rename = "sensorFaults")]
    pub sensor_faults: u32,
    #[serde(rename = "relayFaults")]
    pub relay_faults: u32,
}

#[derive(Debug, Clone)]
pub enum ControlRequest {
    Sensors,
    Config,
    UpdateConfig(ConfigPatch),
    Control(ControlCommand),
}

#[derive(Debug, Clone)]
pub enum ControlResponse {
    Sensors(SensorSnapshot),
    Config(Configuration),
}

pub type ControlReply = Result<ControlResponse, ControlError>;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Configuration>,
}

impl ControlError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Rejected(RejectReason::AutoModeActive) => 409,
            Self::Rejected(RejectReason::Malformed(_)) => 400,
            Self::Storage { .. } => 500,
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
            config: match self {
                Self::Storage { config, .. } => Some(*config),
                Self::Rejected(_) => None,
            },
        }
    }
}

pub trait ControlFacade {
    fn sensors(&self) -> SensorSnapshot;

    fn config(&self) -> Configuration;

    /// Applies the present fields and persists. The merged configuration is in
    /// effect even when the returned error reports a storage failure.
    fn update_config(&mut self, patch: &ConfigPatch) -> Result<Configuration, ControlError>;

    fn control(
        &mut self,
        command: ControlCommand,
        now_ms: u32,
    ) -> Result<SensorSnapshot, ControlError>;

    fn handle(&mut self, request: ControlRequest, now_ms: u32) -> ControlReply {
        match request {
            ControlRequest::Sensors => Ok(ControlResponse::Sensors(self.sensors())),
            ControlRequest::Config => Ok(ControlResponse::Config(self.config())),
            ControlRequest::UpdateConfig(patch) => {
                self.update_config(&patch).map(ControlResponse::Config)
            }
            ControlRequest::Control(command) => {
                self.control(command, now_ms).map(ControlResponse::Sensors)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn parses_known_devices() {
        assert_eq!(
            ControlCommand::from_json(br#"{"device":"irrigation","state":true}"#),
            Ok(ControlCommand {
                device: Device::Irrigation,
                state: true,
            })
        );
        assert_eq!(
            ControlCommand::from_json(br#"{"device":"auto","state":false}"#),
            Ok(ControlCommand {
                device: Device::Auto,
                state: false,
            })
        );
    }

    #[test]
    fn unknown_device_is_malformed() {
        let err = ControlCommand::from_json(br#"{"device":"pump","state":true}"#).unwrap_err();
        assert!(matches!(err, RejectReason::Malformed(_)));
    }

    #[test]
    fn missing_state_is_malformed() {
        let err = ControlCommand::from_json(br#"{"device":"auto"}"#).unwrap_err();
        assert!(matches!(err, RejectReason::Malformed(_)));
    }

    #[test]
    fn garbage_patch_is_malformed() {
        assert!(matches!(
            ConfigPatch::from_json(b"dryValue=3"),
            Err(RejectReason::Malformed(_))
        ));
    }

    #[test]
    fn body_length_is_bounded_before_buffering() {
        assert_eq!(body_len_within(None, 4096), Ok(0));
        assert_eq!(body_len_within(Some(4096), 4096), Ok(4096));
        assert!(matches!(
            body_len_within(Some(4097), 4096),
            Err(RejectReason::Malformed(_))
        ));
    }

    #[test]
    fn huge_declared_length_is_rejected_not_truncated() {
        // On a 32-bit target `as usize` would wrap this to 16 bytes.
        let declared = (1_u64 << 32) + 16;

        assert!(matches!(
            body_len_within(Some(declared), 4096),
            Err(RejectReason::Malformed(_))
        ));
    }

    #[test]
    fn rejection_kinds_map_to_distinct_statuses() {
        let auto: ControlError = RejectReason::AutoModeActive.into();
        let malformed: ControlError = RejectReason::Malformed("eof".to_string()).into();
        let storage = ControlError::Storage {
            source: StorageError::Unavailable("no flash".to_string()),
            config: Configuration::default(),
        };

        assert_eq!(auto.http_status(), 409);
        assert_eq!(malformed.http_status(), 400);
        assert_eq!(storage.http_status(), 500);
        assert!(storage.body().config.is_some());
        assert!(auto.body().config.is_none());
    }

    #[test]
    fn snapshot_uses_dashboard_field_names() {
        let snapshot = SensorSnapshot {
            moisture: 42.5,
            irrigation: true,
            auto_mode: false,
            state: ControlState::ManualOn,
            calibration_valid: true,
            storage_healthy: true,
            sensor_faults: 0,
            relay_faults: 0,
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["moisture"], 42.5);
        assert_eq!(value["irrigation"], true);
        assert_eq!(value["autoMode"], false);
        assert_eq!(value["state"], "MANUAL_ON");
    }
}
