use serde::{Deserialize, Serialize};

pub const DEFAULT_DRY_READING: i32 = 1025;
pub const DEFAULT_WET_READING: i32 = 555;
pub const DEFAULT_DRY_THRESHOLD_PERCENT: u8 = 40;

/// Persisted calibration and threshold record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(
        rename = "dryValue",
        alias = "dryReading",
        default = "default_dry_reading"
    )]
    pub dry_reading: i32,
    #[serde(
        rename = "wetValue",
        alias = "wetReading",
        default = "default_wet_reading"
    )]
    pub wet_reading: i32,
    #[serde(
        rename = "dryThreshold",
        alias = "dryThresholdPercent",
        default = "default_dry_threshold"
    )]
    pub dry_threshold_percent: u8,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            dry_reading: DEFAULT_DRY_READING,
            wet_reading: DEFAULT_WET_READING,
            dry_threshold_percent: DEFAULT_DRY_THRESHOLD_PERCENT,
        }
    }
}

impl Configuration {
    pub fn sanitize(&mut self) {
        self.dry_threshold_percent = self.dry_threshold_percent.min(100);
    }

    /// Merges the fields present in `patch`; absent fields are left untouched.
    pub fn merge(&mut self, patch: &ConfigPatch) {
        if let Some(dry) = patch.dry_reading {
            self.dry_reading = dry;
        }
        if let Some(wet) = patch.wet_reading {
            self.wet_reading = wet;
        }
        if let Some(threshold) = patch.dry_threshold_percent {
            self.dry_threshold_percent = threshold;
        }
        self.sanitize();
    }
}

fn default_dry_reading() -> i32 {
    DEFAULT_DRY_READING
}

fn default_wet_reading() -> i32 {
    DEFAULT_WET_READING
}

fn default_dry_threshold() -> u8 {
    DEFAULT_DRY_THRESHOLD_PERCENT
}

/// Partial configuration update as received from the control boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(
        rename = "dryValue",
        alias = "dryReading",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dry_reading: Option<i32>,
    #[serde(
        rename = "wetValue",
        alias = "wetReading",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub wet_reading: Option<i32>,
    #[serde(
        rename = "dryThreshold",
        alias = "dryThresholdPercent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dry_threshold_percent: Option<u8>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.dry_reading.is_none()
            && self.wet_reading.is_none()
            && self.dry_threshold_percent.is_none()
    }
}

/// Timing for the control loop. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub sample_interval_ms: u32,
    pub auto_check_interval_ms: u32,
    pub probe_settle_ms: u32,
    pub loop_idle_ms: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            auto_check_interval_ms: 10_000,
            probe_settle_ms: 10,
            loop_idle_ms: 50,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.sample_interval_ms = self.sample_interval_ms.max(100);
        self.auto_check_interval_ms = self.auto_check_interval_ms.max(self.sample_interval_ms);
        self.probe_settle_ms = self.probe_settle_ms.min(1_000);
        self.loop_idle_ms = self.loop_idle_ms.clamp(10, 1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub ap_ssid: String,
    pub ap_password: String,
    pub hostname: String,
    pub ap_address: [u8; 4],
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "Greennodes".to_string(),
            ap_password: "greennodes123".to_string(),
            hostname: "greennodes".to_string(),
            ap_address: [192, 168, 4, 1],
        }
    }
}

impl NetworkConfig {
    /// Where captive clients are sent for any path the server does not know.
    pub fn portal_url(&self) -> String {
        let [a, b, c, d] = self.ap_address;
        format!("http://{a}.{b}.{c}.{d}/")
    }

    pub fn sanitize(&mut self) {
        if self.ap_ssid.trim().is_empty() || self.ap_ssid.len() > 32 {
            self.ap_ssid = Self::default().ap_ssid;
        }
        // WPA2 needs 8..=63 characters; anything else falls back to the default.
        if !(8..=63).contains(&self.ap_password.len()) {
            self.ap_password = Self::default().ap_password;
        }
        if self.hostname.trim().is_empty() {
            self.hostname = Self::default().hostname;
        }
    }
}
