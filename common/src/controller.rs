use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    calibration::moisture_percent,
    config::Configuration,
    error::{CalibrationError, HardwareError, RejectReason},
    hardware::Relay,
    scheduler::IntervalGate,
};

/// Which entity owns the relay, and what the relay is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    ManualOff,
    ManualOn,
    AutoOff,
    AutoOn,
}

/// Owns the runtime state and the relay. Every change of `irrigation_on` goes
/// through [`IrrigationController::actuate`], which only commits the flag once
/// the relay has accepted the new level.
#[derive(Debug)]
pub struct IrrigationController<R: Relay> {
    relay: R,
    moisture_percent: f32,
    irrigation_on: bool,
    auto_mode: bool,
    calibration_valid: bool,
    last_sample_ms: Option<u32>,
    sensor_faults: u32,
    relay_faults: u32,
    decision_gate: IntervalGate,
}

impl<R: Relay> IrrigationController<R> {
    /// `relay` must already be de-energized.
    pub fn new(relay: R, auto_check_interval_ms: u32) -> Self {
        Self {
            relay,
            moisture_percent: 0.0,
            irrigation_on: false,
            auto_mode: false,
            calibration_valid: true,
            last_sample_ms: None,
            sensor_faults: 0,
            relay_faults: 0,
            decision_gate: IntervalGate::new(auto_check_interval_ms),
        }
    }

    pub fn state(&self) -> ControlState {
        match (self.auto_mode, self.irrigation_on) {
            (false, false) => ControlState::ManualOff,
            (false, true) => ControlState::ManualOn,
            (true, false) => ControlState::AutoOff,
            (true, true) => ControlState::AutoOn,
        }
    }

    pub fn moisture_percent(&self) -> f32 {
        self.moisture_percent
    }

    pub fn is_irrigating(&self) -> bool {
        self.irrigation_on
    }

    pub fn is_auto_mode(&self) -> bool {
        self.auto_mode
    }

    pub fn calibration_valid(&self) -> bool {
        self.calibration_valid
    }

    pub fn last_sample_ms(&self) -> Option<u32> {
        self.last_sample_ms
    }

    pub fn last_decision_ms(&self) -> Option<u32> {
        self.decision_gate.last_ms()
    }

    pub fn sensor_faults(&self) -> u32 {
        self.sensor_faults
    }

    pub fn relay_faults(&self) -> u32 {
        self.relay_faults
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    /// Converts a raw probe sample and stores it. A degenerate calibration
    /// keeps the previous reading.
    pub fn record_sample(
        &mut self,
        raw: i32,
        config: &Configuration,
        now_ms: u32,
    ) -> Result<f32, CalibrationError> {
        match moisture_percent(raw, config.dry_reading, config.wet_reading) {
            Ok(percent) => {
                self.moisture_percent = percent;
                self.calibration_valid = true;
                self.last_sample_ms = Some(now_ms);
                debug!("raw {raw} -> moisture {percent:.1}%");
                Ok(percent)
            }
            Err(err) => {
                if self.calibration_valid {
                    warn!("{err}; keeping last reading {:.1}%", self.moisture_percent);
                }
                self.calibration_valid = false;
                Err(err)
            }
        }
    }

    pub fn record_sensor_fault(&mut self, err: &HardwareError) {
        self.sensor_faults = self.sensor_faults.saturating_add(1);
        warn!(
            "moisture probe read failed ({err}); keeping last reading {:.1}%",
            self.moisture_percent
        );
    }

    /// Returns whether the mode changed. Entering auto mode evaluates the
    /// threshold at once; leaving it always stops irrigation.
    pub fn set_auto_mode(&mut self, enabled: bool, config: &Configuration, now_ms: u32) -> bool {
        if self.auto_mode == enabled {
            return false;
        }

        self.auto_mode = enabled;
        info!("auto mode {}", if enabled { "on" } else { "off" });

        if enabled {
            if self.has_reading() {
                self.decision_gate.mark(now_ms);
                self.decide(config);
            }
        } else if self.irrigation_on && self.actuate(false) {
            info!("irrigation off (auto mode exit)");
        }

        true
    }

    /// Manual relay command. Rejected while auto mode owns the relay.
    pub fn set_irrigation(&mut self, on: bool) -> Result<bool, RejectReason> {
        if self.auto_mode {
            debug!("manual irrigation {on} ignored: auto mode active");
            return Err(RejectReason::AutoModeActive);
        }

        if self.irrigation_on == on {
            return Ok(false);
        }

        if !self.actuate(on) {
            return Ok(false);
        }
        info!("irrigation {} (manual)", if on { "on" } else { "off" });
        Ok(true)
    }

    /// Auto-mode decision, rate limited to one per `auto_check_interval_ms`.
    /// Returns whether the relay changed.
    pub fn on_poll_tick(&mut self, config: &Configuration, now_ms: u32) -> bool {
        if !self.auto_mode || !self.has_reading() {
            return false;
        }

        if !self.decision_gate.try_fire(now_ms) {
            return false;
        }

        debug!(
            "auto check: moisture {:.1}% threshold {}%",
            self.moisture_percent, config.dry_threshold_percent
        );
        self.decide(config)
    }

    fn has_reading(&self) -> bool {
        self.last_sample_ms.is_some()
    }

    fn decide(&mut self, config: &Configuration) -> bool {
        let wants_water = self.moisture_percent < config.dry_threshold_percent as f32;
        if wants_water == self.irrigation_on {
            return false;
        }

        if !self.actuate(wants_water) {
            return false;
        }
        info!(
            "irrigation {} (auto, moisture {:.1}% vs threshold {}%)",
            if wants_water { "on" } else { "off" },
            self.moisture_percent,
            config.dry_threshold_percent
        );
        true
    }

    /// Returns whether the relay took the new level. On failure the flag keeps
    /// describing the output as it was.
    fn actuate(&mut self, on: bool) -> bool {
        match self.relay.set(on) {
            Ok(()) => {
                self.irrigation_on = on;
                true
            }
            Err(err) => {
                self.relay_faults = self.relay_faults.saturating_add(1);
                warn!(
                    "relay write failed ({err}); irrigation stays {}",
                    if self.irrigation_on { "on" } else { "off" }
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::testing::RecordingRelay;

    const INTERVAL_MS: u32 = 10_000;

    fn controller() -> IrrigationController<RecordingRelay> {
        IrrigationController::new(RecordingRelay::default(), INTERVAL_MS)
    }

    #[test]
    fn starts_manual_off_without_touching_relay() {
        let controller = controller();

        assert_eq!(controller.state(), ControlState::ManualOff);
        assert!(controller.relay().writes.is_empty());
    }

    #[test]
    fn manual_commands_drive_relay() {
        let mut controller = controller();

        assert_eq!(controller.set_irrigation(true), Ok(true));
        assert_eq!(controller.state(), ControlState::ManualOn);
        assert_eq!(controller.set_irrigation(true), Ok(false));
        assert_eq!(controller.set_irrigation(false), Ok(true));

        assert_eq!(controller.relay().writes, vec![true, false]);
    }

    #[test]
    fn manual_command_rejected_in_auto_mode() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(555, &config, 0).unwrap();
        controller.set_auto_mode(true, &config, 0);
        let writes_before = controller.relay().writes.len();

        assert_eq!(
            controller.set_irrigation(true),
            Err(RejectReason::AutoModeActive)
        );
        assert!(!controller.is_irrigating());
        assert_eq!(controller.relay().writes.len(), writes_before);
    }

    #[test]
    fn entering_auto_evaluates_immediately() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(1025, &config, 0).unwrap();

        assert!(controller.set_auto_mode(true, &config, 100));

        assert_eq!(controller.state(), ControlState::AutoOn);
        assert_eq!(controller.relay().writes, vec![true]);
        assert_eq!(controller.last_decision_ms(), Some(100));
    }

    #[test]
    fn entering_auto_from_manual_on_turns_off_when_wet() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(555, &config, 0).unwrap();
        controller.set_irrigation(true).unwrap();

        controller.set_auto_mode(true, &config, 0);

        assert_eq!(controller.state(), ControlState::AutoOff);
        assert_eq!(controller.relay().writes, vec![true, false]);
    }

    #[test]
    fn entering_auto_without_reading_waits_for_data() {
        let config = Configuration::default();
        let mut controller = controller();

        controller.set_auto_mode(true, &config, 0);
        assert_eq!(controller.state(), ControlState::AutoOff);
        assert!(!controller.on_poll_tick(&config, 20_000));

        controller.record_sample(1025, &config, 21_000).unwrap();
        assert!(controller.on_poll_tick(&config, 21_000));
        assert_eq!(controller.state(), ControlState::AutoOn);
    }

    #[test]
    fn leaving_auto_forces_single_relay_off() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(1025, &config, 0).unwrap();
        controller.set_auto_mode(true, &config, 0);
        assert_eq!(controller.state(), ControlState::AutoOn);
        let off_before = controller.relay().off_writes();

        assert!(controller.set_auto_mode(false, &config, 50));

        assert_eq!(controller.state(), ControlState::ManualOff);
        assert!(!controller.relay().energized());
        assert_eq!(controller.relay().off_writes(), off_before + 1);
    }

    #[test]
    fn leaving_auto_while_off_does_not_actuate() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(555, &config, 0).unwrap();
        controller.set_auto_mode(true, &config, 0);

        controller.set_auto_mode(false, &config, 10);

        assert!(controller.relay().writes.is_empty());
    }

    #[test]
    fn repeated_mode_request_is_noop() {
        let config = Configuration::default();
        let mut controller = controller();

        assert!(!controller.set_auto_mode(false, &config, 0));
        assert!(controller.set_auto_mode(true, &config, 0));
        assert!(!controller.set_auto_mode(true, &config, 10));
    }

    #[test]
    fn decisions_are_rate_limited() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(555, &config, 0).unwrap();
        controller.set_auto_mode(true, &config, 0);
        assert_eq!(controller.state(), ControlState::AutoOff);

        // Soil dries out right after the entry decision.
        controller.record_sample(1025, &config, 1_000).unwrap();
        assert!(!controller.on_poll_tick(&config, 1_000));
        assert!(!controller.on_poll_tick(&config, 9_999));
        assert!(controller.relay().writes.is_empty());

        assert!(controller.on_poll_tick(&config, 10_000));
        assert_eq!(controller.relay().writes, vec![true]);

        // Crossing back within the interval produces no second actuation.
        controller.record_sample(555, &config, 12_000).unwrap();
        assert!(!controller.on_poll_tick(&config, 12_000));
        assert_eq!(controller.relay().writes, vec![true]);
    }

    #[test]
    fn threshold_is_strictly_less_than() {
        let config = Configuration {
            dry_reading: 0,
            wet_reading: 100,
            dry_threshold_percent: 40,
        };
        let mut controller = controller();
        controller.record_sample(40, &config, 0).unwrap();
        assert_eq!(controller.moisture_percent(), 40.0);

        controller.set_auto_mode(true, &config, 0);
        assert_eq!(controller.state(), ControlState::AutoOff);

        controller.record_sample(39, &config, 10_000).unwrap();
        assert!(controller.on_poll_tick(&config, 10_000));
        assert_eq!(controller.state(), ControlState::AutoOn);
    }

    #[test]
    fn manual_mode_ignores_poll_ticks() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(1025, &config, 0).unwrap();

        assert!(!controller.on_poll_tick(&config, 50_000));
        assert_eq!(controller.state(), ControlState::ManualOff);
        assert_eq!(controller.last_decision_ms(), None);
    }

    #[test]
    fn degenerate_calibration_keeps_last_reading() {
        let mut config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(790, &config, 0).unwrap();

        config.wet_reading = config.dry_reading;
        assert_eq!(
            controller.record_sample(300, &config, 5_000),
            Err(CalibrationError::Degenerate { reading: 1025 })
        );

        assert!(!controller.calibration_valid());
        assert!((controller.moisture_percent() - 50.0).abs() < 0.01);
        assert_eq!(controller.last_sample_ms(), Some(0));
    }

    #[test]
    fn sensor_fault_is_counted_not_applied() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(555, &config, 0).unwrap();

        controller.record_sensor_fault(&HardwareError::new("adc timeout"));

        assert_eq!(controller.sensor_faults(), 1);
        assert_eq!(controller.moisture_percent(), 100.0);
    }

    #[test]
    fn failed_relay_write_leaves_state_unchanged() {
        let mut controller = IrrigationController::new(
            RecordingRelay {
                jammed: true,
                ..RecordingRelay::default()
            },
            INTERVAL_MS,
        );

        assert_eq!(controller.set_irrigation(true), Ok(false));
        assert_eq!(controller.state(), ControlState::ManualOff);
        assert_eq!(controller.relay_faults(), 1);

        controller.relay.jammed = false;
        assert_eq!(controller.set_irrigation(true), Ok(true));
        assert_eq!(controller.state(), ControlState::ManualOn);
    }

    #[test]
    fn failed_auto_exit_keeps_reporting_valve_open() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(1025, &config, 0).unwrap();
        controller.set_auto_mode(true, &config, 0);
        assert!(controller.is_irrigating());

        controller.relay.jammed = true;
        controller.set_auto_mode(false, &config, 10);

        // The output is still energized, so the flag must say so.
        assert!(controller.is_irrigating());
        assert_eq!(controller.state(), ControlState::ManualOn);
        assert_eq!(controller.relay().writes, vec![true]);

        controller.relay.jammed = false;
        assert_eq!(controller.set_irrigation(false), Ok(true));
        assert!(!controller.relay().energized());
    }

    #[test]
    fn failed_auto_decision_is_retried_next_interval() {
        let config = Configuration::default();
        let mut controller = controller();
        controller.record_sample(555, &config, 0).unwrap();
        controller.set_auto_mode(true, &config, 0);

        controller.record_sample(1025, &config, 5_000).unwrap();
        controller.relay.jammed = true;
        assert!(!controller.on_poll_tick(&config, 10_000));
        assert_eq!(controller.state(), ControlState::AutoOff);

        controller.relay.jammed = false;
        assert!(controller.on_poll_tick(&config, 20_000));
        assert_eq!(controller.state(), ControlState::AutoOn);
    }

    #[test]
    fn decisions_continue_across_clock_wrap() {
        let config = Configuration::default();
        let mut controller = controller();
        let start = u32::MAX - 4_000;
        controller.record_sample(555, &config, start).unwrap();
        controller.set_auto_mode(true, &config, start);

        controller.record_sample(1025, &config, 2_000).unwrap();
        // 6_001 ms elapsed across the wrap.
        assert!(!controller.on_poll_tick(&config, 2_000));
        // 10_001 ms elapsed.
        assert!(controller.on_poll_tick(&config, 6_000));
        assert_eq!(controller.state(), ControlState::AutoOn);
    }
}
