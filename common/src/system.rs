use log::debug;

use crate::{
    config::{ConfigPatch, Configuration, ControllerConfig},
    controller::IrrigationController,
    error::ControlError,
    facade::{ControlCommand, ControlFacade, Device, SensorSnapshot},
    hardware::{MoistureSensor, Relay},
    scheduler::PollScheduler,
    store::{ConfigBackend, ConfigStore},
};

/// What one call to [`IrrigationSystem::service`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub sampled: bool,
    pub relay_changed: bool,
}

/// Everything the control loop owns. Requests and timer work are applied one
/// at a time through `&mut self`, so no step can interleave with another.
#[derive(Debug)]
pub struct IrrigationSystem<B: ConfigBackend, S: MoistureSensor, R: Relay> {
    store: ConfigStore<B>,
    controller: IrrigationController<R>,
    scheduler: PollScheduler,
    sensor: S,
}

impl<B, S, R> IrrigationSystem<B, S, R>
where
    B: ConfigBackend,
    S: MoistureSensor,
    R: Relay,
{
    pub fn new(store: ConfigStore<B>, sensor: S, relay: R, timing: &ControllerConfig) -> Self {
        Self {
            store,
            controller: IrrigationController::new(relay, timing.auto_check_interval_ms),
            scheduler: PollScheduler::new(timing.sample_interval_ms),
            sensor,
        }
    }

    pub fn controller(&self) -> &IrrigationController<R> {
        &self.controller
    }

    pub fn store(&self) -> &ConfigStore<B> {
        &self.store
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    /// One pass of the periodic duties: sample when due, then give the auto
    /// logic its chance to decide.
    pub fn service(&mut self, now_ms: u32) -> ServiceOutcome {
        let mut outcome = ServiceOutcome::default();
        let config = *self.store.config();

        if self.scheduler.sample_due(now_ms) {
            outcome.sampled = true;
            match self.sensor.read_raw() {
                Ok(raw) => {
                    // Degenerate calibration is logged and flagged by the controller.
                    let _ = self.controller.record_sample(raw, &config, now_ms);
                }
                Err(err) => self.controller.record_sensor_fault(&err),
            }
        }

        outcome.relay_changed = self.controller.on_poll_tick(&config, now_ms);
        outcome
    }
}

impl<B, S, R> ControlFacade for IrrigationSystem<B, S, R>
where
    B: ConfigBackend,
    S: MoistureSensor,
    R: Relay,
{
    fn sensors(&self) -> SensorSnapshot {
        SensorSnapshot {
            moisture: self.controller.moisture_percent(),
            irrigation: self.controller.is_irrigating(),
            auto_mode: self.controller.is_auto_mode(),
            state: self.controller.state(),
            calibration_valid: self.controller.calibration_valid(),
            storage_healthy: self.store.storage_healthy(),
            sensor_faults: self.controller.sensor_faults(),
            relay_faults: self.controller.relay_faults(),
        }
    }

    fn config(&self) -> Configuration {
        *self.store.config()
    }

    fn update_config(&mut self, patch: &ConfigPatch) -> Result<Configuration, ControlError> {
        self.store
            .update(patch)
            .map_err(|source| ControlError::Storage {
                source,
                config: *self.store.config(),
            })
    }

    fn control(
        &mut self,
        command: ControlCommand,
        now_ms: u32,
    ) -> Result<SensorSnapshot, ControlError> {
        debug!("control command {command:?}");
        match command.device {
            Device::Irrigation => {
                self.controller.set_irrigation(command.state)?;
            }
            Device::Auto => {
                let config = *self.store.config();
                self.controller
                    .set_auto_mode(command.state, &config, now_ms);
            }
        }
        Ok(self.sensors())
    }
}
