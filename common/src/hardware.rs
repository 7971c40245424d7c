use crate::error::HardwareError;

/// One-shot acquisition from the soil probe: power up, settle, sample, power
/// down. Implementations must return within a bounded time.
pub trait MoistureSensor {
    fn read_raw(&mut self) -> Result<i32, HardwareError>;
}

/// The irrigation valve output. `Ok` means the output now holds the
/// requested level.
pub trait Relay {
    fn set(&mut self, energized: bool) -> Result<(), HardwareError>;
}
