//! Interval gating on a wrapping millisecond clock.
//!
//! The clock is a `u32` millisecond counter that wraps after ~49.7 days. Elapsed
//! time is always `now.wrapping_sub(last)`, never a direct comparison of the two
//! timestamps, so a gate armed just before the wrap still fires on schedule.

/// Fires at most once per `interval_ms`. An unarmed gate is due immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalGate {
    interval_ms: u32,
    last_ms: Option<u32>,
}

impl IntervalGate {
    pub fn new(interval_ms: u32) -> Self {
        Self {
            interval_ms,
            last_ms: None,
        }
    }

    pub fn last_ms(&self) -> Option<u32> {
        self.last_ms
    }

    pub fn elapsed_ms(&self, now_ms: u32) -> Option<u32> {
        self.last_ms.map(|last| now_ms.wrapping_sub(last))
    }

    pub fn is_due(&self, now_ms: u32) -> bool {
        self.elapsed_ms(now_ms)
            .map(|elapsed| elapsed >= self.interval_ms)
            .unwrap_or(true)
    }

    pub fn mark(&mut self, now_ms: u32) {
        self.last_ms = Some(now_ms);
    }

    /// Marks and returns true when the gate is due.
    pub fn try_fire(&mut self, now_ms: u32) -> bool {
        if self.is_due(now_ms) {
            self.mark(now_ms);
            true
        } else {
            false
        }
    }
}

/// Drives the sampling cadence. The auto-decision cadence is gated by the
/// controller itself, so the two never share a timer.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    sampling: IntervalGate,
}

impl PollScheduler {
    pub fn new(sample_interval_ms: u32) -> Self {
        Self {
            sampling: IntervalGate::new(sample_interval_ms),
        }
    }

    pub fn sample_due(&mut self, now_ms: u32) -> bool {
        self.sampling.try_fire(now_ms)
    }

    pub fn last_sample_ms(&self) -> Option<u32> {
        self.sampling.last_ms()
    }
}

/// Truncates a 64-bit monotonic millisecond count onto the wrapping `u32` clock.
pub fn wrapping_clock_ms(monotonic_ms: u64) -> u32 {
    monotonic_ms as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unarmed_gate_fires_immediately() {
        let mut gate = IntervalGate::new(5_000);
        assert!(gate.try_fire(123));
        assert_eq!(gate.last_ms(), Some(123));
    }

    #[test]
    fn gate_waits_full_interval() {
        let mut gate = IntervalGate::new(5_000);
        assert!(gate.try_fire(1_000));
        assert!(!gate.try_fire(5_999));
        assert!(gate.try_fire(6_000));
        assert!(!gate.try_fire(6_001));
    }

    #[test]
    fn gate_survives_clock_wraparound() {
        let mut gate = IntervalGate::new(10_000);
        let before_wrap = u32::MAX - 3_000;
        assert!(gate.try_fire(before_wrap));

        // 3_001 ms up to the wrap plus 5_999 after it: only 9_000 elapsed.
        assert!(!gate.is_due(5_999));
        assert_eq!(gate.elapsed_ms(5_999), Some(9_000));

        assert!(gate.try_fire(6_999));
        assert_eq!(gate.last_ms(), Some(6_999));
    }

    #[test]
    fn naive_comparison_would_misfire_after_wrap() {
        let gate = {
            let mut gate = IntervalGate::new(10_000);
            gate.mark(u32::MAX - 100);
            gate
        };

        // 201 ms elapsed across the wrap: not due, even though `now < last`.
        assert!(!gate.is_due(100));
    }

    #[test]
    fn scheduler_samples_on_its_own_cadence() {
        let mut scheduler = PollScheduler::new(5_000);
        assert!(scheduler.sample_due(0));
        assert!(!scheduler.sample_due(4_999));
        assert!(scheduler.sample_due(5_000));
        assert_eq!(scheduler.last_sample_ms(), Some(5_000));
    }

    #[test]
    fn wrapping_clock_truncates() {
        assert_eq!(wrapping_clock_ms(42), 42);
        assert_eq!(wrapping_clock_ms(u32::MAX as u64 + 1), 0);
        assert_eq!(wrapping_clock_ms(u32::MAX as u64 + 11), 10);
    }
}
