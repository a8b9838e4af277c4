//! Virtual time for deterministic simulations.

use std::fmt;
use std::ops::Add;
use std::time::Duration;

use crate::SimulationError;

/// Point in virtual time, measured from the start of the simulation.
///
/// Independent of the wall clock. Displays as `seconds.millis`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(Duration);

impl SimTime {
    /// Simulation start.
    pub const ZERO: SimTime = SimTime(Duration::ZERO);

    /// Creates a time point at the given offset from simulation start.
    pub fn from_duration(offset: Duration) -> Self {
        Self(offset)
    }

    /// Returns the offset from simulation start.
    pub fn as_duration(self) -> Duration {
        self.0
    }

    /// Returns the offset from simulation start in whole milliseconds.
    pub fn as_millis(self) -> u64 {
        self.0.as_millis() as u64
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: SimTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> SimTime {
        SimTime(self.0 + rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self.as_millis();
        write!(f, "{}.{:03}", millis / 1000, millis % 1000)
    }
}

/// Deterministic clock for simulation time control.
///
/// Time can only move forward and is independent of wall-clock time.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    current_time: SimTime,
}

impl VirtualClock {
    /// Creates new clock starting at simulation time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns current simulation time.
    pub fn now(&self) -> SimTime {
        self.current_time
    }

    /// Returns elapsed time since simulation start.
    pub fn elapsed(&self) -> Duration {
        self.current_time.as_duration()
    }

    /// Advances simulation time to a specific point.
    ///
    /// # Errors
    ///
    /// - `SimulationError::InvalidEventScheduling` - If target time is in the past
    pub fn advance_to(&mut self, target: SimTime) -> Result<(), SimulationError> {
        if target < self.current_time {
            return Err(SimulationError::InvalidEventScheduling {
                reason: "Cannot advance time backwards".to_string(),
            });
        }
        self.current_time = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_advancement() {
        let mut clock = VirtualClock::new();
        let start = clock.now();

        clock.advance_to(start + Duration::from_secs(10)).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(10));

        // staying put is allowed
        clock.advance_to(clock.now()).unwrap();
        clock.advance_to(clock.now() + Duration::from_millis(1500)).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_millis(11_500));
        assert!(clock.now() > start);
    }

    #[test]
    fn test_clock_cannot_go_backwards() {
        let mut clock = VirtualClock::new();
        clock
            .advance_to(SimTime::from_duration(Duration::from_secs(10)))
            .unwrap();

        let result = clock.advance_to(SimTime::from_duration(Duration::from_secs(5)));
        assert!(result.is_err());
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_sim_time_display() {
        assert_eq!(SimTime::ZERO.to_string(), "0.000");
        let t = SimTime::from_duration(Duration::from_millis(12_345));
        assert_eq!(t.to_string(), "12.345");
    }

    #[test]
    fn test_saturating_duration_since() {
        let early = SimTime::from_duration(Duration::from_secs(1));
        let late = SimTime::from_duration(Duration::from_secs(3));
        assert_eq!(late.saturating_duration_since(early), Duration::from_secs(2));
        assert_eq!(early.saturating_duration_since(late), Duration::ZERO);
    }
}
