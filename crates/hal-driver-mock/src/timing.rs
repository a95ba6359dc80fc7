//! Timing configuration for the simulated instruments.
//!
//! The default is zero delay everywhere so unit tests run instantly. The presets add
//! hardware-like latencies for demos and soak runs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-driver simulated latencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay added to every call that talks to the instrument, in milliseconds
    #[serde(default)]
    pub communication_delay_ms: u64,
    /// Output settling time after initiate, in milliseconds (SMU)
    #[serde(default)]
    pub settling_time_ms: u64,
    /// Time one reading takes, in milliseconds (DMM)
    #[serde(default)]
    pub aperture_time_ms: u64,
}

impl TimingConfig {
    /// Timing for a PXI source-measure unit
    pub fn smu() -> Self {
        Self {
            communication_delay_ms: 1,
            settling_time_ms: 5,
            aperture_time_ms: 0,
        }
    }

    /// Timing for a PXI digital multimeter
    pub fn dmm() -> Self {
        Self {
            communication_delay_ms: 1,
            settling_time_ms: 0,
            aperture_time_ms: 20,
        }
    }

    /// Timing for a LAN/USB bench DMM
    pub fn bench_dmm() -> Self {
        Self {
            communication_delay_ms: 5,
            settling_time_ms: 0,
            aperture_time_ms: 40,
        }
    }

    /// Delay applied to every driver round trip.
    pub fn communication_delay(&self) -> Duration {
        Duration::from_millis(self.communication_delay_ms)
    }

    /// Time for a source output to settle after initiate.
    pub fn settling_time(&self) -> Duration {
        Duration::from_millis(self.settling_time_ms)
    }

    /// Integration time of one DMM reading.
    pub fn aperture_time(&self) -> Duration {
        Duration::from_millis(self.aperture_time_ms)
    }
}

/// Sleep for `delay`, skipping the timer entirely for zero.
pub(crate) async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_instant() {
        let timing = TimingConfig::default();
        assert!(timing.communication_delay().is_zero());
        assert!(timing.settling_time().is_zero());
        assert!(timing.aperture_time().is_zero());
    }

    #[test]
    fn presets_differ_by_instrument() {
        assert!(TimingConfig::smu().settling_time_ms > 0);
        assert_eq!(TimingConfig::dmm().settling_time_ms, 0);
        assert!(TimingConfig::bench_dmm().aperture_time_ms > TimingConfig::dmm().aperture_time_ms);
    }
}
