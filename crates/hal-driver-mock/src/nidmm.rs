//! Simulated NI-DMM driver.

use crate::device_server::SimulatedDeviceServer;
use crate::dmm::SimulatedDmm;
use crate::timing::TimingConfig;
use hal_core::{Capability, DmmFunction, DriverComponents, DriverFactory};
use std::sync::Arc;

/// Instrument type id served by this driver
pub const INSTRUMENT_TYPE_ID: &str = "niDMM";

/// Every NI-DMM function except `None`.
pub static NI_DMM_FUNCTIONS: &[DmmFunction] = &[
    DmmFunction::DcVolts,
    DmmFunction::AcVolts,
    DmmFunction::DcCurrent,
    DmmFunction::AcCurrent,
    DmmFunction::TwoWireRes,
    DmmFunction::FourWireRes,
    DmmFunction::Freq,
    DmmFunction::Period,
    DmmFunction::Temperature,
    DmmFunction::AcVoltsDcCoupled,
    DmmFunction::Diode,
    DmmFunction::WaveformVoltage,
    DmmFunction::WaveformCurrent,
    DmmFunction::Capacitance,
    DmmFunction::Inductance,
];

static NI_DMM_CAPABILITIES: &[Capability] = &[
    Capability::Initializable,
    Capability::MeasureDcVoltage,
    Capability::Multimeter,
];

/// Factory for NI-DMM sessions.
pub struct NiDmmFactory {
    server: Arc<SimulatedDeviceServer>,
    timing: TimingConfig,
}

impl NiDmmFactory {
    /// Factory for NI DMM drivers on `server`.
    pub fn new(server: Arc<SimulatedDeviceServer>) -> Self {
        Self {
            server,
            timing: TimingConfig::default(),
        }
    }

    /// Use `timing` for built drivers.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }
}

impl DriverFactory for NiDmmFactory {
    fn instrument_type_id(&self) -> &'static str {
        INSTRUMENT_TYPE_ID
    }

    fn name(&self) -> &'static str {
        "NI-DMM (simulated)"
    }

    fn capabilities(&self) -> &'static [Capability] {
        NI_DMM_CAPABILITIES
    }

    fn build(&self) -> DriverComponents {
        let dmm = Arc::new(
            SimulatedDmm::new(INSTRUMENT_TYPE_ID, NI_DMM_FUNCTIONS, Arc::clone(&self.server))
                .with_timing(self.timing),
        );
        DriverComponents::new(dmm.clone())
            .with_dc_voltage_measure(dmm.clone())
            .with_multimeter(dmm)
    }
}
