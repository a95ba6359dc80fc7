//! Simulated Keysight DMM driver.
//!
//! Bench DMMs are reached over VISA. With `simulate` off and a session server address
//! configured, sessions are opened through a `grpc://` resource so they can be shared the
//! same way as PXI sessions. In simulate mode the resource name is used as given.

use crate::device_server::SimulatedDeviceServer;
use crate::dmm::SimulatedDmm;
use crate::timing::TimingConfig;
use hal_core::{Capability, DmmFunction, DriverComponents, DriverFactory, KeysightDmmConfig};
use std::sync::Arc;
use tracing::debug;

/// Instrument type id served by this driver
pub const INSTRUMENT_TYPE_ID: &str = "KeysightDMM";

/// Functions the Keysight driver accepts
pub static KEYSIGHT_DMM_FUNCTIONS: &[DmmFunction] = &[
    DmmFunction::DcVolts,
    DmmFunction::AcVolts,
    DmmFunction::DcCurrent,
    DmmFunction::AcCurrent,
    DmmFunction::TwoWireRes,
    DmmFunction::FourWireRes,
    DmmFunction::Freq,
    DmmFunction::Period,
    DmmFunction::Temperature,
    DmmFunction::Diode,
    DmmFunction::Capacitance,
];

static KEYSIGHT_DMM_CAPABILITIES: &[Capability] = &[
    Capability::Initializable,
    Capability::MeasureDcVoltage,
    Capability::Multimeter,
];

/// Factory for Keysight DMM sessions.
pub struct KeysightDmmFactory {
    server: Arc<SimulatedDeviceServer>,
    grpc_address: Option<String>,
    timing: TimingConfig,
}

impl KeysightDmmFactory {
    /// Factory for Keysight DMM drivers configured by `config`.
    pub fn new(server: Arc<SimulatedDeviceServer>, config: &KeysightDmmConfig) -> Self {
        let grpc_address = if config.simulate {
            debug!("Not using a session server due to simulation");
            None
        } else {
            config.grpc_address.clone()
        };
        Self {
            server,
            grpc_address,
            timing: TimingConfig::default(),
        }
    }

    /// Use `timing` for built drivers.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }
}

impl DriverFactory for KeysightDmmFactory {
    fn instrument_type_id(&self) -> &'static str {
        INSTRUMENT_TYPE_ID
    }

    fn name(&self) -> &'static str {
        "Keysight DMM (simulated)"
    }

    fn capabilities(&self) -> &'static [Capability] {
        KEYSIGHT_DMM_CAPABILITIES
    }

    fn build(&self) -> DriverComponents {
        let dmm = Arc::new(
            SimulatedDmm::new(
                INSTRUMENT_TYPE_ID,
                KEYSIGHT_DMM_FUNCTIONS,
                Arc::clone(&self.server),
            )
            .with_grpc_address(self.grpc_address.clone())
            .with_timing(self.timing),
        );
        DriverComponents::new(dmm.clone())
            .with_dc_voltage_measure(dmm.clone())
            .with_multimeter(dmm)
    }
}
