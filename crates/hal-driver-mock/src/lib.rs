//! Simulated instrument drivers for the measurement HAL.
//!
//! Every driver talks to a shared [`SimulatedDeviceServer`], which plays the vendor
//! session backend: named sessions that survive between clients, reset and option
//! handling, a fixture node the SMU drives and the DMMs read, and fault injection.
//!
//! # Available Drivers
//!
//! - [`NiDcPowerFactory`] (`niDCPower`) - source-measure unit: `Sources<DcVoltage>`,
//!   `Measures<DcVoltage>`
//! - [`NiDmmFactory`] (`niDMM`) - PXI multimeter: `Multimeter`, `Measures<DcVoltage>`
//! - [`KeysightDmmFactory`] (`KeysightDMM`) - bench multimeter over VISA: `Multimeter`,
//!   `Measures<DcVoltage>`
//!
//! # Driver Factory Pattern
//!
//! ```rust,ignore
//! use hal_driver_mock::{register_all, SimulatedDeviceServer};
//! use hal_hardware::DriverRegistry;
//!
//! let server = Arc::new(SimulatedDeviceServer::new());
//! let registry = DriverRegistry::new();
//! register_all(&registry, server, &HalConfig::default());
//! ```

pub mod device_server;
mod dmm;
mod keysight_dmm;
mod nidcpower;
mod nidmm;
pub mod timing;

pub use device_server::{
    DmmConfiguration, InstrumentState, OutputState, ServerEvent, SessionDisposition,
    SessionHandle, SimulatedDeviceServer, SimulatedInstrument,
};
pub use dmm::{SimulatedDmm, AUTO_RANGE};
pub use keysight_dmm::{KeysightDmmFactory, KEYSIGHT_DMM_FUNCTIONS};
pub use nidcpower::{
    DcPowerEvent, NiDcPowerFactory, SimulatedSmu, TIMEOUT_EXCEEDED, WAIT_FOR_EVENT_TIMEOUT,
};
pub use nidmm::{NiDmmFactory, NI_DMM_FUNCTIONS};
pub use timing::TimingConfig;

use hal_core::{FactoryRegistry, HalConfig};
use std::sync::Arc;

/// Register every simulated driver factory, with instant timing.
pub fn register_all(
    registry: &impl FactoryRegistry,
    server: Arc<SimulatedDeviceServer>,
    config: &HalConfig,
) {
    registry.register_factory(Box::new(NiDcPowerFactory::new(
        Arc::clone(&server),
        &config.wait,
    )));
    registry.register_factory(Box::new(NiDmmFactory::new(Arc::clone(&server))));
    registry.register_factory(Box::new(KeysightDmmFactory::new(
        server,
        &config.keysight_dmm,
    )));
}

/// Register every simulated driver factory with hardware-like latencies.
pub fn register_all_realistic(
    registry: &impl FactoryRegistry,
    server: Arc<SimulatedDeviceServer>,
    config: &HalConfig,
) {
    registry.register_factory(Box::new(
        NiDcPowerFactory::new(Arc::clone(&server), &config.wait).with_timing(TimingConfig::smu()),
    ));
    registry.register_factory(Box::new(
        NiDmmFactory::new(Arc::clone(&server)).with_timing(TimingConfig::dmm()),
    ));
    registry.register_factory(Box::new(
        KeysightDmmFactory::new(server, &config.keysight_dmm)
            .with_timing(TimingConfig::bench_dmm()),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal_core::DriverFactory;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collected(Mutex<Vec<&'static str>>);

    impl FactoryRegistry for Collected {
        fn register_factory(&self, factory: Box<dyn DriverFactory>) {
            self.0.lock().push(factory.instrument_type_id());
        }
    }

    #[test]
    fn register_all_covers_every_driver() {
        let registry = Collected::default();
        register_all(
            &registry,
            Arc::new(SimulatedDeviceServer::new()),
            &HalConfig::default(),
        );
        assert_eq!(
            *registry.0.lock(),
            vec!["niDCPower", "niDMM", "KeysightDMM"]
        );

        let realistic = Collected::default();
        register_all_realistic(
            &realistic,
            Arc::new(SimulatedDeviceServer::new()),
            &HalConfig::default(),
        );
        assert_eq!(realistic.0.lock().len(), 3);
    }
}
