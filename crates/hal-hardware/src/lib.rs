//! Runtime side of the measurement HAL.
//!
//! - [`registry`]: instrument type id to driver factory resolution
//! - [`session`]: the session lifecycle manager and its pin map
//! - [`pin_map`]: pin map files and an in-process reservation service
//! - [`measurements`]: measurement procedures written against capability views

pub mod measurements;
pub mod pin_map;
pub mod registry;
pub mod session;

pub use measurements::{
    dmm_measurement, source_measure_dc_voltage, DmmMeasurementParams, DmmReading,
    SourceMeasureDcVoltageParams,
};
pub use pin_map::{InMemoryReservationService, PinMap};
pub use registry::{DriverConstructor, DriverRegistry, FactoryInfo};
pub use session::{InitOptions, InstrumentSession, PinSessionMap, SessionManager, SessionScope};
