//! Core types for the measurement hardware-abstraction layer.
//!
//! - [`capabilities`]: traits a driver may implement (`Initializable`, `Sources<S>`,
//!   `Measures<S>`, `Multimeter`) and the signal tags they are parameterized by
//! - [`driver`]: [`DriverFactory`] and the [`DriverComponents`] capability bag
//! - [`reservation`]: session descriptors and the reservation collaborator contract
//! - [`context`]: per-invocation deadline, cancellation and abort status
//! - [`wait`]: the event-wait arbiter used by sourcing drivers
//! - [`config`]: Figment-based configuration
//! - [`error`] and [`error_mapping`]: the error taxonomy and its gRPC status mapping

pub mod capabilities;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod error_mapping;
pub mod reservation;
pub mod wait;

pub use capabilities::{
    DcVoltage, DcVoltageMeasureSettings, DcVoltageSourceSettings, DmmFunction, Initializable,
    InitializeParams, Measures, Multimeter, Signal, Sources,
};
pub use config::{ConfigError, HalConfig, KeysightDmmConfig, WaitConfig};
pub use context::{AbortStatus, CancellationToken, MeasurementContext};
pub use driver::{Capability, DriverComponents, DriverFactory, FactoryRegistry};
pub use error::{DriverError, DriverErrorKind, HalError, HalResult};
pub use error_mapping::map_hal_error_to_status;
pub use reservation::{
    ChannelMapping, ConfigurationMap, InitializationBehavior, InstrumentTypeId, Reservation,
    SessionDescriptor, SessionReservationService,
};
pub use wait::{EventSource, EventWaitArbiter, WaitOutcome};
