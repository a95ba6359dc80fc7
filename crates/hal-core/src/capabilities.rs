//! Capability traits implemented by instrument drivers.
//!
//! A driver implements [`Initializable`] plus any subset of the signal capabilities.
//! Callers never see concrete driver types: they ask a pin for a capability view
//! (`Sources<DcVoltage>`, `Measures<DcVoltage>`, [`Multimeter`]) and get a trait object or a
//! [`HalError::CapabilityMismatch`].
//!
//! Signals are type-level tags. Each [`Signal`] names its settings and reading types and
//! knows how to pull its capability views out of a [`DriverComponents`] bag, so adding a
//! signal never touches the lifecycle manager.

use crate::context::MeasurementContext;
use crate::driver::{Capability, DriverComponents};
use crate::error::{DriverError, HalResult};
use crate::reservation::{ConfigurationMap, InitializationBehavior, SessionDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Session Lifecycle
// =============================================================================

/// Inputs to [`Initializable::initialize`].
#[derive(Debug, Clone, Copy)]
pub struct InitializeParams<'a> {
    /// Session to open
    pub descriptor: &'a SessionDescriptor,
    /// Reset the device before it is considered ready
    pub reset_device: bool,
    /// Driver options, applied before ready
    pub options: &'a ConfigurationMap,
    /// Create/attach and detach/close policy
    pub behavior: InitializationBehavior,
}

/// Scoped acquisition of a driver session.
///
/// # Contract
///
/// - `initialize` finishes every side effect (reset, option configuration) before it returns
///   `Ok`. A driver that returns `Err` holds no resource and will not see `release`.
/// - `release` is called exactly once after a successful `initialize`, on every exit path of
///   the owning scope. It detaches or closes according to the behavior passed at initialize.
#[async_trait]
pub trait Initializable: Send + Sync {
    /// Open the session described by `params`.
    async fn initialize(&self, params: InitializeParams<'_>) -> Result<(), DriverError>;

    /// Tear down the session opened by `initialize`.
    async fn release(&self) -> Result<(), DriverError>;
}

// =============================================================================
// Signals
// =============================================================================

/// Type-level tag for a kind of signal a driver can source or measure.
pub trait Signal: Sized + Send + Sync + 'static {
    /// Settings accepted by [`Sources::source`]
    type SourceSettings: fmt::Debug + Send + Sync;
    /// Settings accepted by [`Measures::measure`]
    type MeasureSettings: fmt::Debug + Send + Sync;
    /// One acquired reading
    type Reading: fmt::Debug + Send;

    /// Capability flag for sourcing this signal
    const SOURCE_CAPABILITY: Capability;
    /// Capability flag for measuring this signal
    const MEASURE_CAPABILITY: Capability;

    /// Sourcing view of a driver, if implemented.
    fn sources(components: &DriverComponents) -> Option<Arc<dyn Sources<Self>>>;

    /// Measuring view of a driver, if implemented.
    fn measures(components: &DriverComponents) -> Option<Arc<dyn Measures<Self>>>;
}

/// Applies an output of signal `S`.
///
/// # Contract
///
/// - Aborts any in-flight output on the same channels before applying new settings, so
///   calling `source` twice re-arms cleanly.
/// - Blocks until the output reports completion, with exactly one wait whose timeout is the
///   requested settle time plus a fixed safety margin.
/// - Errors do not tear the session down; the caller decides whether to abandon the scope.
#[async_trait]
pub trait Sources<S: Signal>: Send + Sync {
    /// Apply `settings` and block until the output has settled.
    async fn source(&self, settings: &S::SourceSettings, context: &MeasurementContext) -> HalResult<()>;
}

/// Acquires one reading of signal `S` from a live session.
#[async_trait]
pub trait Measures<S: Signal>: Send + Sync {
    /// Configure the measurement from `settings` and take one reading.
    async fn measure(&self, settings: &S::MeasureSettings) -> HalResult<S::Reading>;
}

/// DC voltage, in volts.
#[derive(Debug, Clone, Copy)]
pub struct DcVoltage;

/// Settings for sourcing a DC voltage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcVoltageSourceSettings {
    /// Output level in volts
    pub voltage_level: f64,
    /// Output range in volts
    pub voltage_level_range: f64,
    /// Compliance current in amps
    pub current_limit: f64,
    /// Compliance range in amps
    pub current_limit_range: f64,
    /// Settle time before the output reports completion
    #[serde(with = "duration_secs")]
    pub source_delay: Duration,
}

impl Default for DcVoltageSourceSettings {
    fn default() -> Self {
        Self {
            voltage_level: 6.0,
            voltage_level_range: 6.0,
            current_limit: 0.1,
            current_limit_range: 0.1,
            source_delay: Duration::ZERO,
        }
    }
}

/// Settings for measuring a DC voltage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DcVoltageMeasureSettings {
    /// Expected range in volts
    pub voltage_level_range: f64,
    /// Requested resolution in digits (e.g. 5.5)
    pub resolution_digits: f64,
}

impl Default for DcVoltageMeasureSettings {
    fn default() -> Self {
        Self {
            voltage_level_range: 10.0,
            resolution_digits: 5.5,
        }
    }
}

impl Signal for DcVoltage {
    type SourceSettings = DcVoltageSourceSettings;
    type MeasureSettings = DcVoltageMeasureSettings;
    type Reading = f64;

    const SOURCE_CAPABILITY: Capability = Capability::SourceDcVoltage;
    const MEASURE_CAPABILITY: Capability = Capability::MeasureDcVoltage;

    fn sources(components: &DriverComponents) -> Option<Arc<dyn Sources<Self>>> {
        components.dc_voltage_source.clone()
    }

    fn measures(components: &DriverComponents) -> Option<Arc<dyn Measures<Self>>> {
        components.dc_voltage_measure.clone()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Multimeter
// =============================================================================

/// Measurement function of a digital multimeter.
///
/// Discriminants are the vendor function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmmFunction {
    /// No function selected
    None = 0,
    /// DC voltage
    DcVolts = 1,
    /// AC voltage, AC-coupled
    AcVolts = 2,
    /// DC current
    DcCurrent = 3,
    /// AC current
    AcCurrent = 4,
    /// Two-wire resistance
    TwoWireRes = 5,
    /// Four-wire resistance
    FourWireRes = 101,
    /// Frequency
    Freq = 104,
    /// Period
    Period = 105,
    /// Temperature
    Temperature = 108,
    /// AC voltage, DC-coupled
    AcVoltsDcCoupled = 1001,
    /// Diode forward voltage
    Diode = 1002,
    /// Voltage waveform acquisition
    WaveformVoltage = 1003,
    /// Current waveform acquisition
    WaveformCurrent = 1004,
    /// Capacitance
    Capacitance = 1005,
    /// Inductance
    Inductance = 1006,
}

impl DmmFunction {
    /// Every function, in code order.
    pub const ALL: [DmmFunction; 16] = [
        Self::None,
        Self::DcVolts,
        Self::AcVolts,
        Self::DcCurrent,
        Self::AcCurrent,
        Self::TwoWireRes,
        Self::FourWireRes,
        Self::Freq,
        Self::Period,
        Self::Temperature,
        Self::AcVoltsDcCoupled,
        Self::Diode,
        Self::WaveformVoltage,
        Self::WaveformCurrent,
        Self::Capacitance,
        Self::Inductance,
    ];

    /// Vendor function code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Event for a driver event code, if known.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == code)
    }

    /// Driver name of the event.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::DcVolts => "dc_volts",
            Self::AcVolts => "ac_volts",
            Self::DcCurrent => "dc_current",
            Self::AcCurrent => "ac_current",
            Self::TwoWireRes => "two_wire_res",
            Self::FourWireRes => "four_wire_res",
            Self::Freq => "freq",
            Self::Period => "period",
            Self::Temperature => "temperature",
            Self::AcVoltsDcCoupled => "ac_volts_dc_coupled",
            Self::Diode => "diode",
            Self::WaveformVoltage => "waveform_voltage",
            Self::WaveformCurrent => "waveform_current",
            Self::Capacitance => "capacitance",
            Self::Inductance => "inductance",
        }
    }
}

impl fmt::Display for DmmFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DmmFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|f| f.name() == wanted)
            .ok_or_else(|| format!("Unknown DMM function '{}'", s))
    }
}

/// Function-configured DMM acquisition.
#[async_trait]
pub trait Multimeter: Send + Sync {
    /// Functions this instrument accepts.
    fn supported_functions(&self) -> &'static [DmmFunction];

    /// Select the function, range and resolution for subsequent reads.
    ///
    /// Unsupported functions fail with [`crate::HalError::InvalidParameter`].
    async fn configure_measurement_digits(
        &self,
        function: DmmFunction,
        range: f64,
        resolution_digits: f64,
    ) -> HalResult<()>;

    /// Take one reading with the current configuration.
    ///
    /// An overrange reading is returned as a non-finite value.
    async fn read(&self) -> HalResult<f64>;
}
