//! Driver factories and capability bags.
//!
//! Drivers implement [`DriverFactory`] and are registered with the driver registry at
//! startup. Resolving an instrument type id yields a factory whose [`DriverFactory::build`]
//! returns a fresh, uninitialized driver packaged as [`DriverComponents`].
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Composition root                            │
//! │  registry.register_factory(NiDmmFactory..)   │
//! └──────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │  DriverRegistry                              │
//! │  instrument_type_id -> Arc<dyn DriverFactory>│
//! └──────────────────────────────────────────────┘
//!                       │  resolve + build
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │  DriverComponents                            │
//! │  initializable + optional capability views   │
//! └──────────────────────────────────────────────┘
//! ```

use crate::capabilities::{DcVoltage, Initializable, Measures, Multimeter, Sources};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Capability Enum (Runtime Introspection)
// =============================================================================

/// Runtime capability flags, mirroring the capability traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Corresponds to [`crate::capabilities::Initializable`]
    Initializable,
    /// Corresponds to `Sources<DcVoltage>`
    SourceDcVoltage,
    /// Corresponds to `Measures<DcVoltage>`
    MeasureDcVoltage,
    /// Corresponds to [`crate::capabilities::Multimeter`]
    Multimeter,
}

impl Capability {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initializable => "Initializable",
            Self::SourceDcVoltage => "Sources<DcVoltage>",
            Self::MeasureDcVoltage => "Measures<DcVoltage>",
            Self::Multimeter => "Multimeter",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Driver Components (Capability Bag)
// =============================================================================

/// Capability trait objects for one driver instance.
///
/// Every driver can be initialized; the remaining views are optional. A driver usually
/// hands the same `Arc` to several slots.
///
/// ```rust,ignore
/// let driver = Arc::new(SimulatedSmu::new(server));
/// let components = DriverComponents::new(driver.clone())
///     .with_dc_voltage_source(driver.clone())
///     .with_dc_voltage_measure(driver);
/// ```
#[derive(Clone)]
pub struct DriverComponents {
    /// Session acquisition and release
    pub initializable: Arc<dyn Initializable>,

    /// DC voltage output
    pub dc_voltage_source: Option<Arc<dyn Sources<DcVoltage>>>,

    /// DC voltage acquisition
    pub dc_voltage_measure: Option<Arc<dyn Measures<DcVoltage>>>,

    /// Function-configured DMM reads
    pub multimeter: Option<Arc<dyn Multimeter>>,
}

impl DriverComponents {
    /// Components exposing only initialize/release; add capabilities with the `with_*` builders.
    pub fn new(initializable: Arc<dyn Initializable>) -> Self {
        Self {
            initializable,
            dc_voltage_source: None,
            dc_voltage_measure: None,
            multimeter: None,
        }
    }

    /// Capabilities this driver instance supports.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::Initializable];
        if self.dc_voltage_source.is_some() {
            caps.push(Capability::SourceDcVoltage);
        }
        if self.dc_voltage_measure.is_some() {
            caps.push(Capability::MeasureDcVoltage);
        }
        if self.multimeter.is_some() {
            caps.push(Capability::Multimeter);
        }
        caps
    }

    /// Expose DC voltage sourcing.
    pub fn with_dc_voltage_source(mut self, s: Arc<dyn Sources<DcVoltage>>) -> Self {
        self.dc_voltage_source = Some(s);
        self
    }

    /// Expose DC voltage measurement.
    pub fn with_dc_voltage_measure(mut self, m: Arc<dyn Measures<DcVoltage>>) -> Self {
        self.dc_voltage_measure = Some(m);
        self
    }

    /// Expose multimeter operations.
    pub fn with_multimeter(mut self, m: Arc<dyn Multimeter>) -> Self {
        self.multimeter = Some(m);
        self
    }
}

impl fmt::Debug for DriverComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverComponents")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// =============================================================================
// Driver Factory
// =============================================================================

/// Constructor for one driver family.
///
/// `build` must be pure: it allocates an uninitialized driver and performs no I/O. All
/// hardware access happens in [`Initializable::initialize`]. Two calls to `build` yield
/// behaviorally identical instances.
pub trait DriverFactory: Send + Sync + 'static {
    /// Instrument type id this factory serves (e.g. `"niDMM"`).
    fn instrument_type_id(&self) -> &'static str;

    /// Human-readable name
    fn name(&self) -> &'static str;

    /// Capabilities every built instance provides.
    fn capabilities(&self) -> &'static [Capability];

    /// Build a fresh, uninitialized driver.
    fn build(&self) -> DriverComponents;
}

/// Registries that accept driver factories.
///
/// Lets driver crates offer a `register_all` without depending on the registry crate.
pub trait FactoryRegistry {
    /// Register a driver factory.
    fn register_factory(&self, factory: Box<dyn DriverFactory>);
}
