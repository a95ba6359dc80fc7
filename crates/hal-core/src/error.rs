//! Error types for the measurement HAL.
//!
//! Two layers of errors exist:
//!
//! - **[`DriverError`]**: what a driver backend reports. It carries the instrument type, a
//!   coarse [`DriverErrorKind`], the vendor status code when one exists, and a message.
//! - **[`HalError`]**: what callers of the HAL see. Every failure surfaces as exactly one
//!   specific variant so the topmost caller can map it to an external status
//!   (see [`crate::error_mapping`]). There is no catch-all variant.
//!
//! Driver errors that happen while a batch of sessions is being opened are wrapped in
//! [`HalError::InitializationFailure`]; driver errors during steady-state use (source,
//! measure, wait) become [`HalError::HardwareFault`].

use crate::config::ConfigError;
use crate::driver::Capability;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Coarse classification of a driver-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Opening or attaching the session failed
    Initialization,
    /// A setting was rejected by the device
    Configuration,
    /// The device or session server did not answer
    Communication,
    /// Closing or detaching the session failed
    Shutdown,
    /// The device reported a fault
    Hardware,
    /// A device wait ran out of time
    Timeout,
    /// An argument was out of range
    InvalidParameter,
    /// Anything else
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error reported by a driver backend.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{instrument_type}' {kind} error{}: {message}", code_suffix(.code))]
pub struct DriverError {
    /// Instrument type id of the reporting driver
    pub instrument_type: String,
    /// Coarse classification
    pub kind: DriverErrorKind,
    /// Vendor status code, if the backend reported one
    pub code: Option<i32>,
    /// Human-readable detail
    pub message: String,
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" ({c})")).unwrap_or_default()
}

impl DriverError {
    /// Driver error for `instrument_type`.
    pub fn new(
        instrument_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instrument_type: instrument_type.into(),
            kind,
            code: None,
            message: message.into(),
        }
    }

    /// Attach a vendor status code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// True when the backend classified this as its own timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind == DriverErrorKind::Timeout
    }
}

// =============================================================================
// HAL Errors
// =============================================================================

/// Convenience alias for results using [`HalError`].
pub type HalResult<T> = std::result::Result<T, HalError>;

/// Error surfaced to callers of the HAL.
#[derive(Error, Debug)]
pub enum HalError {
    /// No driver is registered for the instrument type id.
    ///
    /// Instrument type ids come from external pin maps, which may name hardware this
    /// process was not built with. Recoverable: fix the pin map or register the driver.
    #[error("No driver registered for instrument type '{instrument_type_id}'. Available: {}", .available.join(", "))]
    UnknownInstrumentType {
        instrument_type_id: String,
        available: Vec<String>,
    },

    /// The instrument type id was empty or blank.
    #[error("Instrument type id must not be empty")]
    InvalidInstrumentTypeId,

    /// A driver failed to bring its session to the ready state.
    ///
    /// Sessions opened earlier in the same batch have already been released when
    /// this error reaches the caller. The driver error is carried unchanged.
    #[error("Failed to initialize session '{session_name}' ({instrument_type_id}): {source}")]
    InitializationFailure {
        instrument_type_id: String,
        session_name: String,
        #[source]
        source: DriverError,
    },

    /// The caller asked a pin for a capability its driver does not implement.
    #[error("Pin '{pin}' is backed by '{instrument_type_id}', which does not support {capability}")]
    CapabilityMismatch {
        pin: String,
        instrument_type_id: String,
        capability: Capability,
    },

    /// The pin is not part of the reservation backing this scope.
    #[error("Pin '{0}' is not part of this reservation")]
    PinNotReserved(String),

    /// The operation's own timeout elapsed before the awaited event.
    #[error("Timed out after {0:?} waiting for the instrument")]
    UserTimeoutExpired(Duration),

    /// The caller-imposed deadline passed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The caller requested cancellation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A driver reported an error other than its own poll timeout.
    ///
    /// Never retried by the HAL.
    #[error("Hardware fault: {0}")]
    HardwareFault(#[from] DriverError),

    /// The reservation collaborator refused or failed a request.
    #[error("Reservation error: {0}")]
    Reservation(String),

    /// A caller-supplied value was outside its valid domain.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// One or more sessions failed to release.
    ///
    /// Teardown keeps going after a failed release, so every session gets its chance
    /// and all failures are reported together.
    #[error("Session teardown failed with {} error(s): {}", .0.len(), summarize(.0))]
    TeardownFailed(Vec<HalError>),
}

fn summarize(errors: &[HalError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl HalError {
    /// True for the two "too slow" outcomes, as opposed to [`HalError::Cancelled`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::UserTimeoutExpired(_) | Self::DeadlineExceeded)
    }
}

impl From<ConfigError> for HalError {
    fn from(err: ConfigError) -> Self {
        HalError::Configuration(err.to_string())
    }
}
