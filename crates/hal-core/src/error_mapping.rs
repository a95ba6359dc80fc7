//! Mapping from [`HalError`] to gRPC status for the hosting measurement service.
//!
//! - **InvalidArgument**: bad pin map entries or parameter values
//! - **NotFound**: unknown instrument type, pin outside the reservation
//! - **FailedPrecondition**: a session could not be brought up, capability missing
//! - **DeadlineExceeded** / **Cancelled**: wait outcomes recorded on the context
//! - **Unavailable**: hardware faults and reservation conflicts
//! - **Internal**: teardown failures

use crate::error::{DriverError, DriverErrorKind, HalError};
use std::str::FromStr;
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

const ERROR_KIND_HEADER: &str = "x-hal-error-kind";
const INSTRUMENT_TYPE_HEADER: &str = "x-hal-instrument-type";
const DRIVER_CODE_HEADER: &str = "x-hal-driver-code";

fn insert_metadata(metadata: &mut MetadataMap, key: &'static str, value: &str) {
    let ascii: String = value.chars().filter(char::is_ascii).collect();
    let trimmed = ascii.trim();
    let value = if trimmed.is_empty() { "unknown" } else { trimmed };
    if let Ok(val) = MetadataValue::from_str(value) {
        metadata.insert(key, val);
    }
}

fn driver_code(err: &DriverError) -> Code {
    match err.kind {
        DriverErrorKind::Configuration | DriverErrorKind::InvalidParameter => {
            Code::InvalidArgument
        }
        DriverErrorKind::Initialization => Code::FailedPrecondition,
        DriverErrorKind::Communication | DriverErrorKind::Hardware => Code::Unavailable,
        DriverErrorKind::Timeout => Code::DeadlineExceeded,
        DriverErrorKind::Shutdown | DriverErrorKind::Unknown => Code::Internal,
    }
}

impl HalError {
    /// Short label used in status metadata.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::UnknownInstrumentType { .. } => "unknown_instrument_type",
            Self::InvalidInstrumentTypeId => "invalid_instrument_type_id",
            Self::InitializationFailure { .. } => "initialization_failure",
            Self::CapabilityMismatch { .. } => "capability_mismatch",
            Self::PinNotReserved(_) => "pin_not_reserved",
            Self::UserTimeoutExpired(_) => "user_timeout_expired",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::HardwareFault(_) => "hardware_fault",
            Self::Reservation(_) => "reservation",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::Configuration(_) => "configuration",
            Self::TeardownFailed(_) => "teardown_failed",
        }
    }

    /// gRPC status code for this error.
    pub fn status_code(&self) -> Code {
        match self {
            Self::UnknownInstrumentType { .. } | Self::PinNotReserved(_) => Code::NotFound,
            Self::InvalidInstrumentTypeId
            | Self::InvalidParameter(_)
            | Self::Configuration(_) => Code::InvalidArgument,
            Self::InitializationFailure { .. } | Self::CapabilityMismatch { .. } => {
                Code::FailedPrecondition
            }
            Self::UserTimeoutExpired(_) | Self::DeadlineExceeded => Code::DeadlineExceeded,
            Self::Cancelled => Code::Cancelled,
            Self::HardwareFault(err) => driver_code(err),
            Self::Reservation(_) => Code::Unavailable,
            Self::TeardownFailed(_) => Code::Internal,
        }
    }
}

/// Map a [`HalError`] to a gRPC [`Status`] carrying the error kind and, for driver
/// errors, the instrument type and vendor code as metadata.
///
/// ```
/// use hal_core::{map_hal_error_to_status, HalError};
/// use tonic::Code;
///
/// let status = map_hal_error_to_status(&HalError::Cancelled);
/// assert_eq!(status.code(), Code::Cancelled);
/// ```
pub fn map_hal_error_to_status(err: &HalError) -> Status {
    let mut status = Status::new(err.status_code(), err.to_string());
    let metadata = status.metadata_mut();
    insert_metadata(metadata, ERROR_KIND_HEADER, err.kind_label());

    let driver = match err {
        HalError::HardwareFault(driver) => Some(driver),
        HalError::InitializationFailure { source, .. } => Some(source),
        _ => None,
    };
    if let Some(driver) = driver {
        insert_metadata(metadata, INSTRUMENT_TYPE_HEADER, &driver.instrument_type);
        if let Some(code) = driver.code {
            insert_metadata(metadata, DRIVER_CODE_HEADER, &code.to_string());
        }
    }
    status
}
