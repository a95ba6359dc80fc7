//! Measurement procedures built on the session manager.
//!
//! Each procedure names its pins, opens them through [`SessionManager::with_sessions`],
//! and talks to the instruments only through capability views, so the same procedure runs
//! against any driver the pin map assigns.

use crate::session::{InitOptions, SessionManager};
use hal_core::{
    DcVoltage, DcVoltageMeasureSettings, DcVoltageSourceSettings, DmmFunction, HalError,
    HalResult, MeasurementContext,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// Default pin for the sourcing instrument
pub const DEFAULT_SOURCE_PIN: &str = "NI_DCPower_Pin";

/// Default pin for the measuring instrument
pub const DEFAULT_MEASURE_PIN: &str = "NI_DMM_Pin";

// =============================================================================
// Source / Measure DC Voltage
// =============================================================================

/// Parameters for [`source_measure_dc_voltage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeasureDcVoltageParams {
    /// Pin driven by the source
    pub source_pin: String,
    /// Pin read by the meter
    pub measure_pin: String,
    /// Output settings for the source pin
    #[serde(default)]
    pub source: DcVoltageSourceSettings,
    /// Resolution for the measure pin
    pub resolution_digits: f64,
}

impl Default for SourceMeasureDcVoltageParams {
    fn default() -> Self {
        Self {
            source_pin: DEFAULT_SOURCE_PIN.to_string(),
            measure_pin: DEFAULT_MEASURE_PIN.to_string(),
            source: DcVoltageSourceSettings::default(),
            resolution_digits: 5.5,
        }
    }
}

impl SourceMeasureDcVoltageParams {
    fn validate(&self) -> HalResult<()> {
        if self.source_pin == self.measure_pin {
            return Err(HalError::InvalidParameter(format!(
                "Source and measure pins must differ (both '{}')",
                self.source_pin
            )));
        }
        if !self.resolution_digits.is_finite() || self.resolution_digits <= 0.0 {
            return Err(HalError::InvalidParameter(format!(
                "resolution_digits must be positive, got {}",
                self.resolution_digits
            )));
        }
        Ok(())
    }
}

/// Source a DC voltage on one pin and measure it on another.
///
/// The meter range follows the source's voltage range.
#[instrument(skip(manager, context), fields(source_pin = %params.source_pin, measure_pin = %params.measure_pin))]
pub async fn source_measure_dc_voltage(
    manager: &SessionManager,
    context: &MeasurementContext,
    params: &SourceMeasureDcVoltageParams,
    options: &InitOptions,
) -> HalResult<f64> {
    params.validate()?;
    let pins = vec![params.source_pin.clone(), params.measure_pin.clone()];
    let params = params.clone();
    let context = context.clone();

    let reading = manager
        .with_sessions(&pins, options, move |sessions| {
            Box::pin(async move {
                let source = sessions.sources::<DcVoltage>(&params.source_pin)?;
                let meter = sessions.measures::<DcVoltage>(&params.measure_pin)?;

                source.source(&params.source, &context).await?;
                meter
                    .measure(&DcVoltageMeasureSettings {
                        voltage_level_range: params.source.voltage_level_range,
                        resolution_digits: params.resolution_digits,
                    })
                    .await
            })
        })
        .await?;

    info!(reading, "Source/measure DC voltage complete");
    Ok(reading)
}

// =============================================================================
// DMM Measurement
// =============================================================================

/// Parameters for [`dmm_measurement`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmmMeasurementParams {
    /// Pin the DMM is mapped to
    pub pin: String,
    /// Measurement function
    pub function: DmmFunction,
    /// Range in the function's units
    pub range: f64,
    /// Resolution in digits
    pub resolution_digits: f64,
}

impl Default for DmmMeasurementParams {
    fn default() -> Self {
        Self {
            pin: DEFAULT_MEASURE_PIN.to_string(),
            function: DmmFunction::DcVolts,
            range: 10.0,
            resolution_digits: 5.5,
        }
    }
}

/// One DMM reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DmmReading {
    /// Measured value in the function's units
    pub value: f64,
    /// The instrument reported overrange (non-finite value)
    pub overrange: bool,
}

/// Configure a multimeter pin and take one reading.
#[instrument(skip(manager), fields(pin = %params.pin, function = %params.function))]
pub async fn dmm_measurement(
    manager: &SessionManager,
    params: &DmmMeasurementParams,
    options: &InitOptions,
) -> HalResult<DmmReading> {
    let pins = vec![params.pin.clone()];
    let params = params.clone();

    let value = manager
        .with_sessions(&pins, options, move |sessions| {
            Box::pin(async move {
                let dmm = sessions.multimeter(&params.pin)?;
                dmm.configure_measurement_digits(
                    params.function,
                    params.range,
                    params.resolution_digits,
                )
                .await?;
                dmm.read().await
            })
        })
        .await?;

    let reading = DmmReading {
        value,
        overrange: !value.is_finite(),
    };
    info!(value = reading.value, overrange = reading.overrange, "DMM measurement complete");
    Ok(reading)
}
