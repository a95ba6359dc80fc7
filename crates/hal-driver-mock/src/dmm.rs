//! Simulated digital multimeter shared by the NI-DMM and Keysight DMM drivers.
//!
//! The two families differ only in instrument type, accepted functions and how the
//! resource name is resolved; the reading model is the same. DC voltage reads the fixture
//! node driven by the SMU. Functions the fixture does not drive read an idle input (0).
//! A reading beyond the configured range comes back as NaN.

use crate::device_server::{DmmConfiguration, SessionSlot, SimulatedDeviceServer};
use crate::timing::{pause, TimingConfig};
use async_trait::async_trait;
use hal_core::{
    DcVoltage, DcVoltageMeasureSettings, DmmFunction, DriverError, DriverErrorKind, HalError,
    HalResult, Initializable, InitializationBehavior, InitializeParams, Measures, Multimeter,
};
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Range value selecting auto-ranging
pub const AUTO_RANGE: f64 = -1.0;

const RESOLUTION_DIGITS: RangeInclusive<f64> = 3.5..=7.5;

/// One DMM session backed by the simulated device server.
pub struct SimulatedDmm {
    instrument_type: &'static str,
    supported: &'static [DmmFunction],
    grpc_address: Option<String>,
    server: Arc<SimulatedDeviceServer>,
    timing: TimingConfig,
    session: SessionSlot,
}

impl SimulatedDmm {
    /// DMM driver of `instrument_type` supporting `supported` functions.
    pub fn new(
        instrument_type: &'static str,
        supported: &'static [DmmFunction],
        server: Arc<SimulatedDeviceServer>,
    ) -> Self {
        Self {
            instrument_type,
            supported,
            grpc_address: None,
            server,
            timing: TimingConfig::default(),
            session: SessionSlot::default(),
        }
    }

    /// Use `timing` for device latencies.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Route sessions through a remote session server at `address`.
    pub fn with_grpc_address(mut self, address: Option<String>) -> Self {
        self.grpc_address = address.filter(|a| !a.trim().is_empty());
        self
    }

    /// Resource name the session connects to.
    ///
    /// Through a session server the resource carries the session name and initialization
    /// behavior so the server can share the session between clients.
    pub fn resource_name_for(
        &self,
        resource_name: &str,
        session_name: &str,
        behavior: InitializationBehavior,
    ) -> String {
        match &self.grpc_address {
            Some(address) => format!(
                "grpc://{address}/{resource_name}?session-name={session_name}\
                 &session-initialization-behavior={}",
                behavior_query_value(behavior)
            ),
            None => resource_name.to_string(),
        }
    }

    fn driver_error(&self, kind: DriverErrorKind, message: impl Into<String>) -> DriverError {
        DriverError::new(self.instrument_type, kind, message)
    }

    fn validate(&self, function: DmmFunction, range: f64, resolution_digits: f64) -> HalResult<()> {
        if !self.supported.contains(&function) {
            return Err(HalError::InvalidParameter(format!(
                "{} does not support function '{}'",
                self.instrument_type, function
            )));
        }
        if !(range.is_finite() && (range > 0.0 || range == AUTO_RANGE)) {
            return Err(HalError::InvalidParameter(format!(
                "range must be positive or {AUTO_RANGE} for auto-range, got {range}"
            )));
        }
        if !RESOLUTION_DIGITS.contains(&resolution_digits) {
            return Err(HalError::InvalidParameter(format!(
                "resolution_digits must be within {:?}, got {resolution_digits}",
                RESOLUTION_DIGITS
            )));
        }
        Ok(())
    }

    fn simulate_reading(&self, config: DmmConfiguration) -> f64 {
        let raw = match config.function {
            DmmFunction::DcVolts | DmmFunction::AcVoltsDcCoupled => self.server.node_voltage(),
            _ => 0.0,
        };
        if config.range == AUTO_RANGE {
            return raw;
        }
        if raw.abs() > config.range {
            return f64::NAN;
        }
        quantize(raw, config.range, config.resolution_digits)
    }
}

fn behavior_query_value(behavior: InitializationBehavior) -> &'static str {
    match behavior {
        InitializationBehavior::Auto => "auto",
        InitializationBehavior::CreateNew => "initialize-new",
        InitializationBehavior::AttachExisting => "attach-to-existing",
        InitializationBehavior::InitializeThenDetach => "initialize-then-detach",
        InitializationBehavior::AttachThenClose => "attach-then-close",
    }
}

/// Round `value` to the resolution `digits` give on `range`.
fn quantize(value: f64, range: f64, digits: f64) -> f64 {
    let step = range / 10f64.powf(digits.floor());
    (value / step).round() * step
}

#[async_trait]
impl Initializable for SimulatedDmm {
    async fn initialize(&self, params: InitializeParams<'_>) -> Result<(), DriverError> {
        if self.session.is_open() {
            return Err(self.driver_error(
                DriverErrorKind::Initialization,
                "Session is already initialized",
            ));
        }
        let resource_name = self.resource_name_for(
            &params.descriptor.resource_name,
            &params.descriptor.session_name,
            params.behavior,
        );
        debug!(instrument_type = self.instrument_type, %resource_name, "Opening DMM session");
        pause(self.timing.communication_delay()).await;
        let handle = self
            .server
            .open(self.instrument_type, &resource_name, params)?;
        self.session.fill(handle);
        Ok(())
    }

    async fn release(&self) -> Result<(), DriverError> {
        if !self.session.is_open() {
            return Ok(());
        }
        pause(self.timing.communication_delay()).await;
        let Some(handle) = self.session.take() else {
            return Ok(());
        };
        self.server.release(&handle)
    }
}

#[async_trait]
impl Multimeter for SimulatedDmm {
    fn supported_functions(&self) -> &'static [DmmFunction] {
        self.supported
    }

    #[instrument(skip(self))]
    async fn configure_measurement_digits(
        &self,
        function: DmmFunction,
        range: f64,
        resolution_digits: f64,
    ) -> HalResult<()> {
        self.validate(function, range, resolution_digits)?;
        let instrument = self.session.instrument(self.instrument_type)?;
        pause(self.timing.communication_delay()).await;
        instrument.update(|s| {
            s.dmm = DmmConfiguration {
                function,
                range,
                resolution_digits,
            }
        });
        Ok(())
    }

    async fn read(&self) -> HalResult<f64> {
        let instrument = self.session.instrument(self.instrument_type)?;
        pause(self.timing.communication_delay() + self.timing.aperture_time()).await;
        Ok(self.simulate_reading(instrument.dmm_configuration()))
    }
}

#[async_trait]
impl Measures<DcVoltage> for SimulatedDmm {
    async fn measure(&self, settings: &DcVoltageMeasureSettings) -> HalResult<f64> {
        self.configure_measurement_digits(
            DmmFunction::DcVolts,
            settings.voltage_level_range,
            settings.resolution_digits,
        )
        .await?;
        self.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal_core::{ConfigurationMap, InitializationBehavior, SessionDescriptor};

    const FUNCTIONS: &[DmmFunction] = &[DmmFunction::DcVolts, DmmFunction::TwoWireRes];

    async fn opened(server: &Arc<SimulatedDeviceServer>) -> SimulatedDmm {
        let dmm = SimulatedDmm::new("testDMM", FUNCTIONS, Arc::clone(server));
        let descriptor = SessionDescriptor::new("DMM1", "Dev1", "testDMM");
        let options = ConfigurationMap::new();
        dmm.initialize(InitializeParams {
            descriptor: &descriptor,
            reset_device: false,
            options: &options,
            behavior: InitializationBehavior::Auto,
        })
        .await
        .unwrap();
        dmm
    }

    #[tokio::test]
    async fn reads_fixture_node_at_resolution() {
        let server = Arc::new(SimulatedDeviceServer::new());
        server.set_node_voltage(1.234_567);
        let dmm = opened(&server).await;

        dmm.configure_measurement_digits(DmmFunction::DcVolts, 10.0, 4.5)
            .await
            .unwrap();
        let value = dmm.read().await.unwrap();
        assert!((value - 1.235).abs() < 1e-9, "got {value}");

        dmm.configure_measurement_digits(DmmFunction::TwoWireRes, 100.0, 5.5)
            .await
            .unwrap();
        assert_eq!(dmm.read().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn overrange_reads_nan() {
        let server = Arc::new(SimulatedDeviceServer::new());
        server.set_node_voltage(12.0);
        let dmm = opened(&server).await;

        let value = dmm
            .measure(&DcVoltageMeasureSettings {
                voltage_level_range: 10.0,
                resolution_digits: 5.5,
            })
            .await
            .unwrap();
        assert!(value.is_nan());

        dmm.configure_measurement_digits(DmmFunction::DcVolts, AUTO_RANGE, 5.5)
            .await
            .unwrap();
        assert_eq!(dmm.read().await.unwrap(), 12.0);
    }

    #[tokio::test]
    async fn rejects_unsupported_function_and_bad_digits() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let dmm = opened(&server).await;

        let err = dmm
            .configure_measurement_digits(DmmFunction::Capacitance, 1e-6, 5.5)
            .await
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(msg) if msg.contains("capacitance")));

        assert!(dmm
            .configure_measurement_digits(DmmFunction::DcVolts, 10.0, 9.5)
            .await
            .is_err());
        assert!(dmm
            .configure_measurement_digits(DmmFunction::DcVolts, 0.0, 5.5)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn read_before_initialize_is_a_hardware_fault() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let dmm = SimulatedDmm::new("testDMM", FUNCTIONS, server);
        assert!(matches!(dmm.read().await, Err(HalError::HardwareFault(_))));
    }

    #[test]
    fn grpc_address_rewrites_resource_name() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let local = SimulatedDmm::new("testDMM", FUNCTIONS, Arc::clone(&server));
        assert_eq!(
            local.resource_name_for("USB0::1", "DMM1", InitializationBehavior::Auto),
            "USB0::1"
        );

        let remote = SimulatedDmm::new("testDMM", FUNCTIONS, server)
            .with_grpc_address(Some("localhost:31763".into()));
        assert_eq!(
            remote.resource_name_for("USB0::1", "DMM1", InitializationBehavior::Auto),
            "grpc://localhost:31763/USB0::1?session-name=DMM1&session-initialization-behavior=auto"
        );
        assert_eq!(
            remote.resource_name_for("USB0::1", "DMM1", InitializationBehavior::AttachThenClose),
            "grpc://localhost:31763/USB0::1?session-name=DMM1\
             &session-initialization-behavior=attach-then-close"
        );
    }
}
