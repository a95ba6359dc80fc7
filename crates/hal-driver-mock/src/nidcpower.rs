//! Simulated NI-DCPower source-measure unit.
//!
//! Sourcing follows the instrument's sequence: abort, configure levels and limits,
//! initiate, then wait for the source-complete event through the [`EventWaitArbiter`], so
//! a stalled output still honors the caller's deadline and cancellation.

use crate::device_server::{OutputState, SessionSlot, SimulatedDeviceServer};
use crate::timing::{pause, TimingConfig};
use async_trait::async_trait;
use hal_core::{
    Capability, DcVoltage, DcVoltageMeasureSettings, DcVoltageSourceSettings, DriverComponents,
    DriverError, DriverErrorKind, DriverFactory, EventSource, EventWaitArbiter, HalError,
    HalResult, Initializable, InitializeParams, MeasurementContext, Measures, Sources, WaitConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

/// Instrument type id served by this driver
pub const INSTRUMENT_TYPE_ID: &str = "niDCPower";

/// `wait_for_event` gave up before the event fired
pub const WAIT_FOR_EVENT_TIMEOUT: i32 = -1074116059;

/// Maximum time exceeded before the operation completed
pub const TIMEOUT_EXCEEDED: i32 = -1074097933;

const TIMEOUT_ERROR_CODES: [i32; 2] = [WAIT_FOR_EVENT_TIMEOUT, TIMEOUT_EXCEEDED];

/// Events the SMU can wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcPowerEvent {
    /// Output reached its programmed level
    SourceComplete,
}

// =============================================================================
// NiDcPowerFactory - DriverFactory implementation
// =============================================================================

static NI_DCPOWER_CAPABILITIES: &[Capability] = &[
    Capability::Initializable,
    Capability::SourceDcVoltage,
    Capability::MeasureDcVoltage,
];

/// Factory for [`SimulatedSmu`] instances.
pub struct NiDcPowerFactory {
    server: Arc<SimulatedDeviceServer>,
    arbiter: EventWaitArbiter,
    source_timeout_margin: Duration,
    timing: TimingConfig,
}

impl NiDcPowerFactory {
    /// Factory for NI DC power drivers waiting per `wait`.
    pub fn new(server: Arc<SimulatedDeviceServer>, wait: &WaitConfig) -> Self {
        Self {
            server,
            arbiter: EventWaitArbiter::from_config(wait),
            source_timeout_margin: wait.source_timeout_margin(),
            timing: TimingConfig::default(),
        }
    }

    /// Use `timing` for built drivers.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }
}

impl DriverFactory for NiDcPowerFactory {
    fn instrument_type_id(&self) -> &'static str {
        INSTRUMENT_TYPE_ID
    }

    fn name(&self) -> &'static str {
        "NI-DCPower (simulated)"
    }

    fn capabilities(&self) -> &'static [Capability] {
        NI_DCPOWER_CAPABILITIES
    }

    fn build(&self) -> DriverComponents {
        let smu = Arc::new(SimulatedSmu {
            server: Arc::clone(&self.server),
            arbiter: self.arbiter,
            source_timeout_margin: self.source_timeout_margin,
            timing: self.timing,
            session: SessionSlot::default(),
        });
        DriverComponents::new(smu.clone())
            .with_dc_voltage_source(smu.clone())
            .with_dc_voltage_measure(smu)
    }
}

// =============================================================================
// SimulatedSmu
// =============================================================================

/// One NI-DCPower session backed by the simulated device server.
pub struct SimulatedSmu {
    server: Arc<SimulatedDeviceServer>,
    arbiter: EventWaitArbiter,
    source_timeout_margin: Duration,
    timing: TimingConfig,
    session: SessionSlot,
}

impl SimulatedSmu {
    fn validate(settings: &DcVoltageSourceSettings) -> HalResult<()> {
        let invalid = |msg: String| -> HalResult<()> { Err(HalError::InvalidParameter(msg)) };
        if !(settings.voltage_level_range.is_finite() && settings.voltage_level_range > 0.0) {
            return invalid(format!(
                "voltage_level_range must be positive, got {}",
                settings.voltage_level_range
            ));
        }
        if !settings.voltage_level.is_finite()
            || settings.voltage_level.abs() > settings.voltage_level_range
        {
            return invalid(format!(
                "voltage_level {} V is outside the {} V range",
                settings.voltage_level, settings.voltage_level_range
            ));
        }
        if !(settings.current_limit_range.is_finite() && settings.current_limit_range > 0.0) {
            return invalid(format!(
                "current_limit_range must be positive, got {}",
                settings.current_limit_range
            ));
        }
        if !(settings.current_limit > 0.0 && settings.current_limit <= settings.current_limit_range)
        {
            return invalid(format!(
                "current_limit {} A is outside the {} A range",
                settings.current_limit, settings.current_limit_range
            ));
        }
        Ok(())
    }

    fn timeout_error(message: &str) -> DriverError {
        DriverError::new(INSTRUMENT_TYPE_ID, DriverErrorKind::Timeout, message)
            .with_code(WAIT_FOR_EVENT_TIMEOUT)
    }
}

#[async_trait]
impl Initializable for SimulatedSmu {
    async fn initialize(&self, params: InitializeParams<'_>) -> Result<(), DriverError> {
        if self.session.is_open() {
            return Err(DriverError::new(
                INSTRUMENT_TYPE_ID,
                DriverErrorKind::Initialization,
                "Session is already initialized",
            ));
        }
        pause(self.timing.communication_delay()).await;
        let handle = self.server.open(
            INSTRUMENT_TYPE_ID,
            &params.descriptor.resource_name,
            params,
        )?;
        self.session.fill(handle);
        Ok(())
    }

    async fn release(&self) -> Result<(), DriverError> {
        if !self.session.is_open() {
            return Ok(());
        }
        // The handle stays in the slot until the server call, so a cancelled release can
        // be retried.
        pause(self.timing.communication_delay()).await;
        let Some(handle) = self.session.take() else {
            return Ok(());
        };
        self.server.abort_output(handle.instrument());
        self.server.release(&handle)
    }
}

#[async_trait]
impl EventSource for SimulatedSmu {
    type Event = DcPowerEvent;

    async fn wait_for_event(&self, event: DcPowerEvent, timeout: Duration) -> Result<(), DriverError> {
        let instrument = self.session.instrument(INSTRUMENT_TYPE_ID)?;
        match event {
            DcPowerEvent::SourceComplete => {
                let output = instrument.output();
                if !output.running {
                    return Err(DriverError::new(
                        INSTRUMENT_TYPE_ID,
                        DriverErrorKind::Hardware,
                        "Output is not initiated",
                    ));
                }
                let stalled = self.server.is_stalled(instrument.session_name());
                match output.source_complete_at {
                    Some(at) if !stalled && at <= Instant::now() + timeout => {
                        tokio::time::sleep_until(at).await;
                        Ok(())
                    }
                    _ => {
                        tokio::time::sleep(timeout).await;
                        Err(Self::timeout_error(
                            "Source complete event did not occur before the timeout",
                        ))
                    }
                }
            }
        }
    }

    fn is_poll_timeout(&self, error: &DriverError) -> bool {
        error
            .code
            .is_some_and(|code| TIMEOUT_ERROR_CODES.contains(&code))
    }
}

#[async_trait]
impl Sources<DcVoltage> for SimulatedSmu {
    #[instrument(skip(self, context), fields(voltage_level = settings.voltage_level))]
    async fn source(
        &self,
        settings: &DcVoltageSourceSettings,
        context: &MeasurementContext,
    ) -> HalResult<()> {
        Self::validate(settings)?;
        let instrument = self.session.instrument(INSTRUMENT_TYPE_ID)?;

        self.server.abort_output(&instrument);
        pause(self.timing.communication_delay()).await;

        let complete_at = Instant::now() + settings.source_delay + self.timing.settling_time();
        instrument.update(|s| {
            s.output = OutputState {
                voltage_level: settings.voltage_level,
                voltage_level_range: settings.voltage_level_range,
                current_limit: settings.current_limit,
                current_limit_range: settings.current_limit_range,
                running: true,
                source_complete_at: Some(complete_at),
            }
        });
        self.server.set_node_voltage(settings.voltage_level);
        debug!(session_name = instrument.session_name(), "Output initiated");

        let timeout = settings.source_delay + self.source_timeout_margin;
        self.arbiter
            .wait_for(self, DcPowerEvent::SourceComplete, timeout, context)
            .await?;

        info!(
            session_name = instrument.session_name(),
            voltage_level = settings.voltage_level,
            "Source complete"
        );
        Ok(())
    }
}

#[async_trait]
impl Measures<DcVoltage> for SimulatedSmu {
    async fn measure(&self, settings: &DcVoltageMeasureSettings) -> HalResult<f64> {
        if !(settings.voltage_level_range.is_finite() && settings.voltage_level_range > 0.0) {
            return Err(HalError::InvalidParameter(format!(
                "voltage_level_range must be positive, got {}",
                settings.voltage_level_range
            )));
        }
        let instrument = self.session.instrument(INSTRUMENT_TYPE_ID)?;
        pause(self.timing.communication_delay()).await;
        let output = instrument.output();
        Ok(if output.running {
            output.voltage_level
        } else {
            0.0
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_server::ServerEvent;
    use hal_core::{ConfigurationMap, InitializationBehavior, SessionDescriptor};

    fn factory(server: &Arc<SimulatedDeviceServer>) -> NiDcPowerFactory {
        NiDcPowerFactory::new(Arc::clone(server), &WaitConfig::default())
    }

    async fn open(components: &DriverComponents, descriptor: &SessionDescriptor) {
        let options = ConfigurationMap::new();
        components
            .initializable
            .initialize(InitializeParams {
                descriptor,
                reset_device: false,
                options: &options,
                behavior: InitializationBehavior::Auto,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn build_exposes_source_and_measure() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let components = factory(&server).build();
        assert_eq!(components.capabilities(), NI_DCPOWER_CAPABILITIES.to_vec());
        assert!(components.multimeter.is_none());
        // Building touches no hardware.
        assert!(server.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn source_waits_for_source_delay() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let components = factory(&server).build();
        let descriptor = SessionDescriptor::new("SMU1", "PXI1Slot2", INSTRUMENT_TYPE_ID);
        open(&components, &descriptor).await;

        let settings = DcVoltageSourceSettings {
            source_delay: Duration::from_millis(250),
            ..Default::default()
        };
        let start = Instant::now();
        let source = components.dc_voltage_source.clone().unwrap();
        source.source(&settings, &MeasurementContext::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert_eq!(server.node_voltage(), 6.0);

        let measured = components
            .dc_voltage_measure
            .clone()
            .unwrap()
            .measure(&DcVoltageMeasureSettings::default())
            .await
            .unwrap();
        assert_eq!(measured, 6.0);
    }

    #[tokio::test]
    async fn out_of_range_level_is_rejected() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let components = factory(&server).build();
        let descriptor = SessionDescriptor::new("SMU1", "PXI1Slot2", INSTRUMENT_TYPE_ID);
        open(&components, &descriptor).await;

        let settings = DcVoltageSourceSettings {
            voltage_level: 7.0,
            ..Default::default()
        };
        let err = components
            .dc_voltage_source
            .clone()
            .unwrap()
            .source(&settings, &MeasurementContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HalError::InvalidParameter(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_output_hits_user_timeout() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let wait = WaitConfig {
            source_timeout_margin_ms: 500,
            ..WaitConfig::default()
        };
        let components = NiDcPowerFactory::new(Arc::clone(&server), &wait).build();
        let descriptor = SessionDescriptor::new("SMU1", "PXI1Slot2", INSTRUMENT_TYPE_ID);
        open(&components, &descriptor).await;
        server.stall_source_complete("SMU1", true);

        let err = components
            .dc_voltage_source
            .clone()
            .unwrap()
            .source(&DcVoltageSourceSettings::default(), &MeasurementContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HalError::UserTimeoutExpired(t) if t == Duration::from_millis(500)));
    }

    #[tokio::test]
    async fn release_aborts_before_closing() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let components = factory(&server).build();
        let descriptor = SessionDescriptor::new("SMU1", "PXI1Slot2", INSTRUMENT_TYPE_ID);
        open(&components, &descriptor).await;

        components.initializable.release().await.unwrap();
        let events = server.events_for("SMU1");
        assert!(matches!(
            events.as_slice(),
            [
                ServerEvent::Created { .. },
                ServerEvent::Aborted { .. },
                ServerEvent::Closed { .. }
            ]
        ));
        // Second release is a no-op.
        components.initializable.release().await.unwrap();
    }

    #[test]
    fn only_vendor_timeout_codes_are_poll_timeouts() {
        let server = Arc::new(SimulatedDeviceServer::new());
        let smu = SimulatedSmu {
            server,
            arbiter: EventWaitArbiter::default(),
            source_timeout_margin: Duration::ZERO,
            timing: TimingConfig::default(),
            session: SessionSlot::default(),
        };
        let timeout = DriverError::new(INSTRUMENT_TYPE_ID, DriverErrorKind::Timeout, "t");
        assert!(!smu.is_poll_timeout(&timeout));
        assert!(smu.is_poll_timeout(&timeout.clone().with_code(TIMEOUT_EXCEEDED)));
        assert!(smu.is_poll_timeout(&timeout.with_code(WAIT_FOR_EVENT_TIMEOUT)));
    }
}
