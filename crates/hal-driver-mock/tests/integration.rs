//! Integration tests for the simulated drivers, exercised through their factories.

use hal_core::{
    CancellationToken, ConfigurationMap, DcVoltageMeasureSettings, DcVoltageSourceSettings,
    DmmFunction, DriverComponents, DriverFactory, HalError, InitializationBehavior,
    InitializeParams, MeasurementContext, SessionDescriptor, WaitConfig,
};
use hal_driver_mock::{NiDcPowerFactory, NiDmmFactory, ServerEvent, SimulatedDeviceServer};
use std::sync::Arc;
use std::time::Duration;
use tonic::Code;

async fn initialize(
    components: &DriverComponents,
    descriptor: &SessionDescriptor,
    behavior: InitializationBehavior,
) -> Result<(), hal_core::DriverError> {
    let options = ConfigurationMap::new();
    components
        .initializable
        .initialize(InitializeParams {
            descriptor,
            reset_device: false,
            options: &options,
            behavior,
        })
        .await
}

#[tokio::test]
async fn smu_output_is_read_back_by_dmm() {
    let server = Arc::new(SimulatedDeviceServer::new());
    let smu = NiDcPowerFactory::new(Arc::clone(&server), &WaitConfig::default()).build();
    let dmm = NiDmmFactory::new(Arc::clone(&server)).build();

    let smu_session = SessionDescriptor::new("DCPower1", "PXI1Slot2", "niDCPower");
    let dmm_session = SessionDescriptor::new("DMM1", "PXI1Slot3", "niDMM");
    initialize(&smu, &smu_session, InitializationBehavior::Auto)
        .await
        .unwrap();
    initialize(&dmm, &dmm_session, InitializationBehavior::Auto)
        .await
        .unwrap();

    let settings = DcVoltageSourceSettings {
        voltage_level: 3.3,
        voltage_level_range: 6.0,
        ..Default::default()
    };
    smu.dc_voltage_source
        .clone()
        .unwrap()
        .source(&settings, &MeasurementContext::new())
        .await
        .unwrap();

    let reading = dmm
        .dc_voltage_measure
        .clone()
        .unwrap()
        .measure(&DcVoltageMeasureSettings {
            voltage_level_range: 10.0,
            resolution_digits: 5.5,
        })
        .await
        .unwrap();
    assert!((reading - 3.3).abs() < 1e-6);

    let multimeter = dmm.multimeter.clone().unwrap();
    multimeter
        .configure_measurement_digits(DmmFunction::DcVolts, 1.0, 5.5)
        .await
        .unwrap();
    assert!(multimeter.read().await.unwrap().is_nan());

    dmm.initializable.release().await.unwrap();
    smu.initializable.release().await.unwrap();
    assert!(server.open_sessions().is_empty());
}

#[tokio::test]
async fn sessions_persist_between_clients() {
    let server = Arc::new(SimulatedDeviceServer::new());
    let factory = NiDmmFactory::new(Arc::clone(&server));
    let descriptor = SessionDescriptor::new("DMM1", "PXI1Slot3", "niDMM");

    // Setup step creates and leaves the session open.
    let setup = factory.build();
    initialize(&setup, &descriptor, InitializationBehavior::InitializeThenDetach)
        .await
        .unwrap();
    setup.initializable.release().await.unwrap();
    assert!(server.is_open("DMM1"));

    // A measurement attaches and detaches.
    let measurement = factory.build();
    initialize(&measurement, &descriptor, InitializationBehavior::Auto)
        .await
        .unwrap();
    measurement.initializable.release().await.unwrap();
    assert!(server.is_open("DMM1"));

    // Cleanup attaches and closes.
    let cleanup = factory.build();
    initialize(&cleanup, &descriptor, InitializationBehavior::AttachThenClose)
        .await
        .unwrap();
    cleanup.initializable.release().await.unwrap();
    assert!(!server.is_open("DMM1"));

    let kinds: Vec<&str> = server
        .events_for("DMM1")
        .iter()
        .map(|e| match e {
            ServerEvent::Created { .. } => "created",
            ServerEvent::Attached { .. } => "attached",
            ServerEvent::Detached { .. } => "detached",
            ServerEvent::Closed { .. } => "closed",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["created", "detached", "attached", "detached", "attached", "closed"]
    );
    assert!(server.instrument("DMM1").is_none());
}

#[tokio::test(start_paused = true)]
async fn stalled_source_honors_cancellation() {
    let server = Arc::new(SimulatedDeviceServer::new());
    let smu = NiDcPowerFactory::new(Arc::clone(&server), &WaitConfig::default()).build();
    let descriptor = SessionDescriptor::new("DCPower1", "PXI1Slot2", "niDCPower");
    initialize(&smu, &descriptor, InitializationBehavior::Auto)
        .await
        .unwrap();
    server.stall_source_complete("DCPower1", true);

    let token = CancellationToken::new();
    let context = MeasurementContext::new().with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(350)).await;
        token.cancel();
    });

    let err = smu
        .dc_voltage_source
        .clone()
        .unwrap()
        .source(&DcVoltageSourceSettings::default(), &context)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, HalError::Cancelled));
    assert_eq!(context.abort_status().unwrap().code, Code::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn stalled_source_honors_deadline() {
    let server = Arc::new(SimulatedDeviceServer::new());
    let smu = NiDcPowerFactory::new(Arc::clone(&server), &WaitConfig::default()).build();
    let descriptor = SessionDescriptor::new("DCPower1", "PXI1Slot2", "niDCPower");
    initialize(&smu, &descriptor, InitializationBehavior::Auto)
        .await
        .unwrap();
    server.stall_source_complete("DCPower1", true);

    let context = MeasurementContext::with_timeout(Duration::from_millis(250));
    let err = smu
        .dc_voltage_source
        .clone()
        .unwrap()
        .source(&DcVoltageSourceSettings::default(), &context)
        .await
        .unwrap_err();
    assert!(matches!(err, HalError::DeadlineExceeded));
    assert_eq!(context.abort_status().unwrap().code, Code::DeadlineExceeded);
}
