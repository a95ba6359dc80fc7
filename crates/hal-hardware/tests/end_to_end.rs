//! End-to-end tests: pin map, reservations, session manager and the simulated drivers.

use hal_core::{
    CancellationToken, Capability, DmmFunction, HalConfig, HalError, MeasurementContext,
    SessionDescriptor,
};
use hal_driver_mock::{register_all, register_all_realistic, ServerEvent, SimulatedDeviceServer};
use hal_hardware::{
    dmm_measurement, source_measure_dc_voltage, DmmMeasurementParams, DriverRegistry,
    InMemoryReservationService, InitOptions, PinMap, SessionManager,
    SourceMeasureDcVoltageParams,
};
use std::sync::Arc;
use std::time::Duration;

const PIN_MAP: &str = r#"
[[sessions]]
session_name = "DCPower1"
resource_name = "PXI1Slot2"
instrument_type_id = "niDCPower"
channel_list = "0"

[[sessions.channel_mappings]]
pin_or_relay_name = "NI_DCPower_Pin"
site = 0
channel = "0"

[[sessions]]
session_name = "DMM1"
resource_name = "PXI1Slot3"
instrument_type_id = "niDMM"

[[sessions.channel_mappings]]
pin_or_relay_name = "NI_DMM_Pin"
site = 0
channel = "0"

[[sessions]]
session_name = "Keysight1"
resource_name = "USB0::0x2A8D::0x0101::MY1::INSTR"
instrument_type_id = "KeysightDMM"

[[sessions.channel_mappings]]
pin_or_relay_name = "Keysight_DMM_Pin"
site = 0
channel = "0"
"#;

struct Bench {
    server: Arc<SimulatedDeviceServer>,
    reservations: Arc<InMemoryReservationService>,
    manager: SessionManager,
}

fn bench_with(pin_map: PinMap) -> Bench {
    build_bench(pin_map, false)
}

fn build_bench(pin_map: PinMap, realistic: bool) -> Bench {
    let server = Arc::new(SimulatedDeviceServer::new());
    let registry = Arc::new(DriverRegistry::new());
    if realistic {
        register_all_realistic(registry.as_ref(), Arc::clone(&server), &HalConfig::default());
    } else {
        register_all(registry.as_ref(), Arc::clone(&server), &HalConfig::default());
    }
    let reservations = Arc::new(InMemoryReservationService::new(pin_map));
    let manager = SessionManager::new(registry, reservations.clone())
        .with_reservation_timeout(Some(Duration::from_secs(1)));
    Bench {
        server,
        reservations,
        manager,
    }
}

fn bench() -> Bench {
    bench_with(PinMap::from_toml_str(PIN_MAP).unwrap())
}

fn closed_sessions(server: &SimulatedDeviceServer) -> Vec<String> {
    server
        .journal()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::Closed { session_name } => Some(session_name),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn source_measure_with_defaults() {
    let bench = bench();
    let reading = source_measure_dc_voltage(
        &bench.manager,
        &MeasurementContext::new(),
        &SourceMeasureDcVoltageParams::default(),
        &InitOptions::measurement(),
    )
    .await
    .unwrap();

    assert!((reading - 6.0).abs() < 1e-6, "reading {reading}");
    assert!(bench.server.open_sessions().is_empty());
    assert_eq!(bench.reservations.held_sessions(), 0);
}

#[tokio::test]
async fn dmm_measurement_on_keysight_reports_overrange() {
    let bench = bench();
    bench.server.set_node_voltage(4.2);

    let ok = dmm_measurement(
        &bench.manager,
        &DmmMeasurementParams {
            pin: "Keysight_DMM_Pin".into(),
            ..Default::default()
        },
        &InitOptions::measurement(),
    )
    .await
    .unwrap();
    assert!(!ok.overrange);
    assert!((ok.value - 4.2).abs() < 1e-6);

    let over = dmm_measurement(
        &bench.manager,
        &DmmMeasurementParams {
            pin: "Keysight_DMM_Pin".into(),
            range: 1.0,
            ..Default::default()
        },
        &InitOptions::measurement(),
    )
    .await
    .unwrap();
    assert!(over.overrange);
}

#[tokio::test]
async fn keysight_rejects_waveform_function() {
    let bench = bench();
    let err = dmm_measurement(
        &bench.manager,
        &DmmMeasurementParams {
            pin: "Keysight_DMM_Pin".into(),
            function: DmmFunction::WaveformVoltage,
            ..Default::default()
        },
        &InitOptions::measurement(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, HalError::InvalidParameter(_)));
    assert!(bench.server.open_sessions().is_empty());
}

#[tokio::test]
async fn create_measure_destroy_cycle() {
    let bench = bench();

    let created = bench.manager.create_instrument_sessions().await.unwrap();
    assert_eq!(created.len(), 3);
    assert_eq!(
        bench.server.open_sessions(),
        vec!["DCPower1", "DMM1", "Keysight1"]
    );
    assert_eq!(bench.reservations.registered_sessions().len(), 3);
    assert_eq!(
        bench.server.instrument("DMM1").unwrap().snapshot().reset_count,
        1
    );

    bench.server.clear_journal();
    source_measure_dc_voltage(
        &bench.manager,
        &MeasurementContext::new(),
        &SourceMeasureDcVoltageParams::default(),
        &InitOptions::measurement(),
    )
    .await
    .unwrap();
    // Measurements attach to the created sessions and leave them open.
    assert!(closed_sessions(&bench.server).is_empty());
    assert!(bench
        .server
        .journal()
        .contains(&ServerEvent::Attached {
            session_name: "DCPower1".into()
        }));
    assert_eq!(bench.server.open_sessions().len(), 3);

    let destroyed = bench.manager.destroy_instrument_sessions().await.unwrap();
    assert_eq!(destroyed.len(), 3);
    assert!(bench.server.open_sessions().is_empty());
    assert!(bench.reservations.registered_sessions().is_empty());
    assert_eq!(bench.reservations.held_sessions(), 0);
}

#[tokio::test]
async fn destroy_keeps_sessions_that_failed_to_close_registered() {
    let bench = bench();
    bench.manager.create_instrument_sessions().await.unwrap();
    bench.server.set_release_failure("DMM1", true);

    let err = bench.manager.destroy_instrument_sessions().await.unwrap_err();
    match err {
        HalError::TeardownFailed(errors) => assert_eq!(errors.len(), 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(bench.server.open_sessions(), vec!["DMM1"]);
    let registered: Vec<String> = bench
        .reservations
        .registered_sessions()
        .into_iter()
        .map(|s| s.session_name)
        .collect();
    assert_eq!(registered, vec!["DMM1"]);
    assert_eq!(bench.reservations.held_sessions(), 0);

    // Retrying after the fault clears closes only what is left.
    bench.server.set_release_failure("DMM1", false);
    let destroyed = bench.manager.destroy_instrument_sessions().await.unwrap();
    assert_eq!(destroyed.len(), 1);
    assert!(bench.server.open_sessions().is_empty());
    assert!(bench.reservations.registered_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn close_cut_short_by_a_deadline_still_releases_everything() {
    let bench = build_bench(PinMap::from_toml_str(PIN_MAP).unwrap(), true);
    let pins: Vec<String> = ["NI_DCPower_Pin", "NI_DMM_Pin", "Keysight_DMM_Pin"]
        .iter()
        .map(|p| p.to_string())
        .collect();
    let scope = bench
        .manager
        .initialize(&pins, &InitOptions::measurement())
        .await
        .unwrap();
    assert_eq!(bench.server.open_sessions().len(), 3);

    // The Keysight release alone takes longer than the deadline.
    let outcome = tokio::time::timeout(Duration::from_millis(2), scope.close()).await;
    assert!(outcome.is_err());
    assert_eq!(bench.server.open_sessions().len(), 3);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(bench.server.open_sessions().is_empty());
    assert_eq!(
        closed_sessions(&bench.server),
        vec!["Keysight1", "DMM1", "DCPower1"]
    );
    assert_eq!(bench.reservations.held_sessions(), 0);
}

#[tokio::test]
async fn teardown_runs_in_reverse_open_order() {
    // DMM listed first, SMU second: the SMU is released first.
    let pin_map = PinMap::new(vec![
        SessionDescriptor::new("DMM1", "PXI1Slot3", "niDMM").with_pin("A", Some(0), "0"),
        SessionDescriptor::new("DCPower1", "PXI1Slot2", "niDCPower").with_pin("B", Some(0), "0"),
    ]);
    let bench = bench_with(pin_map);

    let reading = source_measure_dc_voltage(
        &bench.manager,
        &MeasurementContext::new(),
        &SourceMeasureDcVoltageParams {
            source_pin: "B".into(),
            measure_pin: "A".into(),
            ..Default::default()
        },
        &InitOptions::measurement(),
    )
    .await
    .unwrap();
    assert!((reading - 6.0).abs() < 1e-6);
    assert_eq!(closed_sessions(&bench.server), vec!["DCPower1", "DMM1"]);
}

#[tokio::test]
async fn failed_initialize_unwinds_earlier_sessions() {
    let bench = bench();
    bench.server.fail_next_initialize("DMM1");

    let err = source_measure_dc_voltage(
        &bench.manager,
        &MeasurementContext::new(),
        &SourceMeasureDcVoltageParams::default(),
        &InitOptions::measurement(),
    )
    .await
    .unwrap_err();

    match err {
        HalError::InitializationFailure { session_name, .. } => assert_eq!(session_name, "DMM1"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(closed_sessions(&bench.server), vec!["DCPower1"]);
    assert!(bench.server.open_sessions().is_empty());
    assert_eq!(bench.reservations.held_sessions(), 0);
}

#[tokio::test]
async fn unknown_instrument_type_opens_nothing() {
    let pin_map = PinMap::new(vec![
        SessionDescriptor::new("DCPower1", "PXI1Slot2", "niDCPower").with_pin("SMU", None, "0"),
        SessionDescriptor::new("Scope1", "PXI1Slot4", "niScope").with_pin("SCOPE", None, "0"),
    ]);
    let bench = bench_with(pin_map);

    let err = bench
        .manager
        .initialize(&["SMU".to_string(), "SCOPE".to_string()], &InitOptions::measurement())
        .await
        .unwrap_err();
    match err {
        HalError::UnknownInstrumentType {
            instrument_type_id,
            available,
        } => {
            assert_eq!(instrument_type_id, "niScope");
            assert_eq!(available, vec!["KeysightDMM", "niDCPower", "niDMM"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(bench.server.journal().is_empty());
    assert_eq!(bench.reservations.held_sessions(), 0);
}

#[tokio::test]
async fn sourcing_from_a_dmm_pin_is_a_capability_mismatch() {
    let bench = bench();
    let err = source_measure_dc_voltage(
        &bench.manager,
        &MeasurementContext::new(),
        &SourceMeasureDcVoltageParams {
            source_pin: "NI_DMM_Pin".into(),
            measure_pin: "Keysight_DMM_Pin".into(),
            ..Default::default()
        },
        &InitOptions::measurement(),
    )
    .await
    .unwrap_err();

    match err {
        HalError::CapabilityMismatch {
            pin, capability, ..
        } => {
            assert_eq!(pin, "NI_DMM_Pin");
            assert_eq!(capability, Capability::SourceDcVoltage);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(bench.server.open_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelled_source_releases_sessions() {
    let bench = bench();
    bench.server.stall_source_complete("DCPower1", true);

    let token = CancellationToken::new();
    let context = MeasurementContext::new().with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        token.cancel();
    });

    let err = source_measure_dc_voltage(
        &bench.manager,
        &context,
        &SourceMeasureDcVoltageParams::default(),
        &InitOptions::measurement(),
    )
    .await
    .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, HalError::Cancelled));
    assert!(context.abort_status().is_some());
    assert!(bench.server.open_sessions().is_empty());
    assert!(bench
        .server
        .events_for("DCPower1")
        .contains(&ServerEvent::Aborted {
            session_name: "DCPower1".into()
        }));
}

#[tokio::test]
async fn release_failure_surfaces_after_successful_measurement() {
    let bench = bench();
    bench.server.set_release_failure("DMM1", true);

    let err = source_measure_dc_voltage(
        &bench.manager,
        &MeasurementContext::new(),
        &SourceMeasureDcVoltageParams::default(),
        &InitOptions::measurement(),
    )
    .await
    .unwrap_err();

    match err {
        HalError::TeardownFailed(errors) => assert_eq!(errors.len(), 1),
        other => panic!("unexpected error: {other}"),
    }
    // The other session and the reservation were still released.
    assert!(!bench.server.is_open("DCPower1"));
    assert_eq!(bench.reservations.held_sessions(), 0);
}

#[tokio::test]
async fn shipped_pin_map_runs_both_procedures() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/pin_map.toml");
    let pin_map = PinMap::load(path).unwrap();
    assert_eq!(
        pin_map.pin_names(),
        vec!["NI_DCPower_Pin", "NI_DMM_Pin", "Keysight_DMM_Pin"]
    );

    let bench = bench_with(pin_map);
    let reading = source_measure_dc_voltage(
        &bench.manager,
        &MeasurementContext::new(),
        &SourceMeasureDcVoltageParams {
            measure_pin: "Keysight_DMM_Pin".into(),
            ..Default::default()
        },
        &InitOptions::measurement(),
    )
    .await
    .unwrap();
    assert!((reading - 6.0).abs() < 1e-6);
}
