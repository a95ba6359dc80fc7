//! `measurement-hal`: runs measurement procedures against the simulated instruments.
//!
//! ```text
//! measurement-hal source-measure --voltage-level 3.3
//! measurement-hal dmm --pin Keysight_DMM_Pin --function ac_volts
//! measurement-hal cycle --iterations 5
//! ```
//!
//! The instrument backend lives in this process, so sessions created by `create-sessions`
//! do not outlive it; `cycle` exercises the full create/attach/destroy lifecycle in one run.

mod logging;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hal_core::{
    CancellationToken, DcVoltageSourceSettings, DmmFunction, HalConfig, MeasurementContext,
    SessionDescriptor,
};
use hal_driver_mock::{register_all, register_all_realistic, SimulatedDeviceServer};
use hal_hardware::{
    dmm_measurement, source_measure_dc_voltage, DmmMeasurementParams, DriverRegistry,
    InMemoryReservationService, InitOptions, SessionManager, SourceMeasureDcVoltageParams,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// Use mimalloc as global allocator for improved performance
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "measurement-hal")]
#[command(about = "Pin-addressed instrument sessions against simulated hardware", long_about = None)]
struct Cli {
    /// HAL configuration file
    #[arg(
        long,
        global = true,
        env = "MEASUREMENT_HAL_CONFIG_FILE",
        default_value = hal_core::config::DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    /// Pin map file (overrides reservation.pin_map)
    #[arg(long, global = true)]
    pin_map: Option<PathBuf>,

    /// Simulate instrument latencies
    #[arg(long, global = true)]
    realistic: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Source a DC voltage on one pin and measure it on another
    SourceMeasure(SourceMeasureArgs),
    /// Take one DMM reading
    Dmm(DmmArgs),
    /// Create every session in the pin map and leave it open
    CreateSessions,
    /// Close every registered session
    DestroySessions,
    /// Create sessions, run source/measure by attaching, then destroy
    Cycle {
        /// Number of source/measure runs between create and destroy
        #[arg(long, default_value_t = 3)]
        iterations: u32,

        #[command(flatten)]
        measurement: SourceMeasureArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct SourceMeasureArgs {
    #[arg(long, default_value = hal_hardware::measurements::DEFAULT_SOURCE_PIN)]
    source_pin: String,

    #[arg(long, default_value = hal_hardware::measurements::DEFAULT_MEASURE_PIN)]
    measure_pin: String,

    /// Output level in volts
    #[arg(long, default_value_t = 6.0, allow_negative_numbers = true)]
    voltage_level: f64,

    #[arg(long, default_value_t = 6.0)]
    voltage_level_range: f64,

    /// Compliance current in amps
    #[arg(long, default_value_t = 0.1)]
    current_limit: f64,

    #[arg(long, default_value_t = 0.1)]
    current_limit_range: f64,

    /// Settle time in seconds
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    source_delay: f64,

    #[arg(long, default_value_t = 5.5)]
    resolution_digits: f64,

    /// Overall time budget in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Reset instruments when opening
    #[arg(long)]
    reset: bool,
}

impl SourceMeasureArgs {
    fn params(&self) -> Result<SourceMeasureDcVoltageParams> {
        let source_delay = Duration::try_from_secs_f64(self.source_delay)
            .with_context(|| format!("Invalid --source-delay {}", self.source_delay))?;
        Ok(SourceMeasureDcVoltageParams {
            source_pin: self.source_pin.clone(),
            measure_pin: self.measure_pin.clone(),
            source: DcVoltageSourceSettings {
                voltage_level: self.voltage_level,
                voltage_level_range: self.voltage_level_range,
                current_limit: self.current_limit,
                current_limit_range: self.current_limit_range,
                source_delay,
            },
            resolution_digits: self.resolution_digits,
        })
    }

    fn context(&self) -> Result<MeasurementContext> {
        match self.timeout {
            Some(secs) => {
                let budget = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("Invalid --timeout {secs}"))?;
                Ok(MeasurementContext::with_timeout(budget))
            }
            None => Ok(MeasurementContext::new()),
        }
    }
}

#[derive(Args, Debug, Clone)]
struct DmmArgs {
    #[arg(long, default_value = hal_hardware::measurements::DEFAULT_MEASURE_PIN)]
    pin: String,

    /// Measurement function (dc_volts, ac_volts, two_wire_res, ...)
    #[arg(long, default_value = "dc_volts")]
    function: DmmFunction,

    /// Range, or -1 for auto-range
    #[arg(long, default_value_t = 10.0, allow_negative_numbers = true)]
    range: f64,

    #[arg(long, default_value_t = 5.5)]
    resolution_digits: f64,

    #[arg(long)]
    reset: bool,
}

/// Everything a command needs: the simulated backend and a session manager over it.
struct Bench {
    manager: SessionManager,
    json: bool,
}

impl Bench {
    fn build(cli: &Cli, config: &HalConfig) -> Result<Self> {
        let pin_map = cli
            .pin_map
            .clone()
            .or_else(|| config.reservation.pin_map.clone())
            .context("No pin map configured: pass --pin-map or set reservation.pin_map")?;
        let reservations = InMemoryReservationService::from_file(&pin_map)
            .with_context(|| format!("Failed to load pin map {}", pin_map.display()))?;

        let server = Arc::new(SimulatedDeviceServer::new());
        let registry = Arc::new(DriverRegistry::new());
        if cli.realistic {
            register_all_realistic(registry.as_ref(), server, config);
        } else {
            register_all(registry.as_ref(), server, config);
        }
        info!(
            pin_map = %pin_map.display(),
            drivers = ?registry.list_factories(),
            "Simulated bench ready"
        );

        let manager = SessionManager::new(registry, Arc::new(reservations))
            .with_reservation_timeout(config.reservation.timeout());
        Ok(Self {
            manager,
            json: cli.json,
        })
    }

    async fn source_measure(&self, args: &SourceMeasureArgs) -> Result<f64> {
        let params = args.params()?;
        let context = args.context()?;
        let cancel = spawn_ctrl_c(context.cancellation_token().clone());

        let result = source_measure_dc_voltage(
            &self.manager,
            &context,
            &params,
            &InitOptions::measurement().with_reset(args.reset),
        )
        .await;
        cancel.abort();

        if let Some(status) = context.abort_status() {
            warn!(code = ?status.code, message = %status.message, "Measurement aborted");
        }
        result.context("Source/measure DC voltage failed")
    }

    async fn dmm(&self, args: &DmmArgs) -> Result<()> {
        let params = DmmMeasurementParams {
            pin: args.pin.clone(),
            function: args.function,
            range: args.range,
            resolution_digits: args.resolution_digits,
        };
        let reading = dmm_measurement(
            &self.manager,
            &params,
            &InitOptions::measurement().with_reset(args.reset),
        )
        .await
        .context("DMM measurement failed")?;

        if self.json {
            println!("{}", serde_json::to_string(&reading)?);
        } else if reading.overrange {
            println!("{}: overrange", args.pin);
        } else {
            println!("{}: {} ({})", args.pin, reading.value, args.function);
        }
        Ok(())
    }

    async fn create_sessions(&self) -> Result<Vec<SessionDescriptor>> {
        let created = self
            .manager
            .create_instrument_sessions()
            .await
            .context("Failed to create instrument sessions")?;
        self.print_sessions("Created", &created)?;
        Ok(created)
    }

    async fn destroy_sessions(&self) -> Result<Vec<SessionDescriptor>> {
        let destroyed = self
            .manager
            .destroy_instrument_sessions()
            .await
            .context("Failed to destroy instrument sessions")?;
        self.print_sessions("Destroyed", &destroyed)?;
        Ok(destroyed)
    }

    /// Create, measure `iterations` times, destroy. Sessions are destroyed even when a
    /// measurement fails.
    async fn cycle(&self, iterations: u32, args: &SourceMeasureArgs) -> Result<Vec<f64>> {
        self.create_sessions().await?;

        let mut readings = Vec::with_capacity(iterations as usize);
        let mut failure = None;
        for iteration in 1..=iterations {
            match self.source_measure(args).await {
                Ok(reading) => {
                    info!(iteration, reading, "Cycle measurement");
                    readings.push(reading);
                }
                Err(err) => {
                    failure = Some(err.context(format!("Cycle iteration {iteration} failed")));
                    break;
                }
            }
        }

        let destroyed = self.destroy_sessions().await;
        if let Some(err) = failure {
            if let Err(destroy_err) = destroyed {
                warn!(error = %destroy_err, "Destroy failed after measurement error");
            }
            return Err(err);
        }
        destroyed?;
        Ok(readings)
    }

    fn print_reading(&self, reading: f64) -> Result<()> {
        if self.json {
            println!("{}", serde_json::json!({ "reading": reading }));
        } else {
            println!("{reading}");
        }
        Ok(())
    }

    fn print_sessions(&self, verb: &str, sessions: &[SessionDescriptor]) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(sessions)?);
            return Ok(());
        }
        if sessions.is_empty() {
            println!("{verb} no sessions");
        }
        for session in sessions {
            println!(
                "{verb} {} ({}, {})",
                session.session_name, session.instrument_type_id, session.resource_name
            );
        }
        Ok(())
    }
}

/// Cancel `token` on Ctrl+C. Abort the returned handle once the work is done.
fn spawn_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, cancelling measurement");
            token.cancel();
        }
    })
}

async fn run(cli: Cli) -> Result<()> {
    let config = HalConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let tracing_config = logging::TracingConfig::from_logging_config(&config.logging)
        .map_err(anyhow::Error::msg)?
        .with_verbosity(cli.verbose);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    let bench = Bench::build(&cli, &config)?;
    match &cli.command {
        Commands::SourceMeasure(args) => {
            let reading = bench.source_measure(args).await?;
            bench.print_reading(reading)?;
        }
        Commands::Dmm(args) => bench.dmm(args).await?,
        Commands::CreateSessions => {
            bench.create_sessions().await?;
        }
        Commands::DestroySessions => {
            bench.destroy_sessions().await?;
        }
        Commands::Cycle {
            iterations,
            measurement,
        } => {
            for reading in bench.cycle(*iterations, measurement).await? {
                bench.print_reading(reading)?;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}
