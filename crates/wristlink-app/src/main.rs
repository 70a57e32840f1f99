//! Wristlink Service
//!
//! Keeps one wearable session alive and ingests its telemetry. Commands are
//! read line by line from stdin (and over HTTP with the `server` feature).
//!
//! # Usage
//!
//! ```bash
//! # Simulated wristband, start a session right away
//! wristlink run --device C8:0F:10:00:00:01
//!
//! # Real wristband over BLE, pair first, store samples in SQLite
//! wristlink run --driver ble --device C8:0F:10:00:00:01 --pair --database telemetry.db
//!
//! # Relaunch after a teardown: resumes from the state file
//! wristlink run
//!
//! # Inspect the persisted service state
//! wristlink status
//! ```
//!
//! Commands on stdin: `START <id>`, `PAIR <id>`, `STOP`, `ALERT`,
//! `BATTERY_REQUEST`. An empty line is the relaunch signal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wristlink_core::{BatteryInfo, HeartRateSample, MotionSample, StepCountSample};
use wristlink_native::bridge::{LinkDriver, SimulatedDriver};
use wristlink_native::session::{
    resume_command, Collaborators, CommandGateway, DisabledRestartScheduler, InhibitWakeLock, LockEnforcer,
    NullWakeLock, OverflowPolicy, RestartScheduler, Supervisor, SupervisorConfig, SystemdRestartScheduler,
    WakeLock,
};
use wristlink_native::store::{JsonStateStore, SampleSink, StateStore};

/// Wristlink wearable session service
#[derive(Parser, Debug)]
#[command(name = "wristlink")]
#[command(author, version, about = "Wearable session supervisor and telemetry bridge", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Persisted service state (run flag, last device, battery)
    #[arg(long, default_value = "wristlink-state.json")]
    state_file: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session service (default if no subcommand)
    Run(RunArgs),

    /// Print the persisted service state
    Status,

    /// List nearby BLE peripherals
    Devices {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        scan_secs: u64,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    Simulate,
    Ble,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OverflowArg {
    DropNewest,
    DropOldest,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum WakeLockKind {
    Inhibit,
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum RestartKind {
    Systemd,
    None,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    /// Device link driver
    #[arg(short, long, value_enum, default_value = "simulate")]
    driver: DriverKind,

    /// Device to start a session with; without it the persisted session resumes
    #[arg(long)]
    device: Option<String>,

    /// Pair before connecting
    #[arg(long)]
    pair: bool,

    /// Heart-rate scan period in seconds
    #[arg(long, default_value = "30")]
    poll_secs: u64,

    /// Delay before the host relaunches the service after a teardown
    #[arg(long, default_value = "1000")]
    restart_delay_ms: u64,

    /// Pause between failed connect attempts (0 = immediate retry)
    #[arg(long, default_value = "0")]
    connect_backoff_ms: u64,

    /// Maximum samples waiting for the sink
    #[arg(long, default_value = "4096")]
    ingest_capacity: usize,

    /// What to drop when the ingest queue is full
    #[arg(long, value_enum, default_value = "drop-newest")]
    overflow: OverflowArg,

    /// Host wake lock held while a session is active
    #[arg(long, value_enum, default_value = "none")]
    wake_lock: WakeLockKind,

    /// Self-restart mechanism used after a teardown
    #[arg(long, value_enum, default_value = "none")]
    restart: RestartKind,

    /// SQLite telemetry database
    #[cfg(feature = "database")]
    #[arg(long)]
    database: Option<PathBuf>,

    /// HTTP control surface bind address (e.g. 127.0.0.1:8080)
    #[cfg(feature = "server")]
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,
}

/// `run` options on their own, for the default command.
#[derive(Parser, Debug)]
struct RunOnly {
    #[command(flatten)]
    args: RunArgs,
}

impl RunArgs {
    fn defaults() -> Self {
        RunOnly::parse_from(["run"]).args
    }

    fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_secs(self.poll_secs.max(1)),
            restart_delay: Duration::from_millis(self.restart_delay_ms),
            connect_retry_delay: Duration::from_millis(self.connect_backoff_ms),
            ingest_capacity: self.ingest_capacity,
            overflow: match self.overflow {
                OverflowArg::DropNewest => OverflowPolicy::DropNewest,
                OverflowArg::DropOldest => OverflowPolicy::DropOldest,
            },
            ..SupervisorConfig::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("wristlink v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Runtime::new()?;
    match cli.command {
        None => runtime.block_on(run(RunArgs::defaults(), cli.state_file)),
        Some(Commands::Run(args)) => runtime.block_on(run(args, cli.state_file)),
        Some(Commands::Status) => print_status(&cli.state_file),
        Some(Commands::Devices { scan_secs }) => runtime.block_on(list_devices(scan_secs)),
    }
}

/// Build the driver and run the service until a termination signal.
async fn run(args: RunArgs, state_file: PathBuf) -> anyhow::Result<()> {
    let store: Arc<dyn StateStore> = Arc::new(
        JsonStateStore::open(&state_file)
            .with_context(|| format!("opening state file {}", state_file.display()))?,
    );

    match args.driver {
        DriverKind::Simulate => {
            info!("Device mode: simulate");
            run_with(Arc::new(SimulatedDriver::new()), args, store).await
        }
        DriverKind::Ble => run_ble(args, store).await,
    }
}

#[cfg(feature = "ble")]
async fn run_ble(args: RunArgs, store: Arc<dyn StateStore>) -> anyhow::Result<()> {
    info!("Device mode: ble");
    let driver = wristlink_native::bridge::BleDriver::new().await?;
    run_with(Arc::new(driver), args, store).await
}

#[cfg(not(feature = "ble"))]
async fn run_ble(args: RunArgs, store: Arc<dyn StateStore>) -> anyhow::Result<()> {
    let _ = (args, store);
    anyhow::bail!(
        "BLE support not enabled. Rebuild with --features ble:\n\
         cargo run -p wristlink-app --features ble"
    );
}

async fn run_with<D: LinkDriver>(driver: Arc<D>, args: RunArgs, store: Arc<dyn StateStore>) -> anyhow::Result<()> {
    let config = args.supervisor_config();

    let wake_lock: Box<dyn WakeLock> = match args.wake_lock {
        WakeLockKind::Inhibit => Box::new(InhibitWakeLock::new("wristlink")),
        WakeLockKind::None => Box::new(NullWakeLock),
    };
    let restart: Arc<dyn RestartScheduler> = match args.restart {
        RestartKind::Systemd => Arc::new(SystemdRestartScheduler::current_exe(relaunch_args(
            std::env::args().skip(1),
        ))?),
        RestartKind::None => Arc::new(DisabledRestartScheduler),
    };

    let collaborators = Collaborators {
        sink: open_sink(&args)?,
        store: Arc::clone(&store),
        wake_lock,
        restart,
        lock_enforcer: Arc::new(LoggingLockEnforcer),
    };

    let (handle, join) = Supervisor::spawn(driver, collaborators, config);
    let gateway = CommandGateway::new(handle.clone());

    #[cfg(feature = "server")]
    if let Some(addr) = args.bind {
        let gateway = gateway.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(addr, gateway, handle).await {
                warn!("HTTP server stopped: {}", e);
            }
        });
    }

    // Boot: explicit device, or relaunch plus resume from persisted state
    match args.device.as_deref() {
        Some(device) => {
            let name = if args.pair { "PAIR" } else { "START" };
            gateway.dispatch(Some(name), Some(device)).await;
        }
        None => {
            gateway.dispatch(None, None).await;
            if let Some(command) = resume_command(store.as_ref()) {
                gateway.forward(command).await;
            }
        }
    }

    let stdin_gateway = gateway.clone();
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let outcome = stdin_gateway.dispatch_line(&line).await;
                    tracing::debug!("{:?}", outcome);
                }
                Ok(None) => {
                    tracing::debug!("stdin closed, commands only via signals now");
                    break;
                }
                Err(e) => {
                    warn!("stdin read failed: {}", e);
                    break;
                }
            }
        }
    });

    wait_for_termination().await?;
    info!("Termination requested");
    stdin_task.abort();

    let scheduled = handle.teardown().await?;
    if scheduled {
        info!("Relaunch scheduled");
    }
    join.await?;
    Ok(())
}

/// Arguments for the relaunched process: same options, no explicit device.
fn relaunch_args(args: impl Iterator<Item = String>) -> Vec<String> {
    let mut kept = Vec::new();
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg == "--device" {
            skip_value = true;
            continue;
        }
        if arg.starts_with("--device=") || arg == "--pair" {
            continue;
        }
        kept.push(arg);
    }
    kept
}

fn open_sink(args: &RunArgs) -> anyhow::Result<Arc<dyn SampleSink>> {
    #[cfg(feature = "database")]
    if let Some(path) = &args.database {
        info!("Storing samples in {}", path.display());
        let sink = wristlink_native::store::SqliteSink::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        return Ok(Arc::new(sink));
    }

    let _ = args;
    Ok(Arc::new(TraceSink))
}

async fn wait_for_termination() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// Sample sink that only logs, used when no database is configured.
struct TraceSink;

impl SampleSink for TraceSink {
    fn insert_heart_rate(&self, sample: HeartRateSample) {
        info!("heart rate: {} bpm", sample.beats_per_minute);
    }

    fn insert_steps(&self, sample: StepCountSample) {
        tracing::debug!("steps: {}", sample.steps);
    }

    fn insert_motion(&self, sample: MotionSample) {
        tracing::trace!(
            "motion #{}: ({}, {}, {})",
            sample.sequence_index,
            sample.axis_x,
            sample.axis_y,
            sample.axis_z
        );
    }

    fn insert_battery(&self, info: BatteryInfo) {
        info!("battery: {:?}", info.raw);
    }
}

/// The lock-enforcement service runs elsewhere; hand-off is a log line.
struct LoggingLockEnforcer;

impl LockEnforcer for LoggingLockEnforcer {
    fn request_start(&self) {
        info!("Alert received, lock enforcement requested");
    }
}

/// Print the persisted service state as JSON
fn print_status(state_file: &std::path::Path) -> anyhow::Result<()> {
    let store = JsonStateStore::open(state_file)?;
    let status = serde_json::json!({
        "state_file": state_file.display().to_string(),
        "service_running": store.run_flag()?.as_str(),
        "last_device_id": store.last_device()?,
        "last_battery_info": store.last_battery()?,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// List nearby BLE peripherals
async fn list_devices(scan_secs: u64) -> anyhow::Result<()> {
    #[cfg(feature = "ble")]
    {
        let mut driver = wristlink_native::bridge::BleDriver::new().await?;
        driver.set_scan_duration(Duration::from_secs(scan_secs));
        let devices = driver.scan().await?;
        if devices.is_empty() {
            info!("  (none found)");
        }
        for device in devices {
            info!(
                "  {} {} ({} dBm)",
                device.address,
                device.name.as_deref().unwrap_or("<unnamed>"),
                device.rssi.map_or_else(|| "?".to_string(), |r| r.to_string())
            );
        }
    }

    #[cfg(not(feature = "ble"))]
    {
        let _ = scan_secs;
        warn!("BLE support not enabled. Rebuild with --features ble");
    }

    Ok(())
}

/// HTTP control surface
#[cfg(feature = "server")]
mod server {
    use std::net::SocketAddr;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde::Deserialize;
    use tracing::info;

    use wristlink_native::session::{CommandGateway, GatewayOutcome, SessionSnapshot, SupervisorHandle};

    #[derive(Clone)]
    struct AppState {
        gateway: CommandGateway,
        handle: SupervisorHandle,
    }

    #[derive(Debug, Deserialize)]
    struct CommandRequest {
        command: Option<String>,
        payload: Option<String>,
    }

    async fn post_command(State(state): State<AppState>, Json(request): Json<CommandRequest>) -> Json<GatewayOutcome> {
        let outcome = state
            .gateway
            .dispatch(request.command.as_deref(), request.payload.as_deref())
            .await;
        Json(outcome)
    }

    async fn get_status(State(state): State<AppState>) -> Result<Json<SessionSnapshot>, StatusCode> {
        state
            .handle
            .snapshot()
            .await
            .map(Json)
            .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
    }

    pub async fn serve(addr: SocketAddr, gateway: CommandGateway, handle: SupervisorHandle) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/command", post(post_command))
            .route("/status", get(get_status))
            .route(
                "/health",
                get(|| async { Json(serde_json::json!({"status": "ok"})) }),
            )
            .with_state(AppState { gateway, handle });

        info!("HTTP control listening on http://{}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}
