//! bridged — main daemon for the cleaning-robot bridge.

use std::io::Read as _;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bridge::{BridgeServer, BroadcasterConfig, ControlDispatcher, TelemetryBroadcaster};
use clap::Parser;
use history::HistoryJournal;
use link::SerialLink;
use localization::{OdometryInput, OdometrySource, PoseEstimator};
use plan::PlanStore;
use robot::RobotDriver;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vision::{FrameSlicer, MarkerDetector, PoseSnap, PoseSnapConfig};

/// Configuration file structure (bridged.toml).
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    link: LinkConfig,
    odometry: OdometryConfig,
    aruco: ArucoConfig,
    plan: PlanFileConfig,
    telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LinkConfig {
    roomba_serial_port: String,
    roomba_baudrate: u32,
    roomba_timeout_sec: f64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            roomba_serial_port: "/dev/ttyUSB0".to_string(),
            roomba_baudrate: 115200,
            roomba_timeout_sec: 1.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct OdometryConfig {
    odometry_source: String,
    odometry_mm_per_tick: f64,
    odometry_linear_scale: f64,
    odometry_angular_scale: f64,
    odometry_robot_radius_mm: f64,
    odometry_collision_margin_scale: f64,
    odometry_history_path: PathBuf,
}

impl Default for OdometryConfig {
    fn default() -> Self {
        Self {
            odometry_source: "encoders".to_string(),
            odometry_mm_per_tick: 0.445,
            odometry_linear_scale: 1.0,
            odometry_angular_scale: 1.0,
            odometry_robot_radius_mm: 170.0,
            odometry_collision_margin_scale: 1.0,
            odometry_history_path: PathBuf::from("/var/lib/bridged/history.jsonl"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ArucoConfig {
    aruco_enabled: bool,
    aruco_snap_enabled: bool,
    aruco_interval_sec: f64,
    aruco_dictionary: String,
    aruco_focal_px: f64,
    aruco_marker_size_cm: f64,
    aruco_heading_gain_deg: f64,
    aruco_pose_blend: f64,
    aruco_theta_blend: f64,
    /// `host:port` of a raw MJPEG byte source (e.g. the video encoder
    /// subprocess's output socket). Sourcing and encoding that stream is
    /// out of scope here; this only feeds whatever bytes arrive into
    /// `FrameSlicer`. Unset disables the feed — the detector stays idle.
    camera_stream_addr: Option<String>,
}

impl Default for ArucoConfig {
    fn default() -> Self {
        Self {
            aruco_enabled: true,
            aruco_snap_enabled: true,
            aruco_interval_sec: 0.5,
            aruco_dictionary: "DICT_APRILTAG_36h11".to_string(),
            aruco_focal_px: 900.0,
            aruco_marker_size_cm: 15.0,
            aruco_heading_gain_deg: 40.0,
            aruco_pose_blend: 1.0,
            aruco_theta_blend: 1.0,
            camera_stream_addr: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PlanFileConfig {
    plan_default_path: PathBuf,
}

impl Default for PlanFileConfig {
    fn default() -> Self {
        Self {
            plan_default_path: PathBuf::from("config/plan.json"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TelemetryConfig {
    telemetry_interval_sec: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_sec: 0.1,
        }
    }
}

impl FileConfig {
    fn load(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: FileConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(FileConfig::default())
        }
    }
}

#[derive(Parser)]
#[command(name = "bridged", about = "Cleaning-robot bridge daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/bridged.toml")]
    config: PathBuf,

    /// Serial port the robot is attached to. Overrides config file.
    #[arg(long)]
    roomba_serial_port: Option<String>,

    /// Serial baud rate. Overrides config file.
    #[arg(long)]
    roomba_baudrate: Option<u32>,

    /// Floor plan file to load at startup. Overrides config file.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Disable fiducial marker detection regardless of config.
    #[arg(long)]
    no_aruco: bool,

    /// Control/telemetry WebSocket port.
    #[arg(long, default_value = "4850")]
    port: u16,

    /// Log directory for text logs
    #[arg(long, default_value = "/var/log/bridged")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = init_logging(&args.log_dir, &args.log_level)?;
    let file_config = FileConfig::load(&args.config)?;
    info!(path = %args.config.display(), "loaded config");

    let serial_port = args
        .roomba_serial_port
        .clone()
        .unwrap_or_else(|| file_config.link.roomba_serial_port.clone());
    let baud_rate = args.roomba_baudrate.unwrap_or(file_config.link.roomba_baudrate);
    let read_timeout = Duration::from_secs_f64(file_config.link.roomba_timeout_sec);

    let link = match SerialLink::open(&serial_port, baud_rate, read_timeout) {
        Ok(link) => link,
        Err(err) => {
            warn!(%err, port = %serial_port, "failed to open serial link, continuing disconnected");
            SerialLink::closed_for_test()
        }
    };
    let driver = RobotDriver::new(link);
    if let Err(err) = driver.start() {
        warn!(%err, "initial start command failed");
    }
    if let Err(err) = driver.safe() {
        warn!(%err, "initial safe-mode command failed");
    } else if let Err(err) = driver.subscribe(&robot::DEFAULT_STREAM_PACKET_IDS) {
        warn!(%err, "initial sensor stream subscription failed");
    }

    let plan_store = PlanStore::new();
    let plan_path = args.plan.clone().unwrap_or_else(|| file_config.plan.plan_default_path.clone());
    plan_store.load_default(&plan_path);

    let odometry_source = OdometrySource::parse(&file_config.odometry.odometry_source);
    let estimator = PoseEstimator::new(
        odometry_source,
        file_config.odometry.odometry_mm_per_tick,
        file_config.odometry.odometry_linear_scale,
        file_config.odometry.odometry_angular_scale,
    );

    let history = Arc::new(HistoryJournal::new(file_config.odometry.odometry_history_path.clone()));
    {
        let history = history.clone();
        estimator.set_history_sink(move |event| history.append(event));
    }

    if let Some(plan) = plan_store.get() {
        let robot_radius_mm =
            file_config.odometry.odometry_robot_radius_mm * file_config.odometry.odometry_collision_margin_scale;
        estimator.set_collision_plan(&plan, robot_radius_mm);
    }

    let seed_pose = history
        .last_pose()
        .or_else(|| plan_store.get().and_then(|plan| plan.start_pose.clone()));
    if let Some(seed) = seed_pose {
        info!(x = seed.x_mm, y = seed.y_mm, theta = seed.theta_deg, "restored starting pose");
        estimator.reset(seed.x_mm, seed.y_mm, seed.theta_deg, None, None, None, None);
    } else {
        info!("no prior pose found, starting at origin");
    }

    // Every decoded sensor frame feeds straight into the pose estimator.
    {
        let estimator = estimator.clone();
        driver.set_frame_callback(move |telemetry| {
            let input = OdometryInput {
                total_distance_mm: telemetry.total_distance_mm,
                total_angle_deg: telemetry.total_angle_deg,
                left_encoder_counts: Some(telemetry.left_encoder_counts),
                right_encoder_counts: Some(telemetry.right_encoder_counts),
                bump_left: telemetry.bump_left,
                bump_right: telemetry.bump_right,
                timestamp: Some(telemetry.timestamp),
            };
            estimator.update(&input);
        });
    }

    // Fiducial marker pipeline: MarkerDetector runs its own worker thread;
    // its result callback turns a detection into an absolute pose snap.
    let aruco_enabled = file_config.aruco.aruco_enabled && !args.no_aruco;
    let detector = MarkerDetector::new(
        aruco_enabled,
        file_config.aruco.aruco_interval_sec,
        file_config.aruco.aruco_dictionary.clone(),
    );
    detector.start();

    let pose_snap = Arc::new(PoseSnap::new(PoseSnapConfig {
        snap_enabled: file_config.aruco.aruco_snap_enabled,
        focal_px: file_config.aruco.aruco_focal_px,
        default_marker_size_mm: file_config.aruco.aruco_marker_size_cm * 10.0,
        heading_gain_deg: file_config.aruco.aruco_heading_gain_deg,
        pose_blend_cap: file_config.aruco.aruco_pose_blend,
        theta_blend_cap: file_config.aruco.aruco_theta_blend,
    }));
    {
        let pose_snap = pose_snap.clone();
        let estimator = estimator.clone();
        let plan_store = plan_store.clone();
        detector.set_result_callback(move |result| {
            if !result.ok || result.markers.is_empty() {
                return;
            }
            let Some(plan) = plan_store.get() else { return };
            let Some(observation) =
                pose_snap.process(&result.markers, result.frame_width, result.timestamp, &plan)
            else {
                return;
            };
            estimator.apply_external_pose(
                observation.target_x_mm,
                observation.target_y_mm,
                observation.target_theta_deg,
                observation.blend_pos,
                observation.blend_theta,
                observation.source.as_str(),
            );
        });
    }

    // The video encoder subprocess and the detector library itself are
    // external collaborators (out of scope); this thread is only the
    // seam that turns whatever bytes arrive on that socket into complete
    // JPEG frames for the detector. Absent a configured address, the
    // detector simply never receives frames and reports itself idle.
    if let Some(addr) = file_config.aruco.camera_stream_addr.clone() {
        let detector = detector.clone();
        std::thread::spawn(move || run_camera_feed(&addr, detector));
    }

    // Serial reader: a dedicated blocking thread pumps bytes off the
    // link into the driver; `reader_alive` lets the broadcaster's
    // watchdog tell a silent link apart from a dead reader thread.
    let reader_alive = Arc::new(AtomicBool::new(false));
    {
        let driver = driver.clone();
        let reader_alive = reader_alive.clone();
        std::thread::spawn(move || run_serial_reader(driver, reader_alive));
    }

    let dispatcher = ControlDispatcher::new(driver.clone());
    let broadcaster_config = BroadcasterConfig {
        telemetry_interval: Duration::from_secs_f64(file_config.telemetry.telemetry_interval_sec),
        ..BroadcasterConfig::default()
    };
    let broadcaster = TelemetryBroadcaster::new(driver.clone(), estimator.clone(), broadcaster_config);
    let (telemetry_tx, telemetry_rx) = watch::channel(broadcaster.snapshot());
    tokio::spawn(broadcaster.run(reader_alive, telemetry_tx));

    let server = BridgeServer::new(args.port, dispatcher, telemetry_rx);
    info!(port = args.port, "bridge control/telemetry server starting");
    server.run().await?;

    Ok(())
}

/// Pump bytes off the serial link into the driver forever. `reader_alive`
/// is held true while reads are succeeding; a closed link or I/O error
/// clears it and backs off, leaving `service_watchdog` to resubscribe
/// once the link recovers.
fn run_serial_reader(driver: RobotDriver, reader_alive: Arc<AtomicBool>) {
    const READ_TIMEOUT: Duration = Duration::from_millis(200);
    const CLOSED_BACKOFF: Duration = Duration::from_secs(1);

    loop {
        match driver.poll_serial(READ_TIMEOUT) {
            Ok(_) => reader_alive.store(true, Ordering::Relaxed),
            Err(robot::DriverError::LinkClosed) => {
                reader_alive.store(false, Ordering::Relaxed);
                std::thread::sleep(CLOSED_BACKOFF);
            }
            Err(err) => {
                reader_alive.store(false, Ordering::Relaxed);
                warn!(%err, "serial read failed");
                std::thread::sleep(CLOSED_BACKOFF);
            }
        }
    }
}

/// Connect to `addr` and feed every byte read into a `FrameSlicer`,
/// enqueuing each complete JPEG frame on `detector`. Reconnects with a
/// fixed backoff on any I/O error or refused connection; the detector
/// simply has nothing to process while disconnected.
fn run_camera_feed(addr: &str, detector: MarkerDetector) {
    const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

    loop {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                info!(addr, "camera byte stream connected");
                let mut slicer = FrameSlicer::new();
                let mut buf = [0u8; 8192];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Some(frame) = slicer.push(&buf[..n]) {
                                detector.enqueue_jpeg_frame(frame);
                            }
                        }
                        Err(err) => {
                            warn!(%err, addr, "camera byte stream read failed");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                debug!(%err, addr, "camera byte stream unavailable");
            }
        }
        std::thread::sleep(RECONNECT_BACKOFF);
    }
}

/// Initialize logging with stdout and rolling file output.
///
/// Returns a guard that must be held for the lifetime of the program to
/// ensure logs are properly flushed on shutdown.
fn init_logging(log_dir: &std::path::Path, level: &str) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Error: cannot create log directory '{}': {}", log_dir.display(), e);
        eprintln!("Try running with a local directory, e.g. --log-dir ./logs");
        return Err(e.into());
    }

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "bridged.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "bridged={level},robot={level},localization={level},vision={level}"
        ))
    });

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
