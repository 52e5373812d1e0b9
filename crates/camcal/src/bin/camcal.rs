use std::error::Error;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camcal::camera::{load_gray, ImageDirectoryBackend};
use camcal::detect::to_luma;
use camcal::intrinsics::store;
use camcal::measure::{read_measurements, Acknowledger, ImmediateAcknowledger, MeasurementStrategy};
use camcal::worker::CancelToken;
use camcal::{CamcalConfig, Controller, MeasurementOutcome, SessionConfig};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

/// Camera calibration and marker measurement over image-directory cameras.
///
/// Camera `N` is the N-th sub-directory (by name) of `--root`; its images
/// are played back in name order as frames.
#[derive(Debug, Parser)]
#[command(author, version, about = "Camera calibration and marker-based measurement")]
struct Cli {
    /// Optional JSON config; command-line flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON logs (requires the `tracing` feature).
    #[arg(long, global = true)]
    json_log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a calibration session and save the result.
    Calibrate(CalibrateArgs),
    /// Undistort one image with a saved calibration.
    Undistort(UndistortArgs),
    /// Measure marker displacement with a saved calibration.
    Measure(MeasureArgs),
    /// Print a calibration or measurement file as JSON.
    Show(ShowArgs),
}

#[derive(Debug, Args)]
struct CameraArgs {
    /// Directory holding one sub-directory of images per camera.
    #[arg(long)]
    root: PathBuf,

    #[arg(long)]
    camera: Option<usize>,
}

#[derive(Debug, Args)]
struct CalibrateArgs {
    #[command(flatten)]
    camera: CameraArgs,

    /// One of chessboard_10, chessboard_5, marker_5.
    #[arg(long)]
    preset: Option<String>,

    /// Calibration file to write (`.json` for JSON, XML otherwise).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Frames examined per shot before the session fails.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Skip the operator pauses between shots.
    #[arg(long)]
    no_delay: bool,
}

#[derive(Debug, Args)]
struct UndistortArgs {
    #[arg(long)]
    calibration: PathBuf,

    #[arg(long)]
    input: PathBuf,

    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct MeasureArgs {
    #[command(flatten)]
    camera: CameraArgs,

    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Ruler offset from the marker's top-right corner, in marker units.
    #[arg(long, default_value_t = 0.0)]
    offset: f64,

    #[arg(long)]
    marker_length: Option<f64>,

    /// Measurement document to append to.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Wait for Enter on stdin before looking for the moved marker.
    #[arg(long)]
    wait_enter: bool,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Calibration file (XML or JSON).
    #[arg(long, conflicts_with = "measurements", required_unless_present = "measurements")]
    calibration: Option<PathBuf>,

    /// Measurement document (XML).
    #[arg(long)]
    measurements: Option<PathBuf>,
}

/// Waits for a line on stdin.
struct EnterAcknowledger;

impl Acknowledger for EnterAcknowledger {
    fn wait_for_reposition(&self, cancel: &CancelToken) -> bool {
        eprintln!("move the probe, then press Enter");
        let mut line = String::new();
        let read = std::io::stdin().lock().read_line(&mut line);
        read.is_ok() && !cancel.is_cancelled()
    }
}

#[derive(Serialize)]
struct CalibrationSummary {
    camera_matrix: [[f64; 3]; 3],
    dist_coeffs: [f64; 5],
    #[serde(skip_serializing_if = "Option::is_none")]
    rms_error: Option<f64>,
}

impl CalibrationSummary {
    fn new(k: &camcal::Intrinsics, rms_error: Option<f64>) -> Self {
        let m = &k.camera_matrix;
        Self {
            camera_matrix: [0, 1, 2].map(|r| [m[(r, 0)], m[(r, 1)], m[(r, 2)]]),
            dist_coeffs: k.distortion.to_array(),
            rms_error,
        }
    }
}

fn init_logging(verbose: bool, json: bool) {
    #[cfg(feature = "tracing")]
    {
        let _ = verbose;
        camcal::core::init_tracing(json);
    }
    #[cfg(not(feature = "tracing"))]
    {
        if json {
            eprintln!("warning: --json-log needs the `tracing` feature; using plain logs");
        }
        let level = if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        let _ = camcal::core::init_with_level(level);
    }
}

fn load_config(path: Option<&Path>) -> Result<CamcalConfig, Box<dyn Error>> {
    Ok(match path {
        Some(p) => CamcalConfig::load_json(p)?,
        None => CamcalConfig::default(),
    })
}

fn controller(cfg: &CamcalConfig, root: &Path) -> Controller {
    Controller::with_log_sink(Arc::new(ImageDirectoryBackend::new(root)))
        .with_join_timeout(cfg.join_timeout())
}

fn run_calibrate(mut cfg: CamcalConfig, args: CalibrateArgs) -> Result<String, Box<dyn Error>> {
    let mut session = match args.preset.as_deref() {
        Some(name) => SessionConfig::preset(name).ok_or_else(|| {
            format!(
                "unknown preset `{name}`; expected one of {}",
                SessionConfig::PRESETS.join(", ")
            )
        })?,
        None => cfg.calibration.clone(),
    };
    if args.max_attempts.is_some() {
        session.max_attempts_per_shot = args.max_attempts;
    }
    if args.no_delay {
        session = session.without_delays();
    }
    if let Some(output) = args.output {
        cfg.calibration_path = output;
    }
    session.output_path = Some(cfg.calibration_path.clone());

    let index = args.camera.camera.unwrap_or(cfg.camera_index);
    let mut controller = controller(&cfg, &args.camera.root).with_session_config(session);
    controller.start_calibration(index)?;
    let outcome = controller
        .wait_calibration(None)
        .ok_or("calibration worker stopped unexpectedly")??;
    let summary = CalibrationSummary::new(&outcome.intrinsics, Some(outcome.result.rms_error));
    Ok(serde_json::to_string_pretty(&summary)?)
}

fn run_undistort(args: UndistortArgs) -> Result<String, Box<dyn Error>> {
    let k = store::load(&args.calibration)?;
    let frame = load_gray(&args.input)?;
    let out = camcal::undistort(&frame, Some(&k))?;
    to_luma(&out)?.save(&args.output)?;
    Ok(format!("wrote {}", args.output.display()))
}

fn run_measure(mut cfg: CamcalConfig, args: MeasureArgs) -> Result<String, Box<dyn Error>> {
    if let Some(len) = args.marker_length {
        cfg.measurement.strategy = MeasurementStrategy::MarkerDisplacement {
            offset: args.offset,
            marker_length: len,
        };
    }
    if let Some(output) = args.output {
        cfg.measurement_path = output;
    }
    cfg.measurement.output_path = Some(cfg.measurement_path.clone());
    let calibration = args
        .calibration
        .unwrap_or_else(|| cfg.calibration_path.clone());
    let acknowledger: Arc<dyn Acknowledger> = if args.wait_enter {
        Arc::new(EnterAcknowledger)
    } else {
        Arc::new(ImmediateAcknowledger)
    };

    let index = args.camera.camera.unwrap_or(cfg.camera_index);
    let mut controller = controller(&cfg, &args.camera.root)
        .with_measure_config(cfg.measurement.clone())
        .with_acknowledger(acknowledger);
    controller.load_calibration(&calibration)?;
    controller.start_measurement(index, args.offset)?;
    let outcome = controller
        .wait_measurement(None)
        .ok_or("measurement worker stopped unexpectedly")??;
    Ok(match outcome {
        MeasurementOutcome::Displacement(record) => serde_json::to_string_pretty(&record)?,
        MeasurementOutcome::Recalibration(result) => serde_json::to_string_pretty(
            &CalibrationSummary::new(&result.intrinsics, Some(result.rms_error)),
        )?,
    })
}

fn run_show(args: ShowArgs) -> Result<String, Box<dyn Error>> {
    if let Some(path) = args.measurements {
        let entries = read_measurements(&path)?;
        return Ok(serde_json::to_string_pretty(&entries)?);
    }
    let path = args.calibration.ok_or("nothing to show")?;
    let k = store::load(&path)?;
    Ok(serde_json::to_string_pretty(&CalibrationSummary::new(&k, None))?)
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_log);
    let cfg = load_config(cli.config.as_deref())?;
    let text = match cli.command {
        Command::Calibrate(args) => run_calibrate(cfg, args)?,
        Command::Undistort(args) => run_undistort(args)?,
        Command::Measure(args) => run_measure(cfg, args)?,
        Command::Show(args) => run_show(args)?,
    };
    println!("{text}");
    Ok(())
}
