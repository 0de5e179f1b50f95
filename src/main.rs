use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::time::{interval, Duration, MissedTickBehavior};

use marker_tracker_rs::publisher::{JsonLinesPublisher, PoseBoard, PosePublisher};
use marker_tracker_rs::types::{Detection, Extrinsics, Timestamp, VehicleState};
use marker_tracker_rs::{CycleStatus, Session, TrackerConfig};

#[derive(Parser, Debug)]
#[command(name = "marker_tracker")]
#[command(about = "Fiducial marker tracker - per-tag EKF replay", long_about = None)]
struct Args {
    /// Recorded cycles, one JSON object per line (.jsonl or .jsonl.gz)
    #[arg(long)]
    input: PathBuf,

    /// Tracker configuration (JSON); defaults are used when absent
    #[arg(long)]
    config: Option<PathBuf>,

    /// State log output, overrides the configured path
    #[arg(long)]
    log: Option<PathBuf>,

    /// Log decimation, overrides the configured value
    #[arg(long)]
    decimation: Option<u32>,

    /// Pace cycles at the configured period instead of replaying flat out
    #[arg(long, default_value_t = false)]
    realtime: bool,

    /// Do not print published poses; only the final summary
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

/// One recorded control cycle.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReplayFrame {
    timestamp: Option<Timestamp>,
    extrinsics: Option<Extrinsics>,
    vehicle: Option<VehicleState>,
    detections: Vec<Detection>,
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn load_frames(path: &Path) -> Result<Vec<ReplayFrame>> {
    let reader = open_input(path)?;
    let mut frames = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: ReplayFrame = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: bad cycle record", path.display(), lineno + 1))?;
        frames.push(frame);
    }
    Ok(frames)
}

fn load_config(args: &Args) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(path) = &args.log {
        config.log.path = Some(path.clone());
    }
    if let Some(k) = args.decimation {
        config.log.decimation = k;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let frames = load_frames(&args.input)?;
    let mut session = Session::with_config_log(load_config(&args)?)?;
    let period_ms = session.config().period_ms;
    info!(
        "[{}] Replaying {} cycles from {} (period {} ms)",
        Utc::now().format("%H:%M:%S"),
        frames.len(),
        args.input.display(),
        period_ms
    );

    let mut ticker = interval(Duration::from_millis(period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let stdout = io::stdout();
    let mut printer = JsonLinesPublisher::new(stdout.lock());
    let mut board = PoseBoard::new();
    let mut vehicle: Option<VehicleState> = None;

    for frame in frames {
        if args.realtime {
            ticker.tick().await;
        }

        if let Some(extrinsics) = &frame.extrinsics {
            session.set_extrinsics(extrinsics);
        }
        // Last received vehicle state stays current until replaced
        if frame.vehicle.is_some() {
            vehicle = frame.vehicle;
        }
        for detection in frame.detections {
            session.push_detection(detection);
        }

        let now = frame.timestamp.unwrap_or_else(Timestamp::now);
        let publisher: &mut dyn PosePublisher = if args.quiet {
            &mut board
        } else {
            &mut printer
        };
        let status = session.cycle(vehicle.as_ref(), now, publisher);
        if status == CycleStatus::Paused {
            debug!("Cycle at {:.3}s paused: no extrinsics", now.as_secs_f64());
        }
    }

    let tags = session.bank().identities();
    let summary = session.finish();
    if summary.paused_cycles == summary.cycles && summary.cycles > 0 {
        warn!("No extrinsics in the recording; nothing was tracked");
    }
    info!("Tracked tags: {:?}", tags);
    eprintln!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
