use clap::Parser;
use ledmap::{
    actuator::Rgb,
    capture::parse_frame_file_name,
    config::CalibrationConfig,
    detector::Detector,
    frame::Frame,
    session::{CaptureSession, Detection},
};
use std::path::PathBuf;
use tracing::info;

/// Re-run detection over saved `led_NNN.png` frames, for example after
/// tuning the detector params.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding the saved frames.
    #[arg(short, long)]
    frames: PathBuf,

    /// The session the frames were captured for.
    #[arg(short, long)]
    session: PathBuf,

    /// Where to write the rebuilt session.
    #[arg(short, long)]
    output: PathBuf,

    /// Frame captured with every LED off, subtracted before detection.
    #[arg(short, long)]
    baseline: Option<PathBuf>,

    /// JSON params file, see the `params` binary.
    #[arg(short, long)]
    params: Option<PathBuf>,
}

fn main() {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let args = Args::parse();
    let config = match &args.params {
        Some(path) => CalibrationConfig::load(path).unwrap(),
        None => CalibrationConfig::default(),
    };

    let original = CaptureSession::load(&args.session).unwrap();
    let mut session = CaptureSession::new(
        original.name(),
        original.angle_id(),
        original.count(),
        *original.camera(),
    );

    let color = Rgb::from(config.capture.color);
    let open = |path: &PathBuf| match color.dominant_channel() {
        Some(_) => Frame::open_filtered(path, color).unwrap(),
        None => Frame::open(path).unwrap(),
    };
    let baseline = args.baseline.as_ref().map(open);

    let mut frames: Vec<_> = std::fs::read_dir(&args.frames)
        .unwrap()
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter_map(|path| parse_frame_file_name(&path).map(|index| (index, path)))
        .filter(|(index, _)| *index < original.count())
        .collect();
    frames.sort();

    let detector = Detector::new(config.detector);
    for (index, path) in &frames {
        let observation = detector.detect(&open(path), baseline.as_ref()).unwrap();
        session
            .record(Detection::from_observation(
                *index,
                original.angle_id(),
                observation,
            ))
            .unwrap();
    }

    // Indices without a saved frame keep their original detection.
    for detection in original.detections() {
        if session.get(detection.index()).is_none() {
            session.record(*detection).unwrap();
        }
    }

    info!(
        redetected = frames.len(),
        lit = session.lit_count(),
        occluded = session.occluded_count(),
        "rebuilt session"
    );
    session.save(&args.output).unwrap();
}
