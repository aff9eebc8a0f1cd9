use clap::Parser;
use ledmap::{
    capture::{CancelToken, Capture, CaptureSummary, Outcome},
    config::CalibrationConfig,
    detector::Detector,
    session::CaptureSession,
    simulation::SimulatedRig,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::path::PathBuf;
use tracing::{info, warn};

/// Capture simulated sessions of a helical LED strip from a ring of cameras.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory that receives the session files.
    #[arg(short, long)]
    output: PathBuf,

    /// JSON params file, see the `params` binary.
    #[arg(short, long)]
    params: Option<PathBuf>,

    #[arg(short, long, default_value_t = 50)]
    count: usize,

    #[arg(short, long, default_value_t = 4)]
    angles: usize,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 480)]
    height: u32,

    /// Horizontal field of view in degrees.
    #[arg(long, default_value_t = 60.)]
    fov: f64,

    /// Camera distance from the vertical axis in metres.
    #[arg(long, default_value_t = 2.)]
    distance: f64,

    /// Probability that an LED is hidden from any one camera.
    #[arg(long, default_value_t = 0.1)]
    occlusion: f64,

    /// Override the settle delay from the params file.
    #[arg(long)]
    settle_delay_ms: Option<u64>,

    /// Also save every captured frame.
    #[arg(long)]
    save_frames: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let args = Args::parse();
    let mut config = match &args.params {
        Some(path) => CalibrationConfig::load(path).unwrap(),
        None => CalibrationConfig::default(),
    };
    if let Some(settle_delay_ms) = args.settle_delay_ms {
        config.capture.settle_delay_ms = settle_delay_ms;
    }
    config.validate().unwrap();
    std::fs::create_dir_all(&args.output).unwrap();

    let cameras =
        SimulatedRig::ring_cameras(args.angles, args.width, args.height, args.fov, args.distance);
    let mut rig = SimulatedRig::new(SimulatedRig::helix(args.count, 0.5, 1.5, 4.), cameras.clone())
        .with_seed(args.seed);

    let mut rng = StdRng::seed_from_u64(args.seed);
    for camera in 0..args.angles {
        for index in 0..args.count {
            if rng.random_bool(args.occlusion) {
                rig = rig.hide(camera, index);
            }
        }
    }

    let detector = Detector::new(config.detector);
    let cancel = CancelToken::new();
    cancel.cancel_on_interrupt().unwrap();
    for (camera, metadata) in cameras.iter().enumerate() {
        let angle_id = camera as u32;
        let path = args.output.join(CaptureSession::file_name(angle_id));

        let mut capture = Capture::new(angle_id, *metadata, args.count, detector, config.capture)
            .with_name(format!("simulated angle {angle_id}"));
        if args.save_frames {
            capture = capture.with_frame_dir(args.output.join(format!("angle_{angle_id}")));
        }

        let mut actuator = rig.actuator();
        let mut frames = rig.camera(camera).unwrap();
        let sweep = match path.exists() {
            true => {
                let session = CaptureSession::load(&path).unwrap();
                if session.is_complete() {
                    info!(angle_id, "session already complete");
                    continue;
                }
                let start = session.resume_index();
                capture.resume(session, start, &mut actuator, &mut frames, &cancel)
            }
            false => capture.run(0..args.count, &mut actuator, &mut frames, &cancel),
        }
        .unwrap();

        sweep.session.save(&path).unwrap();
        std::fs::write(
            args.output.join(CaptureSummary::file_name(angle_id)),
            sweep.summary.to_string(),
        )
        .unwrap();
        println!("{}", sweep.summary);

        if let Outcome::Interrupted { next_index } = sweep.outcome {
            warn!(angle_id, next_index, "partial session saved, rerun to resume");
            break;
        }
    }
}
