use clap::Parser;
use ledmap::{
    camera::RingPinhole,
    config::CalibrationConfig,
    export::{Exporter, detailed_path},
    report::{Coverage, QualityReport},
    session::CaptureSession,
    triangulate::Triangulator,
};
use std::path::PathBuf;
use tracing::warn;

/// Triangulate LED positions from session files and export a position map.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding `session_angle_*.json` files.
    #[arg(short, long)]
    sessions: PathBuf,

    /// Where to write the position map. Must not exist yet.
    #[arg(short, long)]
    output: PathBuf,

    /// JSON params file, see the `params` binary.
    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Name stored in the map metadata.
    #[arg(short, long)]
    name: Option<String>,
}

fn main() {
    let subscriber = tracing_subscriber::FmtSubscriber::new();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let args = Args::parse();
    let mut config = match &args.params {
        Some(path) => CalibrationConfig::load(path).unwrap(),
        None => CalibrationConfig::default(),
    };
    if let Some(name) = args.name {
        config.export.name = name;
    }
    config.validate().unwrap();

    let sessions = CaptureSession::load_dir(&args.sessions).unwrap();
    let coverage = Coverage::from_sessions(&sessions, 2);
    if !coverage.under_covered().is_empty() {
        warn!(%coverage, "some LEDs cannot be triangulated");
    }

    let estimates = Triangulator::new(config.triangulation)
        .triangulate_sessions(&sessions, &RingPinhole)
        .unwrap();

    let exporter = Exporter::new(config.export.clone())
        .with_angles(sessions.iter().map(|session| session.angle_id()));
    let detailed = exporter.export_detailed(&estimates).unwrap();
    let map = detailed.plain();
    map.save(&args.output).unwrap();
    detailed.save(detailed_path(&args.output)).unwrap();

    println!(
        "{}",
        QualityReport::new(&sessions, &estimates, &config.triangulation).with_map(&map)
    );
}
