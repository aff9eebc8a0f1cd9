use approx::assert_relative_eq;
use ledmap::{
    camera::{CameraMetadata, CameraModel, RingPinhole},
    capture::{CancelToken, Capture},
    config::{CaptureParams, DetectorParams, ExportParams, TriangulationParams},
    detector::{Detector, OcclusionReason},
    export::Exporter,
    session::{CaptureSession, Detection},
    simulation::SimulatedRig,
    triangulate::{PositionEstimate, Triangulator},
};
use nalgebra::Point3;

const COUNT: usize = 4;

/// Sessions at 0, 90 and 180 degrees whose detector reports exact projections.
fn exact_sessions(points: &[Option<Point3<f64>>]) -> Vec<CaptureSession> {
    [0., 90., 180.]
        .iter()
        .enumerate()
        .map(|(angle_id, azimuth)| {
            let angle_id = angle_id as u32;
            let camera = CameraMetadata::on_ring(640, 480, 60., 2., *azimuth);
            let mut session = CaptureSession::new("exact", angle_id, points.len(), camera);
            for (index, point) in points.iter().enumerate() {
                let detection = match point.and_then(|p| RingPinhole.project(&p, &camera)) {
                    Some(pixel) => Detection::lit(index, angle_id, pixel, 1.),
                    None => Detection::occluded(index, angle_id, OcclusionReason::BelowThreshold),
                };
                session.record(detection).unwrap();
            }
            session
        })
        .collect()
}

fn points() -> Vec<Option<Point3<f64>>> {
    vec![
        Some(Point3::new(0., 0., 0.5)),
        None,
        Some(Point3::new(0.2, 0.1, -0.3)),
        Some(Point3::new(-0.1, 0.2, 0.1)),
    ]
}

#[test]
fn three_angles_recover_point_above_origin() {
    let sessions = exact_sessions(&points());
    let estimates = Triangulator::default()
        .triangulate_sessions(&sessions, &RingPinhole)
        .unwrap();

    assert_eq!(estimates.len(), COUNT);
    assert_relative_eq!(estimates[0].position, Point3::new(0., 0., 0.5), epsilon = 1e-6);
    assert_eq!(estimates[0].view_count, 3);
    assert!(estimates[0].rejected.is_empty());

    for index in [2, 3] {
        let truth = points()[index].unwrap();
        assert_relative_eq!(estimates[index].position, truth, epsilon = 1e-6);
    }
}

#[test]
fn occluded_everywhere_is_unmapped_and_excluded_from_normalization() {
    let sessions = exact_sessions(&points());
    let estimates = Triangulator::default()
        .triangulate_sessions(&sessions, &RingPinhole)
        .unwrap();
    assert_eq!(estimates[1], PositionEstimate::unmapped(1, 0));

    let exporter = Exporter::new(ExportParams::default()).with_angles([0, 1, 2]);
    let map = exporter.export(&estimates).unwrap();
    assert_eq!(map.metadata.count, COUNT);
    assert_eq!(map.metadata.unmapped_indices, vec![1]);
    assert_eq!(map.positions[1].index, 1);
    assert_eq!(
        (map.positions[1].x, map.positions[1].y, map.positions[1].z),
        (0., 0., 0.)
    );

    // Z spans 0.5 - (-0.3) in world units.
    assert_relative_eq!(map.metadata.original_height, 0.8, epsilon = 1e-6);
    let zs: Vec<f64> = [0, 2, 3].iter().map(|i| map.positions[*i].z).collect();
    let z_max = zs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let z_min = zs.iter().copied().fold(f64::INFINITY, f64::min);
    assert_relative_eq!(z_max - z_min, 1.0, epsilon = 1e-9);
    assert_relative_eq!(z_max + z_min, 0.0, epsilon = 1e-9);

    // Medians are taken over the three mapped points only.
    let mut xs: Vec<f64> = [0, 2, 3].iter().map(|i| map.positions[*i].x).collect();
    xs.sort_by(f64::total_cmp);
    assert_relative_eq!(xs[1], 0.0, epsilon = 1e-9);
    let mut ys: Vec<f64> = [0, 2, 3].iter().map(|i| map.positions[*i].y).collect();
    ys.sort_by(f64::total_cmp);
    assert_relative_eq!(ys[1], 0.0, epsilon = 1e-9);
}

#[test]
fn triangulation_leaves_sessions_untouched() {
    let sessions = exact_sessions(&points());
    let before = sessions.clone();
    Triangulator::default()
        .triangulate_sessions(&sessions, &RingPinhole)
        .unwrap();
    assert_eq!(sessions, before);
}

#[test]
fn degenerate_camera_fails_before_triangulating() {
    let mut sessions = exact_sessions(&points());
    let broken = CameraMetadata::on_ring(0, 480, 60., 2., 270.);
    sessions.push(CaptureSession::new("broken", 3, COUNT, broken));

    assert!(matches!(
        Triangulator::default().triangulate_sessions(&sessions, &RingPinhole),
        Err(ledmap::Error::Config(_))
    ));
}

#[test]
fn simulated_capture_to_position_map() {
    let points = SimulatedRig::helix(12, 0.4, 1.0, 2.);
    let rig = SimulatedRig::new(points.clone(), SimulatedRig::ring_cameras(4, 160, 120, 60., 2.))
        .with_seed(7)
        .with_blob(2.5, 250)
        .hide(0, 5)
        .hide(1, 5)
        .hide(2, 5)
        .hide(3, 5)
        .hide(2, 8);

    let params = CaptureParams {
        settle_delay_ms: 0,
        initial_backoff_ms: 0,
        warmup_frames: 1,
        ..Default::default()
    };
    let detector = Detector::new(DetectorParams::default());
    let cancel = CancelToken::new();

    let sessions: Vec<_> = rig
        .cameras()
        .iter()
        .enumerate()
        .map(|(camera, metadata)| {
            let capture = Capture::new(camera as u32, *metadata, points.len(), detector, params);
            let sweep = capture
                .run(
                    0..points.len(),
                    &mut rig.actuator(),
                    &mut rig.camera(camera).unwrap(),
                    &cancel,
                )
                .unwrap();
            assert!(sweep.session.is_complete());
            sweep.session
        })
        .collect();
    assert_eq!(rig.lit(), None);

    let estimates = Triangulator::new(TriangulationParams::default())
        .triangulate_sessions(&sessions, &RingPinhole)
        .unwrap();

    assert!(!estimates[5].is_mapped());
    assert!(estimates[8].is_mapped());
    assert!(estimates[8].view_count <= 3);
    for (estimate, truth) in estimates.iter().zip(&points) {
        if estimate.is_mapped() {
            assert!(
                (estimate.position - truth).norm() < 0.02,
                "index {} landed {} m away",
                estimate.index,
                (estimate.position - truth).norm()
            );
        }
    }

    let map = Exporter::default().export(&estimates).unwrap();
    assert_eq!(map.metadata.unmapped_indices, vec![5]);
    assert_eq!(map.metadata.mapped, 11);
    for estimate in estimates.iter().filter(|e| e.is_mapped()) {
        let normalized = map.get(estimate.index).unwrap();
        let back = map.to_world(&Point3::new(normalized.x, normalized.y, normalized.z));
        assert_relative_eq!(back, estimate.position, epsilon = 1e-9);
    }
}
