use approx::assert_relative_eq;
use ledmap::{
    Error,
    camera::{CameraMetadata, Pixel},
    detector::OcclusionReason,
    session::{CaptureSession, Detection},
};
use serde_json::Value;
use std::path::Path;

fn session(angle_id: u32, count: usize) -> CaptureSession {
    let camera = CameraMetadata::on_ring(640, 480, 60., 2., angle_id as f64 * 90.);
    let mut session = CaptureSession::new(format!("angle {angle_id}"), angle_id, count, camera);
    for index in 0..count {
        let detection = match index % 3 {
            2 => Detection::occluded(index, angle_id, OcclusionReason::BelowThreshold),
            _ => Detection::lit(index, angle_id, Pixel::new(12.25 * index as f64, 40.5), 0.75),
        };
        session.record(detection).unwrap();
    }
    session
}

fn edit(path: &Path, change: impl FnOnce(&mut Value)) {
    let mut value: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    change(&mut value);
    std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

#[test]
fn saved_session_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(CaptureSession::file_name(1));
    let original = session(1, 7);
    original.save(&path).unwrap();

    let loaded = CaptureSession::load(&path).unwrap();
    assert_eq!(loaded.name(), original.name());
    assert_eq!(loaded.created(), original.created());
    assert_eq!(loaded.angle_id(), 1);
    assert_eq!(loaded.count(), 7);
    assert_eq!(loaded.detections(), original.detections());
    assert_eq!(loaded.occluded_count(), 2);
    assert_relative_eq!(
        loaded.camera().focal_length_px(),
        original.camera().focal_length_px(),
        epsilon = 1e-9
    );
    assert_relative_eq!(
        loaded.camera().pose().position,
        original.camera().pose().position,
        epsilon = 1e-9
    );

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn occlusion_reasons_are_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let mut original = session(0, 2);
    original
        .record(Detection::occluded(
            1,
            0,
            OcclusionReason::Ambiguous { bright_pixels: 412 },
        ))
        .unwrap();
    original.save(&path).unwrap();

    let loaded = CaptureSession::load(&path).unwrap();
    assert_eq!(
        loaded.get(1).unwrap().reason(),
        Some(OcclusionReason::Ambiguous { bright_pixels: 412 })
    );
}

#[test]
fn garbage_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session_angle_0.json");
    std::fs::write(&path, "{\"version\": \"1.0\", \"name\": ").unwrap();

    assert!(matches!(
        CaptureSession::load(&path),
        Err(Error::CorruptSession { path: reported, .. }) if reported == path
    ));
}

#[test]
fn binary_garbage_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session_angle_0.json");
    std::fs::write(&path, [0xff, 0xfe, 0x00, 0x7b]).unwrap();

    assert!(matches!(
        CaptureSession::load(&path),
        Err(Error::CorruptSession { path: reported, .. }) if reported == path
    ));
}

#[test]
fn duplicated_index_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session_angle_0.json");
    session(0, 4).save(&path).unwrap();
    edit(&path, |value| {
        let detections = value["detections"].as_array_mut().unwrap();
        let first = detections[0].clone();
        detections.insert(1, first);
    });

    assert!(matches!(
        CaptureSession::load(&path),
        Err(Error::CorruptSession { .. })
    ));
}

#[test]
fn out_of_range_confidence_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session_angle_0.json");
    session(0, 4).save(&path).unwrap();
    edit(&path, |value| value["detections"][0]["confidence"] = 1.5.into());

    let Err(Error::CorruptSession { reason, .. }) = CaptureSession::load(&path) else {
        panic!("confidence 1.5 was accepted");
    };
    assert!(reason.contains("confidence"), "{reason}");
}

#[test]
fn unknown_major_version_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session_angle_0.json");
    session(0, 1).save(&path).unwrap();
    edit(&path, |value| value["version"] = "2.0".into());

    assert!(matches!(
        CaptureSession::load(&path),
        Err(Error::CorruptSession { .. })
    ));
}

#[test]
fn directory_loads_in_angle_order() {
    let dir = tempfile::tempdir().unwrap();
    for angle_id in [10, 2, 0] {
        session(angle_id, 5)
            .save(dir.path().join(CaptureSession::file_name(angle_id)))
            .unwrap();
    }
    std::fs::write(dir.path().join("session_angle_2_summary.txt"), "summary").unwrap();
    std::fs::write(dir.path().join("notes.json"), "not a session").unwrap();

    let sessions = CaptureSession::load_dir(dir.path()).unwrap();
    let angles: Vec<u32> = sessions.iter().map(|s| s.angle_id()).collect();
    assert_eq!(angles, vec![0, 2, 10]);
}

#[test]
fn directory_with_mismatched_counts_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    session(0, 5)
        .save(dir.path().join(CaptureSession::file_name(0)))
        .unwrap();
    session(1, 6)
        .save(dir.path().join(CaptureSession::file_name(1)))
        .unwrap();

    assert!(matches!(
        CaptureSession::load_dir(dir.path()),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn directory_with_repeated_angle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    session(3, 5)
        .save(dir.path().join(CaptureSession::file_name(3)))
        .unwrap();
    session(3, 5)
        .save(dir.path().join("session_angle_3_retake.json"))
        .unwrap();

    assert!(matches!(
        CaptureSession::load_dir(dir.path()),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn empty_directory_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        CaptureSession::load_dir(dir.path()),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn one_corrupt_file_fails_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    session(0, 5)
        .save(dir.path().join(CaptureSession::file_name(0)))
        .unwrap();
    std::fs::write(dir.path().join(CaptureSession::file_name(1)), "[]").unwrap();

    assert!(matches!(
        CaptureSession::load_dir(dir.path()),
        Err(Error::CorruptSession { .. })
    ));
}
