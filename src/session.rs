//! Per-angle capture records and their on-disk form.
//!
//! A [`CaptureSession`] holds exactly one [`Detection`] per LED index for one
//! camera placement. Occluded detections are kept so coverage can be audited
//! later. Sessions are the durable checkpoint of a sweep: they are written as
//! a unit and an interrupted sweep is resumed by appending, never by editing
//! earlier indices.

use crate::{
    camera::{CameraMetadata, Pixel},
    detector::{Observation, OcclusionReason},
    error::{Error, Result},
};
use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};
use tracing::warn;

/// Format version written into every session file.
pub const SESSION_VERSION: &str = "1.0";

/// The detector's verdict for one LED index seen from one angle.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Detection {
    index: usize,
    angle_id: u32,
    pixel: Option<Pixel>,
    confidence: f64,
    occluded: bool,
    #[cfg_attr(feature = "serde", serde(default))]
    brightness: u8,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    reason: Option<OcclusionReason>,
}

impl Detection {
    pub fn lit(index: usize, angle_id: u32, pixel: Pixel, confidence: f64) -> Self {
        Self {
            index,
            angle_id,
            pixel: Some(pixel),
            confidence,
            occluded: false,
            brightness: u8::MAX,
            reason: None,
        }
    }

    pub fn occluded(index: usize, angle_id: u32, reason: OcclusionReason) -> Self {
        Self {
            index,
            angle_id,
            pixel: None,
            confidence: 0.,
            occluded: true,
            brightness: 0,
            reason: Some(reason),
        }
    }

    /// Attach an index and angle to a detector [`Observation`].
    pub fn from_observation(index: usize, angle_id: u32, observation: Observation) -> Self {
        match observation {
            Observation::Lit {
                pixel,
                brightness,
                confidence,
            } => Self {
                brightness,
                ..Self::lit(index, angle_id, pixel, confidence)
            },
            Observation::Occluded { reason, brightness } => Self {
                brightness,
                ..Self::occluded(index, angle_id, reason)
            },
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn angle_id(&self) -> u32 {
        self.angle_id
    }

    /// The detected pixel, `None` when occluded.
    pub fn pixel(&self) -> Option<Pixel> {
        self.pixel
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn is_occluded(&self) -> bool {
        self.occluded
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    pub fn reason(&self) -> Option<OcclusionReason> {
        self.reason
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "index {} has confidence {} outside [0, 1]",
                self.index, self.confidence
            ));
        }
        match (self.occluded, self.pixel) {
            (false, None) => Err(format!("index {} is lit but has no pixel", self.index)),
            (true, Some(_)) => Err(format!("index {} is occluded but has a pixel", self.index)),
            (false, Some(pixel)) if !pixel.is_finite() => {
                Err(format!("index {} has a non-finite pixel", self.index))
            }
            _ => Ok(()),
        }
    }
}

/// Every detection taken from one camera placement.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CaptureSession {
    version: String,
    name: String,
    created: DateTime<Utc>,
    angle_id: u32,

    /// Number of LED indices in the installation.
    count: usize,
    camera: CameraMetadata,

    /// Sorted by index, at most one per index.
    detections: Vec<Detection>,
}

impl CaptureSession {
    /// Creates an empty session for `count` LEDs seen from `angle_id`.
    pub fn new(
        name: impl Into<String>,
        angle_id: u32,
        count: usize,
        camera: CameraMetadata,
    ) -> Self {
        Self {
            version: SESSION_VERSION.into(),
            name: name.into(),
            created: Utc::now(),
            angle_id,
            count,
            camera,
            detections: Vec::with_capacity(count),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn angle_id(&self) -> u32 {
        self.angle_id
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn camera(&self) -> &CameraMetadata {
        &self.camera
    }

    /// Detections in ascending index order.
    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn get(&self, index: usize) -> Option<&Detection> {
        self.detections
            .binary_search_by_key(&index, |d| d.index)
            .ok()
            .map(|i| &self.detections[i])
    }

    /// Records `detection`, replacing any earlier detection of the same index.
    ///
    /// Returns the replaced detection. The detection must belong to this
    /// session's angle and lie inside `0..count`.
    pub fn record(&mut self, detection: Detection) -> Result<Option<Detection>> {
        if detection.angle_id != self.angle_id {
            return Err(Error::InvalidInput(format!(
                "detection from angle {} recorded into session for angle {}",
                detection.angle_id, self.angle_id
            )));
        }
        if detection.index >= self.count {
            return Err(Error::InvalidInput(format!(
                "index {} is outside 0..{}",
                detection.index, self.count
            )));
        }

        match self
            .detections
            .binary_search_by_key(&detection.index, |d| d.index)
        {
            Ok(i) => {
                warn!(
                    angle_id = self.angle_id,
                    index = detection.index,
                    "index recorded twice, keeping the latest detection"
                );
                Ok(Some(std::mem::replace(&mut self.detections[i], detection)))
            }
            Err(i) => {
                self.detections.insert(i, detection);
                Ok(None)
            }
        }
    }

    /// Merges the detections of `other` into this session.
    ///
    /// Both sessions must describe the same angle, camera and LED count.
    /// Detections in `other` win over existing ones for the same index.
    pub fn merge(&mut self, other: CaptureSession) -> Result<()> {
        if other.angle_id != self.angle_id
            || other.count != self.count
            || other.camera != self.camera
        {
            return Err(Error::InvalidInput(format!(
                "cannot merge session for angle {} ({} LEDs) into angle {} ({} LEDs)",
                other.angle_id, other.count, self.angle_id, self.count
            )));
        }

        for detection in other.detections {
            self.record(detection)?;
        }
        Ok(())
    }

    /// Indices in `0..count` with no detection yet.
    pub fn missing_indices(&self) -> Vec<usize> {
        let mut recorded = self.detections.iter().map(|d| d.index).peekable();
        (0..self.count)
            .filter(|index| match recorded.peek() {
                Some(next) if next == index => {
                    recorded.next();
                    false
                }
                _ => true,
            })
            .collect()
    }

    /// True when every index in `0..count` has exactly one detection.
    pub fn is_complete(&self) -> bool {
        self.detections.len() == self.count
    }

    /// Index of the first missing detection, where a resumed sweep starts.
    pub fn resume_index(&self) -> usize {
        self.missing_indices().first().copied().unwrap_or(self.count)
    }

    pub fn lit_count(&self) -> usize {
        self.detections.iter().filter(|d| !d.occluded).count()
    }

    pub fn occluded_count(&self) -> usize {
        self.detections.iter().filter(|d| d.occluded).count()
    }

    /// Checks the structural invariants of a session.
    ///
    /// Detections must be sorted, unique, inside `0..count`, belong to this
    /// angle, and be internally consistent. The camera metadata must describe
    /// a usable camera.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version.split('.').next() != SESSION_VERSION.split('.').next() {
            return Err(format!("unsupported session version {}", self.version));
        }
        self.camera.validate().map_err(|err| err.to_string())?;

        let mut last = None;
        for detection in &self.detections {
            if detection.angle_id != self.angle_id {
                return Err(format!(
                    "index {} belongs to angle {}, not {}",
                    detection.index, detection.angle_id, self.angle_id
                ));
            }
            if detection.index >= self.count {
                return Err(format!(
                    "index {} is outside 0..{}",
                    detection.index, self.count
                ));
            }
            if let Some(last) = last
                && detection.index <= last
            {
                return Err(format!(
                    "index {} is duplicated or out of order",
                    detection.index
                ));
            }
            detection.validate()?;
            last = Some(detection.index);
        }
        Ok(())
    }

    /// The conventional file name for a session captured from `angle_id`.
    pub fn file_name(angle_id: u32) -> String {
        format!("session_angle_{angle_id}.json")
    }
}

#[cfg(feature = "serde")]
impl CaptureSession {
    /// Writes the session as JSON.
    ///
    /// The file is written next to `path` and renamed into place, so readers
    /// never observe a partially written session.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let staging = staging_path(path);
        let file = std::io::BufWriter::new(std::fs::File::create(&staging)?);
        serde_json::to_writer_pretty(file, self)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    /// Reads and validates a session file.
    ///
    /// Any parse or validation failure aborts loading the whole file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let corrupt = |reason: String| Error::CorruptSession {
            path: path.to_path_buf(),
            reason,
        };

        let bytes = std::fs::read(path)?;
        let session: Self =
            serde_json::from_slice(&bytes).map_err(|err| corrupt(err.to_string()))?;
        session.validate().map_err(corrupt)?;
        Ok(session)
    }

    /// Loads every `session_angle_*.json` file in `dir`, ordered by angle.
    ///
    /// All sessions must agree on the LED count and no angle may appear twice.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Vec<Self>> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("session_angle_") && name.ends_with(".json"))
            })
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no session files found in {}",
                dir.display()
            )));
        }

        let mut sessions = paths
            .iter()
            .map(Self::load)
            .collect::<Result<Vec<_>>>()?;
        sessions.sort_by_key(|session| session.angle_id);

        check_compatible(&sessions)?;
        Ok(sessions)
    }
}

/// Sessions fed to triangulation together must share a LED count and have
/// distinct angles.
pub fn check_compatible(sessions: &[CaptureSession]) -> Result<()> {
    let Some(first) = sessions.first() else {
        return Ok(());
    };
    for session in sessions {
        if session.count != first.count {
            return Err(Error::InvalidInput(format!(
                "angle {} has {} LEDs but angle {} has {}",
                session.angle_id, session.count, first.angle_id, first.count
            )));
        }
    }
    let mut seen = HashSet::new();
    for session in sessions {
        if !seen.insert(session.angle_id) {
            return Err(Error::InvalidInput(format!(
                "angle {} was captured more than once",
                session.angle_id
            )));
        }
    }
    Ok(())
}

#[cfg(feature = "serde")]
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}
