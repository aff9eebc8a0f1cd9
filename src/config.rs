//! Tunable parameters for every calibration stage.
//!
//! A [`CalibrationConfig`] is usually loaded once from a JSON params file and
//! validated before any capture or triangulation work begins. Invalid values
//! are configuration faults and are reported immediately.

use crate::error::{Error, Result};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters of the brightest-pixel LED detector.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DetectorParams {
    /// Minimum peak intensity for a frame to contain a lit LED.
    pub brightness_threshold: u8,

    /// Maximum number of near-peak pixels before a frame is ambiguous.
    pub ambiguity_threshold: usize,

    /// Fraction of the peak intensity a pixel must reach to count as bright.
    pub peak_fraction: f64,

    /// Radius in pixels of the window used for the centroid refinement.
    ///
    /// Zero reports the raw peak pixel.
    pub centroid_radius: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            brightness_threshold: 200,
            ambiguity_threshold: 100,
            peak_fraction: 0.95,
            centroid_radius: 2,
        }
    }
}

/// Parameters of the per-angle capture loop.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CaptureParams {
    /// Time between illuminating an LED and capturing the frame.
    ///
    /// Must exceed any debounce applied by the actuator.
    pub settle_delay_ms: u64,

    /// Attempts per actuator command or frame capture, including the first.
    pub max_attempts: u32,

    /// Wait before the first retry.
    pub initial_backoff_ms: u64,

    /// Multiplier applied to the wait after every failed retry.
    pub backoff_factor: f64,

    /// Frames discarded after opening the camera so exposure can settle.
    pub warmup_frames: usize,

    /// Capture a dark frame once and subtract it from every capture.
    pub background_subtraction: bool,

    /// Brightness passed to the actuator when lighting a single LED.
    pub brightness: u8,

    /// Colour passed to the actuator when lighting a single LED.
    pub color: [u8; 3],
}

impl CaptureParams {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Returns the wait before retry number `retry` (zero based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.powi(retry as i32);
        Duration::from_millis((self.initial_backoff_ms as f64 * factor).round() as u64)
    }
}

impl Default for CaptureParams {
    fn default() -> Self {
        Self {
            settle_delay_ms: 75,
            max_attempts: 3,
            initial_backoff_ms: 50,
            backoff_factor: 2.0,
            warmup_frames: 5,
            background_subtraction: false,
            brightness: 255,
            color: [255, 255, 255],
        }
    }
}

/// Parameters of the multi-view triangulation.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TriangulationParams {
    /// A ray is an outlier when its residual exceeds this multiple of the
    /// median residual.
    pub outlier_multiple: f64,

    /// Residuals at or below this distance are never treated as outliers.
    pub residual_floor: f64,

    /// Distance at which the residual term of the confidence drops to 1/e.
    pub residual_scale: f64,

    /// Smallest acceptable singular value of the normal equations, per ray.
    pub min_conditioning: f64,

    /// Fits closer than this to the origin collide with the unmapped sentinel.
    pub origin_epsilon: f64,

    /// Estimates below this confidence are reported for review.
    pub low_confidence: f64,
}

impl Default for TriangulationParams {
    fn default() -> Self {
        Self {
            outlier_multiple: 2.0,
            residual_floor: 0.01,
            residual_scale: 0.02,
            min_conditioning: 1e-3,
            origin_epsilon: 1e-6,
            low_confidence: 0.4,
        }
    }
}

/// Parameters of the position map export.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExportParams {
    pub name: String,

    /// Heights below this are treated as flat and left unscaled.
    pub min_height: f64,

    /// Normalized points closer than this to the origin are flagged.
    pub origin_epsilon: f64,
}

impl Default for ExportParams {
    fn default() -> Self {
        Self {
            name: "Calibrated installation".into(),
            min_height: 1e-6,
            origin_epsilon: 1e-6,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CalibrationConfig {
    pub detector: DetectorParams,
    pub capture: CaptureParams,
    pub triangulation: TriangulationParams,
    pub export: ExportParams,
}

impl CalibrationConfig {
    /// Read a config from a JSON params file and validate it.
    #[cfg(feature = "serde")]
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let serialized = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&serialized)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        if d.brightness_threshold == 0 {
            return Err(Error::Config("brightness threshold must be positive".into()));
        }
        if d.ambiguity_threshold == 0 {
            return Err(Error::Config("ambiguity threshold must be positive".into()));
        }
        if !(d.peak_fraction > 0.0 && d.peak_fraction < 1.0) {
            return Err(Error::Config(format!(
                "peak fraction must be in (0, 1), got {}",
                d.peak_fraction
            )));
        }

        let c = &self.capture;
        if c.max_attempts == 0 {
            return Err(Error::Config("at least one attempt is required".into()));
        }
        if !c.backoff_factor.is_finite() || c.backoff_factor < 1.0 {
            return Err(Error::Config(format!(
                "backoff factor must be at least 1, got {}",
                c.backoff_factor
            )));
        }

        let t = &self.triangulation;
        positive("outlier multiple", t.outlier_multiple)?;
        if t.outlier_multiple < 1.0 {
            return Err(Error::Config(format!(
                "outlier multiple must be at least 1, got {}",
                t.outlier_multiple
            )));
        }
        positive("residual floor", t.residual_floor)?;
        positive("residual scale", t.residual_scale)?;
        positive("minimum conditioning", t.min_conditioning)?;
        positive("origin epsilon", t.origin_epsilon)?;
        if !(0.0..=1.0).contains(&t.low_confidence) {
            return Err(Error::Config(format!(
                "low confidence threshold must be in [0, 1], got {}",
                t.low_confidence
            )));
        }

        positive("minimum height", self.export.min_height)?;
        positive("export origin epsilon", self.export.origin_epsilon)?;

        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    match value.is_finite() && value > 0.0 {
        true => Ok(()),
        false => Err(Error::Config(format!(
            "{name} must be finite and positive, got {value}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_is_valid() {
        CalibrationConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case(|c: &mut CalibrationConfig| c.detector.peak_fraction = 0.0)]
    #[case(|c: &mut CalibrationConfig| c.detector.peak_fraction = 1.0)]
    #[case(|c: &mut CalibrationConfig| c.detector.ambiguity_threshold = 0)]
    #[case(|c: &mut CalibrationConfig| c.capture.max_attempts = 0)]
    #[case(|c: &mut CalibrationConfig| c.capture.backoff_factor = 0.5)]
    #[case(|c: &mut CalibrationConfig| c.triangulation.outlier_multiple = 0.9)]
    #[case(|c: &mut CalibrationConfig| c.triangulation.residual_floor = -1.0)]
    #[case(|c: &mut CalibrationConfig| c.triangulation.min_conditioning = f64::NAN)]
    #[case(|c: &mut CalibrationConfig| c.triangulation.low_confidence = 1.5)]
    fn invalid_config(#[case] edit: fn(&mut CalibrationConfig)) {
        let mut config = CalibrationConfig::default();
        edit(&mut config);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let params = CaptureParams {
            initial_backoff_ms: 10,
            backoff_factor: 2.0,
            ..Default::default()
        };
        assert_eq!(params.backoff(0), Duration::from_millis(10));
        assert_eq!(params.backoff(1), Duration::from_millis(20));
        assert_eq!(params.backoff(3), Duration::from_millis(80));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_json_uses_defaults() {
        let config: CalibrationConfig =
            serde_json::from_str(r#"{ "capture": { "settle_delay_ms": 100 } }"#).unwrap();
        assert_eq!(config.capture.settle_delay_ms, 100);
        assert_eq!(config.capture.max_attempts, 3);
        assert_eq!(config.detector, DetectorParams::default());
    }
}
