//! Brightest-pixel LED detection.
//!
//! The detector assumes a frame shows at most one lit LED under a stable
//! exposure. Frames without a bright enough peak, and frames where the peak
//! is shared by too many pixels, are reported as occluded instead of
//! returning a pixel that is likely to be wrong.

use crate::{
    camera::Pixel,
    config::DetectorParams,
    error::Result,
    frame::Frame,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use rayon::prelude::*;
use std::cmp::Reverse;

/// Why a detection carries no usable pixel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum OcclusionReason {
    /// The peak intensity never reached the brightness threshold.
    BelowThreshold,

    /// Too many pixels were close to the peak, e.g. reflections or more
    /// than one lit region.
    Ambiguous { bright_pixels: usize },

    /// The actuator could not be commanded after all retries.
    ActuatorFault,

    /// No frame could be captured after all retries.
    CaptureFault,
}

impl std::fmt::Display for OcclusionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OcclusionReason::BelowThreshold => write!(f, "below brightness threshold"),
            OcclusionReason::Ambiguous { bright_pixels } => {
                write!(f, "ambiguous detection: {bright_pixels} bright pixels")
            }
            OcclusionReason::ActuatorFault => write!(f, "actuator fault"),
            OcclusionReason::CaptureFault => write!(f, "capture fault"),
        }
    }
}

/// The result of running the detector over one frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Observation {
    Lit {
        pixel: Pixel,
        brightness: u8,
        confidence: f64,
    },
    Occluded {
        reason: OcclusionReason,
        brightness: u8,
    },
}

impl Observation {
    pub fn is_occluded(&self) -> bool {
        matches!(self, Observation::Occluded { .. })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Detector {
    params: DetectorParams,
}

impl Detector {
    pub fn new(params: DetectorParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    /// Locate the lit LED in `frame`.
    ///
    /// When a `baseline` frame with no LED lit is given it is subtracted
    /// first. Not finding an LED is a normal [`Observation::Occluded`]
    /// outcome; only a baseline that does not match the frame is an error.
    pub fn detect(&self, frame: &Frame, baseline: Option<&Frame>) -> Result<Observation> {
        let subtracted;
        let frame = match baseline {
            Some(baseline) => {
                subtracted = frame.subtract(baseline)?;
                &subtracted
            }
            None => frame,
        };

        // Highest intensity wins, ties go to the first pixel in row-major order.
        let (peak, Reverse(offset)) = frame
            .as_slice()
            .par_iter()
            .enumerate()
            .map(|(i, value)| (*value, Reverse(i)))
            .max()
            .unwrap_or((0, Reverse(0)));

        if peak < self.params.brightness_threshold {
            return Ok(Observation::Occluded {
                reason: OcclusionReason::BelowThreshold,
                brightness: peak,
            });
        }

        let cutoff = self.params.peak_fraction * peak as f64;
        let bright_pixels = frame
            .as_slice()
            .par_iter()
            .filter(|value| **value as f64 > cutoff)
            .count();

        if bright_pixels > self.params.ambiguity_threshold {
            return Ok(Observation::Occluded {
                reason: OcclusionReason::Ambiguous { bright_pixels },
                brightness: peak,
            });
        }

        let confidence =
            (1. - bright_pixels as f64 / self.params.ambiguity_threshold as f64).clamp(0., 1.);

        Ok(Observation::Lit {
            pixel: self.centroid(frame, frame.coords(offset), cutoff),
            brightness: peak,
            confidence,
        })
    }

    /// Intensity-weighted centroid of the bright pixels around `peak`.
    fn centroid(&self, frame: &Frame, peak: (u32, u32), cutoff: f64) -> Pixel {
        let r = self.params.centroid_radius;
        let (px, py) = peak;
        let mut sum = (0., 0., 0.);
        for y in py.saturating_sub(r)..=py.saturating_add(r) {
            for x in px.saturating_sub(r)..=px.saturating_add(r) {
                let Some(value) = frame.get(x, y) else {
                    continue;
                };
                let weight = value as f64;
                if weight > cutoff {
                    sum.0 += weight * x as f64;
                    sum.1 += weight * y as f64;
                    sum.2 += weight;
                }
            }
        }

        // The peak itself always passes the cutoff, so the weight is positive.
        Pixel::new(sum.0 / sum.2, sum.1 / sum.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn blank(width: u32, height: u32, level: u8) -> Vec<u8> {
        vec![level; (width * height) as usize]
    }

    fn detector() -> Detector {
        Detector::new(DetectorParams::default())
    }

    #[test]
    fn dark_frame_is_occluded() {
        let frame = Frame::from_bytes(8, 8, &blank(8, 8, 30)).unwrap();
        assert_eq!(
            detector().detect(&frame, None).unwrap(),
            Observation::Occluded {
                reason: OcclusionReason::BelowThreshold,
                brightness: 30,
            }
        );
    }

    #[test]
    fn single_spot_is_found() {
        let mut bytes = blank(16, 12, 10);
        bytes[5 * 16 + 9] = 250;
        let frame = Frame::from_bytes(16, 12, &bytes).unwrap();

        let Observation::Lit {
            pixel,
            brightness,
            confidence,
        } = detector().detect(&frame, None).unwrap()
        else {
            panic!("expected a lit observation");
        };

        assert_eq!(brightness, 250);
        assert_eq!(pixel, Pixel::new(9., 5.));
        assert_relative_eq!(confidence, 0.99);
    }

    #[test]
    fn centroid_splits_twin_pixels() {
        let mut bytes = blank(16, 12, 10);
        bytes[5 * 16 + 9] = 240;
        bytes[5 * 16 + 10] = 240;
        let frame = Frame::from_bytes(16, 12, &bytes).unwrap();

        let Observation::Lit { pixel, .. } = detector().detect(&frame, None).unwrap() else {
            panic!("expected a lit observation");
        };
        assert_relative_eq!(pixel.x, 9.5);
        assert_relative_eq!(pixel.y, 5.0);
    }

    #[test]
    fn pixels_at_the_cutoff_are_not_bright() {
        let mut bytes = blank(16, 12, 10);
        bytes[5 * 16 + 9] = 200;
        bytes[5 * 16 + 10] = 190;
        bytes[6 * 16 + 9] = 191;
        let frame = Frame::from_bytes(16, 12, &bytes).unwrap();

        let Observation::Lit {
            pixel, confidence, ..
        } = detector().detect(&frame, None).unwrap()
        else {
            panic!("expected a lit observation");
        };

        // 190 is exactly 0.95 of the peak and stays out of the centroid.
        assert_relative_eq!(confidence, 0.98);
        assert_relative_eq!(pixel.x, 9.);
        assert_relative_eq!(pixel.y, (200. * 5. + 191. * 6.) / 391.);
    }

    #[rstest]
    #[case(100, false)]
    #[case(101, true)]
    fn ambiguity_threshold(#[case] lit: usize, #[case] ambiguous: bool) {
        let mut bytes = blank(32, 32, 0);
        bytes.iter_mut().take(lit).for_each(|px| *px = 255);
        let frame = Frame::from_bytes(32, 32, &bytes).unwrap();
        let observation = detector().detect(&frame, None).unwrap();

        match ambiguous {
            true => assert_eq!(
                observation,
                Observation::Occluded {
                    reason: OcclusionReason::Ambiguous { bright_pixels: lit },
                    brightness: 255,
                }
            ),
            false => assert!(!observation.is_occluded()),
        }
    }

    #[test]
    fn baseline_removes_static_glare() {
        let mut glare = blank(16, 16, 0);
        glare.iter_mut().take(120).for_each(|px| *px = 250);
        let baseline = Frame::from_bytes(16, 16, &glare).unwrap();

        let mut lit = glare.clone();
        lit[200] = 255;
        let frame = Frame::from_bytes(16, 16, &lit).unwrap();

        assert!(detector().detect(&frame, None).unwrap().is_occluded());

        // After subtraction only the LED itself is above the threshold.
        let params = DetectorParams {
            brightness_threshold: 20,
            ..Default::default()
        };
        let observation = Detector::new(params)
            .detect(&frame, Some(&baseline))
            .unwrap();
        let Observation::Lit { pixel, .. } = observation else {
            panic!("expected a lit observation");
        };
        assert_eq!(pixel, Pixel::new(8., 12.));
    }

    #[test]
    fn mismatched_baseline_is_an_error() {
        let frame = Frame::from_bytes(4, 4, &blank(4, 4, 0)).unwrap();
        let baseline = Frame::from_bytes(2, 2, &blank(2, 2, 0)).unwrap();
        assert!(detector().detect(&frame, Some(&baseline)).is_err());
    }
}
