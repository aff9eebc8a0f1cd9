//! Aggregated calibration quality.
//!
//! Every non-fatal condition met during capture and triangulation ends up
//! here as a count and an index list, so an operator can decide which angles
//! to re-capture without reading logs.

use crate::{
    config::TriangulationParams,
    detector::OcclusionReason,
    export::{MapPoint, PositionMap},
    session::CaptureSession,
    triangulate::PositionEstimate,
};
use std::fmt;

/// Index lists longer than this are truncated when displayed.
const MAX_LISTED: usize = 20;

/// Detection counts for one angle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AngleQuality {
    pub angle_id: u32,
    pub lit: usize,
    pub below_threshold: usize,
    pub ambiguous: usize,
    pub faulted: usize,

    /// Indices with no detection at all.
    pub missing: usize,
}

impl AngleQuality {
    fn from_session(session: &CaptureSession) -> Self {
        let mut quality = Self {
            angle_id: session.angle_id(),
            missing: session.count() - session.detections().len(),
            ..Default::default()
        };
        for detection in session.detections() {
            match detection.reason() {
                None => quality.lit += 1,
                Some(OcclusionReason::BelowThreshold) => quality.below_threshold += 1,
                Some(OcclusionReason::Ambiguous { .. }) => quality.ambiguous += 1,
                Some(OcclusionReason::ActuatorFault | OcclusionReason::CaptureFault) => {
                    quality.faulted += 1
                }
            }
        }
        quality
    }

    pub fn occluded(&self) -> usize {
        self.below_threshold + self.ambiguous + self.faulted
    }
}

/// A ray dropped as an outlier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub index: usize,
    pub angle_id: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QualityReport {
    pub count: usize,
    pub angles: Vec<AngleQuality>,
    pub mapped: usize,
    pub unmapped: Vec<usize>,
    pub low_confidence: Vec<usize>,
    pub ill_conditioned: Vec<usize>,
    pub near_origin: Vec<usize>,

    /// Mapped indices that the exported map placed on the unmapped sentinel.
    pub on_sentinel: Vec<usize>,
    pub rejections: Vec<Rejection>,

    /// Mean, minimum and maximum confidence of the mapped indices.
    pub confidence: Option<(f64, f64, f64)>,
}

impl QualityReport {
    pub fn new(
        sessions: &[CaptureSession],
        estimates: &[PositionEstimate],
        params: &TriangulationParams,
    ) -> Self {
        let mapped: Vec<_> = estimates.iter().filter(|e| e.is_mapped()).collect();
        let confidence = match mapped.len() {
            0 => None,
            n => Some(mapped.iter().fold(
                (0., f64::INFINITY, f64::NEG_INFINITY),
                |(mean, min, max), e| {
                    (
                        mean + e.confidence / n as f64,
                        min.min(e.confidence),
                        max.max(e.confidence),
                    )
                },
            )),
        };

        Self {
            count: estimates.len(),
            angles: sessions.iter().map(AngleQuality::from_session).collect(),
            mapped: mapped.len(),
            unmapped: estimates
                .iter()
                .filter(|e| !e.is_mapped())
                .map(|e| e.index)
                .collect(),
            low_confidence: indices(&mapped, |e| e.confidence < params.low_confidence),
            ill_conditioned: indices(&mapped, |e| e.diagnostics.ill_conditioned),
            near_origin: indices(&mapped, |e| e.diagnostics.near_origin),
            on_sentinel: Vec::new(),
            rejections: estimates
                .iter()
                .flat_map(|e| {
                    e.rejected.iter().map(|angle_id| Rejection {
                        index: e.index,
                        angle_id: *angle_id,
                    })
                })
                .collect(),
            confidence,
        }
    }

    /// Adds the conditions only found while exporting `map`.
    pub fn with_map<P: MapPoint>(mut self, map: &PositionMap<P>) -> Self {
        self.on_sentinel = map.metadata.ambiguous_indices.clone();
        self
    }

    /// True when every index was mapped with acceptable confidence.
    pub fn is_clean(&self) -> bool {
        self.unmapped.is_empty()
            && self.low_confidence.is_empty()
            && self.ill_conditioned.is_empty()
            && self.near_origin.is_empty()
            && self.on_sentinel.is_empty()
    }
}

fn indices(
    estimates: &[&PositionEstimate],
    keep: impl Fn(&PositionEstimate) -> bool,
) -> Vec<usize> {
    estimates
        .iter()
        .filter(|e| keep(**e))
        .map(|e| e.index)
        .collect()
}

struct Indices<'a>(&'a [usize]);

impl fmt::Display for Indices<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => write!(f, "none"),
            n if n <= MAX_LISTED => write!(f, "{n} {:?}", self.0),
            n => write!(f, "{n} {:?} and {} more", &self.0[..MAX_LISTED], n - MAX_LISTED),
        }
    }
}

impl fmt::Display for QualityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Calibration quality report")?;
        writeln!(f, "  LEDs:            {}", self.count)?;
        writeln!(f, "  angles:          {}", self.angles.len())?;
        for angle in &self.angles {
            writeln!(
                f,
                "    angle {}: {} lit, {} occluded ({} dark, {} ambiguous, {} faulted), {} missing",
                angle.angle_id,
                angle.lit,
                angle.occluded(),
                angle.below_threshold,
                angle.ambiguous,
                angle.faulted,
                angle.missing
            )?;
        }
        writeln!(f, "  mapped:          {} / {}", self.mapped, self.count)?;
        writeln!(f, "  unmapped:        {}", Indices(&self.unmapped))?;
        writeln!(f, "  low confidence:  {}", Indices(&self.low_confidence))?;
        writeln!(f, "  ill-conditioned: {}", Indices(&self.ill_conditioned))?;
        writeln!(f, "  near origin:     {}", Indices(&self.near_origin))?;
        writeln!(f, "  on sentinel:     {}", Indices(&self.on_sentinel))?;

        write!(f, "  outliers:        ")?;
        match self.rejections.len() {
            0 => writeln!(f, "none")?,
            n => {
                let listed: Vec<_> = self
                    .rejections
                    .iter()
                    .take(MAX_LISTED)
                    .map(|r| format!("{} (angle {})", r.index, r.angle_id))
                    .collect();
                write!(f, "{n} [{}]", listed.join(", "))?;
                if n > MAX_LISTED {
                    write!(f, " and {} more", n - MAX_LISTED)?;
                }
                writeln!(f)?;
            }
        }

        match self.confidence {
            Some((mean, min, max)) => write!(
                f,
                "  confidence:      mean {mean:.3}, min {min:.3}, max {max:.3}"
            ),
            None => write!(f, "  confidence:      n/a"),
        }
    }
}

/// How many angles saw each index, before any triangulation is attempted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coverage {
    pub min_views: usize,

    /// Number of angles with a lit detection, per index.
    pub views: Vec<usize>,
}

impl Coverage {
    pub fn from_sessions(sessions: &[CaptureSession], min_views: usize) -> Self {
        let count = sessions.iter().map(|s| s.count()).max().unwrap_or(0);
        let mut views = vec![0; count];
        for detection in sessions.iter().flat_map(|s| s.detections()) {
            if !detection.is_occluded() {
                views[detection.index()] += 1;
            }
        }
        Self { min_views, views }
    }

    /// Indices seen by fewer than `min_views` angles.
    pub fn under_covered(&self) -> Vec<usize> {
        self.views
            .iter()
            .enumerate()
            .filter(|(_, views)| **views < self.min_views)
            .map(|(index, _)| index)
            .collect()
    }
}

impl fmt::Display for Coverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seen by fewer than {} angles: {}",
            self.min_views,
            Indices(&self.under_covered())
        )
    }
}
