//! Multi-view triangulation of LED positions.
//!
//! Each index is solved on its own as the point closest, in the least
//! squares sense, to every ray that saw it:
//!
//! ```text
//!   minimize  Σ |(I - d dᵀ)(p - o)|²   ⇔   [Σ (I - d dᵀ)] p = Σ (I - d dᵀ) o
//! ```
//!
//! where `o` and `d` are a ray's origin and unit direction. Rays that
//! disagree with the rest are rejected one at a time until the fit is
//! consistent, and fits whose normal equations are close to singular are
//! reported with low confidence instead of as a confident far-away point.

use crate::{
    camera::CameraModel,
    config::TriangulationParams,
    error::Result,
    ray::{Ray, WorldFrame},
    session::{self, CaptureSession},
};
use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Flags raised while fitting a single index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Diagnostics {
    /// The rays were too close to parallel for a well-determined fit.
    pub ill_conditioned: bool,

    /// The fit landed on the origin, which is reserved for unmapped indices.
    pub near_origin: bool,
}

/// The triangulated position of one LED index.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PositionEstimate {
    pub index: usize,

    /// Position in world units, or the origin when unmapped.
    pub position: Point3<f64>,

    /// Normalized quality score in [0, 1].
    pub confidence: f64,

    /// Number of rays that contributed to the final fit.
    pub view_count: usize,

    /// Perpendicular distance from the fit to each contributing ray.
    pub residuals: Vec<f64>,

    /// Angles whose rays were rejected as outliers, in rejection order.
    pub rejected: Vec<u32>,
    pub diagnostics: Diagnostics,
}

impl PositionEstimate {
    /// The sentinel for an index that could not be placed.
    pub fn unmapped(index: usize, view_count: usize) -> Self {
        Self {
            index,
            position: Point3::origin(),
            confidence: 0.,
            view_count,
            residuals: Vec::new(),
            rejected: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.view_count >= 2
    }

    /// Root mean square of the residuals, zero when unmapped.
    pub fn rms_residual(&self) -> f64 {
        match self.residuals.len() {
            0 => 0.,
            n => (self.residuals.iter().map(|r| r * r).sum::<f64>() / n as f64).sqrt(),
        }
    }
}

/// A least squares fit over a fixed set of rays.
#[derive(Clone, Debug)]
struct Fit {
    position: Point3<f64>,
    residuals: Vec<f64>,
    smallest_singular_value: f64,
}

/// One attempt of the outlier rejection loop.
#[derive(Debug)]
enum Step {
    Fitting(Vec<Ray<WorldFrame>>),
    Evaluating {
        rays: Vec<Ray<WorldFrame>>,
        fit: Fit,
    },
    Converged {
        rays: Vec<Ray<WorldFrame>>,
        fit: Fit,
    },

    /// `dropped` was removed and the remaining rays are refitted.
    Degraded {
        rays: Vec<Ray<WorldFrame>>,
        dropped: Ray<WorldFrame>,
    },
    Unresolved {
        view_count: usize,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Triangulator {
    params: TriangulationParams,
}

impl Triangulator {
    pub fn new(params: TriangulationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TriangulationParams {
        &self.params
    }

    /// Estimate the position of `index` from every ray that saw it.
    ///
    /// At most one ray per angle is used; when an angle contributes several,
    /// the most confident one is kept. Fewer than two angles yield the
    /// unmapped sentinel.
    pub fn triangulate(&self, index: usize, rays: &[Ray<WorldFrame>]) -> PositionEstimate {
        let mut rays: Vec<_> = rays
            .iter()
            .filter(|ray| ray.origin().coords.iter().all(|c| c.is_finite()))
            .copied()
            .collect();
        rays.sort_by(|a, b| {
            a.angle_id()
                .cmp(&b.angle_id())
                .then(b.confidence().total_cmp(&a.confidence()))
        });
        rays.dedup_by_key(|ray| ray.angle_id());

        let mut rejected = Vec::new();
        let mut step = Step::Fitting(rays);
        let (rays, fit) = loop {
            step = match step {
                Step::Fitting(rays) if rays.len() < 2 => Step::Unresolved {
                    view_count: rays.len(),
                },
                Step::Fitting(rays) => {
                    let fit = self.fit(&rays);
                    Step::Evaluating { rays, fit }
                }
                Step::Evaluating { mut rays, fit } => match self.worst_outlier(&rays) {
                    Some(worst) => {
                        let dropped = rays.remove(worst);
                        Step::Degraded { rays, dropped }
                    }
                    None => Step::Converged { rays, fit },
                },
                Step::Degraded { rays, dropped } => {
                    debug!(index, angle_id = dropped.angle_id(), "rejected outlier ray");
                    rejected.push(dropped.angle_id());
                    Step::Fitting(rays)
                }
                Step::Converged { rays, fit } => break (rays, fit),
                Step::Unresolved { view_count } => {
                    return PositionEstimate {
                        rejected,
                        ..PositionEstimate::unmapped(index, view_count)
                    };
                }
            }
        };

        let n = rays.len() as f64;
        let minimum = n * self.params.min_conditioning;
        let diagnostics = Diagnostics {
            ill_conditioned: fit.smallest_singular_value < minimum,
            near_origin: fit.position.coords.norm() < self.params.origin_epsilon,
        };
        if diagnostics.ill_conditioned {
            warn!(
                index,
                smallest_singular_value = fit.smallest_singular_value,
                "rays are nearly parallel"
            );
        }
        if diagnostics.near_origin {
            warn!(index, "fit coincides with the unmapped sentinel");
        }

        let rms = (fit.residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
        let views = 1. - 0.5f64.powi(rays.len() as i32 - 1);
        let agreement = (-rms / self.params.residual_scale).exp();
        let conditioning = (fit.smallest_singular_value / minimum).min(1.);

        PositionEstimate {
            index,
            position: fit.position,
            confidence: (views * agreement * conditioning).clamp(0., 1.),
            view_count: rays.len(),
            residuals: fit.residuals,
            rejected,
            diagnostics,
        }
    }

    /// Triangulate every index of `sessions` in parallel.
    ///
    /// The sessions must share a LED count and have distinct angles, and
    /// every camera must be valid. The result holds one estimate per index,
    /// in index order.
    pub fn triangulate_sessions<M>(
        &self,
        sessions: &[CaptureSession],
        model: &M,
    ) -> Result<Vec<PositionEstimate>>
    where
        M: CameraModel + Sync,
    {
        let Some(first) = sessions.first() else {
            return Ok(Vec::new());
        };
        session::check_compatible(sessions)?;
        for session in sessions {
            session.camera().validate()?;
            let missing = session.missing_indices();
            if !missing.is_empty() {
                warn!(
                    angle_id = session.angle_id(),
                    missing = missing.len(),
                    "session is incomplete, missing indices count as unseen"
                );
            }
        }

        info!(
            count = first.count(),
            angles = sessions.len(),
            "triangulating"
        );

        let mut estimates = vec![PositionEstimate::unmapped(0, 0); first.count()];
        estimates
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(index, estimate)| -> Result<()> {
                let rays = sessions
                    .iter()
                    .filter_map(|session| {
                        session
                            .get(index)
                            .map(|detection| model.ray_for(detection, session.camera()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let rays: Vec<_> = rays.into_iter().flatten().collect();
                *estimate = self.triangulate(index, &rays);
                Ok(())
            })?;

        Ok(estimates)
    }

    /// Solve the normal equations for `rays`.
    ///
    /// Singular values below `min_conditioning * n` are truncated, which
    /// places unconstrained directions at the minimum norm solution.
    fn fit(&self, rays: &[Ray<WorldFrame>]) -> Fit {
        let (a, b) = rays.iter().fold(
            (Matrix3::zeros(), Vector3::zeros()),
            |(a, b): (Matrix3<f64>, Vector3<f64>), ray| {
                let d = ray.direction().into_inner();
                let projector = Matrix3::identity() - d * d.transpose();
                (a + projector, b + projector * ray.origin().coords)
            },
        );

        // The normal matrix is symmetric positive semi-definite, so its
        // eigenvalues are its singular values.
        let eigen = a.symmetric_eigen();
        let cutoff = self.params.min_conditioning * rays.len() as f64;
        let solution = eigen
            .eigenvalues
            .iter()
            .zip(eigen.eigenvectors.column_iter())
            .filter(|(value, _)| **value >= cutoff)
            .fold(Vector3::zeros(), |x, (value, v)| {
                x + v * (v.dot(&b) / value)
            });
        let smallest_singular_value = eigen.eigenvalues.min().max(0.);

        let position = Point3::from(solution);
        Fit {
            residuals: rays.iter().map(|ray| ray.distance_to(&position)).collect(),
            position,
            smallest_singular_value,
        }
    }

    /// Position of the ray that disagrees most with a fit of the others,
    /// if that disagreement exceeds the outlier threshold.
    ///
    /// Each ray is measured against the fit it took no part in, and the
    /// threshold comes from the residuals of that fit. Two rays never
    /// reject each other.
    fn worst_outlier(&self, rays: &[Ray<WorldFrame>]) -> Option<usize> {
        if rays.len() < 3 {
            return None;
        }
        let minimum = (rays.len() - 1) as f64 * self.params.min_conditioning;
        (0..rays.len())
            .filter_map(|i| {
                let mut others = rays.to_vec();
                let candidate = others.remove(i);
                let fit = self.fit(&others);
                if fit.smallest_singular_value < minimum {
                    return None;
                }
                let threshold = (self.params.outlier_multiple * median(&fit.residuals))
                    .max(self.params.residual_floor);
                let residual = candidate.distance_to(&fit.position);
                (residual > threshold).then_some((i, residual))
            })
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
    }
}

/// Median of `values`, averaging the middle pair for even lengths.
pub(crate) fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    match sorted.len() {
        0 => 0.,
        n if n % 2 == 0 => (sorted[mid - 1] + sorted[mid]) / 2.,
        _ => sorted[mid],
    }
}
