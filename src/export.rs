//! Normalized position maps.
//!
//! Triangulated positions are in world units with an arbitrary origin. The
//! exported map is scaled so the mapped LEDs span exactly one unit vertically
//! and recentred on the median X, the median Y and the vertical midpoint.
//! Unmapped indices stay at the origin and never contribute to the
//! normalization statistics.

use crate::{
    config::ExportParams,
    error::{Error, Result},
    triangulate::{PositionEstimate, median},
};
use chrono::{DateTime, Utc};
use nalgebra::{Point3, Vector3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize, de::DeserializeOwned};
#[cfg(feature = "serde")]
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Format version written into every position map.
pub const MAP_VERSION: &str = "1.0";

/// Dense map entry for one index.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MappedPoint {
    pub index: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Map entry with the quality of the estimate it came from.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DetailedPoint {
    pub index: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub confidence: f64,
    pub view_count: usize,
}

/// A point type stored in a [`PositionMap`].
pub trait MapPoint {
    fn index(&self) -> usize;
    fn position(&self) -> Point3<f64>;
}

impl MapPoint for MappedPoint {
    fn index(&self) -> usize {
        self.index
    }

    fn position(&self) -> Point3<f64> {
        Point3::new(self.x, self.y, self.z)
    }
}

impl MapPoint for DetailedPoint {
    fn index(&self) -> usize {
        self.index
    }

    fn position(&self) -> Point3<f64> {
        Point3::new(self.x, self.y, self.z)
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MapMetadata {
    pub name: String,

    /// Number of indices in the installation, mapped or not.
    pub count: usize,
    pub units: String,
    pub coordinate_system: String,

    /// Multiply world lengths by this to get map lengths.
    pub scale_factor: f64,

    /// Vertical extent of the mapped points in world units.
    pub original_height: f64,

    /// World point that maps to the origin.
    pub offset: Vector3<f64>,
    pub created: DateTime<Utc>,
    pub method: String,
    pub angles: Vec<u32>,

    /// Number of indices with a real position.
    pub mapped: usize,
    pub unmapped_indices: Vec<usize>,

    /// Mapped indices that normalized onto the unmapped sentinel.
    pub ambiguous_indices: Vec<usize>,
}

/// The exported, versioned position map.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PositionMap<P = MappedPoint> {
    pub version: String,
    pub metadata: MapMetadata,
    pub positions: Vec<P>,
}

impl<P: MapPoint> PositionMap<P> {
    pub fn get(&self, index: usize) -> Option<&P> {
        self.positions.get(index).filter(|point| point.index() == index)
    }

    /// Converts a point from map coordinates back to world coordinates.
    pub fn to_world(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(point.coords / self.metadata.scale_factor + self.metadata.offset)
    }

    /// Converts a point from world coordinates to map coordinates.
    pub fn from_world(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from((point.coords - self.metadata.offset) * self.metadata.scale_factor)
    }

    /// True when `index` carries the unmapped sentinel.
    pub fn is_unmapped(&self, index: usize) -> bool {
        self.get(index)
            .is_none_or(|point| point.position() == Point3::origin())
    }
}

impl PositionMap<DetailedPoint> {
    /// The dense `{index, x, y, z}` map with the same metadata.
    pub fn plain(&self) -> PositionMap {
        PositionMap {
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            positions: self
                .positions
                .iter()
                .map(|point| MappedPoint {
                    index: point.index,
                    x: point.x,
                    y: point.y,
                    z: point.z,
                })
                .collect(),
        }
    }
}

#[cfg(feature = "serde")]
impl<P: Serialize + DeserializeOwned> PositionMap<P> {
    /// Writes the map as JSON. An existing file is never replaced.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create_new(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::AlreadyExists => Error::MapExists(path.to_path_buf()),
            _ => Error::Io(err),
        })?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        info!(path = %path.display(), "saved position map");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let serialized = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&serialized)?)
    }
}

/// The conventional path of the detailed map saved next to `path`.
#[cfg(feature = "serde")]
pub fn detailed_path(path: impl AsRef<Path>) -> PathBuf {
    path.as_ref().with_extension("detailed.json")
}

fn detailed(estimate: &PositionEstimate, position: Point3<f64>) -> DetailedPoint {
    DetailedPoint {
        index: estimate.index,
        x: position.x,
        y: position.y,
        z: position.z,
        confidence: estimate.confidence,
        view_count: estimate.view_count,
    }
}

/// Normalization transform derived from the mapped estimates.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Normalization {
    scale_factor: f64,
    original_height: f64,
    offset: Vector3<f64>,
}

impl Normalization {
    fn apply(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from((point.coords - self.offset) * self.scale_factor)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exporter {
    params: ExportParams,
    angles: Vec<u32>,
}

impl Exporter {
    pub fn new(params: ExportParams) -> Self {
        Self {
            params,
            angles: Vec::new(),
        }
    }

    /// Angles recorded in the map metadata.
    pub fn with_angles(mut self, angles: impl IntoIterator<Item = u32>) -> Self {
        self.angles = angles.into_iter().collect();
        self.angles.sort_unstable();
        self
    }

    /// Normalize `estimates` into a dense map of `{index, x, y, z}`.
    ///
    /// `estimates` must hold one estimate per index, in index order.
    pub fn export(&self, estimates: &[PositionEstimate]) -> Result<PositionMap> {
        self.export_detailed(estimates).map(|map| map.plain())
    }

    /// Like [`Exporter::export`], but every point also carries its confidence
    /// and view count. [`PositionMap::plain`] derives the dense map from the
    /// result without normalizing again.
    pub fn export_detailed(
        &self,
        estimates: &[PositionEstimate],
    ) -> Result<PositionMap<DetailedPoint>> {
        if let Some((i, estimate)) = estimates
            .iter()
            .enumerate()
            .find(|(i, estimate)| estimate.index != *i)
        {
            return Err(Error::InvalidInput(format!(
                "estimate at position {i} is for index {}, estimates must be dense and ordered",
                estimate.index
            )));
        }

        let normalization = self.normalization(estimates);
        let mut unmapped_indices = Vec::new();
        let mut ambiguous_indices = Vec::new();

        let positions = estimates
            .iter()
            .map(|estimate| {
                if !estimate.is_mapped() {
                    unmapped_indices.push(estimate.index);
                    return detailed(estimate, Point3::origin());
                }

                let normalized = normalization.apply(&estimate.position);
                if normalized.coords.norm() < self.params.origin_epsilon {
                    warn!(
                        index = estimate.index,
                        "normalized position collides with the sentinel"
                    );
                    ambiguous_indices.push(estimate.index);
                }
                detailed(estimate, normalized)
            })
            .collect();

        if !unmapped_indices.is_empty() {
            warn!(
                unmapped = unmapped_indices.len(),
                "some indices keep the origin placeholder"
            );
        }

        Ok(PositionMap {
            version: MAP_VERSION.into(),
            metadata: MapMetadata {
                name: self.params.name.clone(),
                count: estimates.len(),
                units: "normalized".into(),
                coordinate_system: "X-Y horizontal, Z vertical (up)".into(),
                scale_factor: normalization.scale_factor,
                original_height: normalization.original_height,
                offset: normalization.offset,
                created: Utc::now(),
                method: "ring_pinhole_least_squares".into(),
                angles: self.angles.clone(),
                mapped: estimates.len() - unmapped_indices.len(),
                unmapped_indices,
                ambiguous_indices,
            },
            positions,
        })
    }

    fn normalization(&self, estimates: &[PositionEstimate]) -> Normalization {
        let mapped: Vec<_> = estimates
            .iter()
            .filter(|estimate| estimate.is_mapped())
            .map(|estimate| estimate.position)
            .collect();
        if mapped.is_empty() {
            return Normalization {
                scale_factor: 1.,
                original_height: 0.,
                offset: Vector3::zeros(),
            };
        }

        let (z_min, z_max) = mapped
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.z), hi.max(p.z))
            });
        let height = z_max - z_min;
        let scale_factor = match height < self.params.min_height {
            true => 1.,
            false => 1. / height,
        };

        let xs: Vec<_> = mapped.iter().map(|p| p.x).collect();
        let ys: Vec<_> = mapped.iter().map(|p| p.y).collect();
        let offset = Vector3::new(
            median(&xs),
            median(&ys),
            (z_min + z_max) / 2.,
        );

        info!(
            scale_factor,
            original_height = height,
            x = offset.x,
            y = offset.y,
            z = offset.z,
            "normalizing position map"
        );
        Normalization {
            scale_factor,
            original_height: height,
            offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use quickcheck::quickcheck;

    fn mapped(index: usize, x: f64, y: f64, z: f64) -> PositionEstimate {
        PositionEstimate {
            index,
            position: Point3::new(x, y, z),
            confidence: 0.9,
            view_count: 3,
            residuals: vec![0.; 3],
            rejected: Vec::new(),
            diagnostics: Default::default(),
        }
    }

    fn sample() -> Vec<PositionEstimate> {
        vec![
            mapped(0, 1.0, 2.0, 0.5),
            PositionEstimate::unmapped(1, 1),
            mapped(2, 1.4, 2.2, 2.5),
            mapped(3, 0.8, 1.6, 1.0),
            PositionEstimate::unmapped(4, 0),
        ]
    }

    #[test]
    fn mapped_points_span_unit_height() {
        let map = Exporter::default().export(&sample()).unwrap();
        let points: Vec<_> = map
            .positions
            .iter()
            .filter(|p| !map.metadata.unmapped_indices.contains(&p.index))
            .collect();

        let zs: Vec<_> = points.iter().map(|p| p.z).collect();
        let z_min = zs.iter().copied().fold(f64::INFINITY, f64::min);
        let z_max = zs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_relative_eq!(z_max - z_min, 1.0, epsilon = 1e-12);
        assert_relative_eq!(z_max + z_min, 0.0, epsilon = 1e-12);

        let xs: Vec<_> = points.iter().map(|p| p.x).collect();
        let ys: Vec<_> = points.iter().map(|p| p.y).collect();
        assert_relative_eq!(median(&xs), 0.0, epsilon = 1e-12);
        assert_relative_eq!(median(&ys), 0.0, epsilon = 1e-12);

        assert_relative_eq!(map.metadata.scale_factor, 0.5);
        assert_relative_eq!(map.metadata.original_height, 2.0);
    }

    #[test]
    fn unmapped_indices_stay_at_origin() {
        let map = Exporter::default().export(&sample()).unwrap();
        assert_eq!(map.metadata.count, 5);
        assert_eq!(map.metadata.mapped, 3);
        assert_eq!(map.metadata.unmapped_indices, vec![1, 4]);
        assert_eq!(
            map.positions[4],
            MappedPoint {
                index: 4,
                x: 0.,
                y: 0.,
                z: 0.
            }
        );
        assert!(map.is_unmapped(1));
        assert!(!map.is_unmapped(0));
    }

    #[test]
    fn unmapped_do_not_shift_statistics() {
        let with = Exporter::default().export(&sample()).unwrap();
        let without: Vec<_> = sample()
            .into_iter()
            .filter(|estimate| estimate.is_mapped())
            .enumerate()
            .map(|(i, estimate)| PositionEstimate { index: i, ..estimate })
            .collect();
        let without = Exporter::default().export(&without).unwrap();

        assert_eq!(with.metadata.offset, without.metadata.offset);
        assert_eq!(with.metadata.scale_factor, without.metadata.scale_factor);
    }

    #[test]
    fn back_conversion_recovers_world_points() {
        let estimates = sample();
        let map = Exporter::default().export(&estimates).unwrap();
        for estimate in estimates.iter().filter(|e| e.is_mapped()) {
            let point = map.get(estimate.index).unwrap().position();
            assert_relative_eq!(map.to_world(&point), estimate.position, epsilon = 1e-12);
            assert_relative_eq!(map.from_world(&estimate.position), point, epsilon = 1e-12);
        }
    }

    #[test]
    fn flat_installation_is_not_scaled() {
        let estimates = vec![mapped(0, 0.0, 0.0, 1.0), mapped(1, 2.0, 0.0, 1.0)];
        let map = Exporter::default().export(&estimates).unwrap();
        assert_eq!(map.metadata.scale_factor, 1.0);
        assert_relative_eq!(map.positions[0].x, -1.0);
        assert_relative_eq!(map.positions[1].x, 1.0);
    }

    #[test]
    fn point_normalized_onto_origin_is_ambiguous() {
        let estimates = vec![
            mapped(0, 0.0, 0.0, 0.0),
            mapped(1, 0.5, 0.5, 0.5),
            mapped(2, 1.0, 1.0, 1.0),
        ];
        let map = Exporter::default().export(&estimates).unwrap();
        assert_eq!(map.metadata.ambiguous_indices, vec![1]);
    }

    #[test]
    fn detailed_map_keeps_quality() {
        let map = Exporter::default()
            .with_angles([2, 0, 1])
            .export_detailed(&sample())
            .unwrap();
        assert_eq!(map.metadata.angles, vec![0, 1, 2]);
        assert_eq!(map.positions[0].view_count, 3);
        assert_eq!(map.positions[1].confidence, 0.);
    }

    #[test]
    fn plain_map_shares_detailed_metadata() {
        let detailed = Exporter::default().export_detailed(&sample()).unwrap();
        let plain = detailed.plain();

        assert_eq!(plain.version, detailed.version);
        assert_eq!(plain.metadata, detailed.metadata);
        assert_eq!(plain.metadata.created, detailed.metadata.created);
        assert_eq!(plain.positions.len(), detailed.positions.len());
        for (point, full) in plain.positions.iter().zip(&detailed.positions) {
            assert_eq!(point.index, full.index);
            assert_eq!(point.position(), full.position());
        }
    }

    #[test]
    fn sparse_estimates_are_rejected() {
        let estimates = vec![mapped(0, 0., 0., 0.), mapped(2, 1., 1., 1.)];
        assert!(matches!(
            Exporter::default().export(&estimates),
            Err(Error::InvalidInput(_))
        ));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn saved_map_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let map = Exporter::default().export(&sample()).unwrap();

        map.save(&path).unwrap();
        assert!(matches!(map.save(&path), Err(Error::MapExists(_))));
        assert_eq!(PositionMap::<MappedPoint>::load(&path).unwrap(), map);
        assert_eq!(
            detailed_path(&path),
            dir.path().join("positions.detailed.json")
        );
    }

    quickcheck! {
        fn normalized_height_is_one(zs: Vec<i16>) -> bool {
            let estimates: Vec<_> = zs
                .iter()
                .enumerate()
                .map(|(i, z)| mapped(i, i as f64, -(i as f64), *z as f64 / 100.))
                .collect();
            let map = Exporter::default().export(&estimates).unwrap();

            let z_min = map.positions.iter().map(|p| p.z).fold(f64::INFINITY, f64::min);
            let z_max = map.positions.iter().map(|p| p.z).fold(f64::NEG_INFINITY, f64::max);
            let height = z_max - z_min;
            zs.is_empty()
                || height.abs() < 1e-9 && map.metadata.scale_factor == 1.
                || (height - 1.).abs() < 1e-9
        }
    }
}
