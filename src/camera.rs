//! Camera geometry for an uncalibrated ring of cameras.
//!
//! Every camera is assumed to stand on a horizontal ring around the
//! installation at a common distance, level with the world origin and aimed
//! at the installation's vertical axis. Cameras differ only in their angular
//! placement on the ring. There is no lens distortion correction and no
//! measured extrinsic calibration.
//!
//! The [`CameraModel`] trait is the only thing triangulation depends on, so a
//! calibrated model can replace [`RingPinhole`] without touching it.

use crate::{
    error::{Error, Result},
    ray::{CameraFrame, CameraPose, Ray, WorldFrame},
    session::Detection,
};
use nalgebra::{Matrix3, Point3, Rotation3, Unit, Vector3};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uom::{
    ConstZero,
    si::{
        angle::{degree, radian},
        f64::{Angle, Length},
        length::meter,
    },
};

/// A sub-pixel image location. `x` grows to the right and `y` grows down.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Pixel {
    pub x: f64,
    pub y: f64,
}

impl Pixel {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// What is known about one camera placement.
///
/// Angles are stored in radians and lengths in metres when serialized.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CameraMetadata {
    /// Image width in pixels.
    pub width: u32,

    /// Image height in pixels.
    pub height: u32,

    /// Horizontal field of view.
    pub fov: Angle,

    /// Distance from the optical centre to the installation's vertical axis.
    pub distance: Length,

    /// Angular placement on the ring, counter-clockwise from +X.
    pub azimuth: Angle,
}

impl CameraMetadata {
    /// Creates metadata for a camera on the ring at `azimuth_deg` degrees.
    pub fn on_ring(
        width: u32,
        height: u32,
        fov_deg: f64,
        distance_m: f64,
        azimuth_deg: f64,
    ) -> Self {
        Self {
            width,
            height,
            fov: Angle::new::<degree>(fov_deg),
            distance: Length::new::<meter>(distance_m),
            azimuth: Angle::new::<degree>(azimuth_deg),
        }
    }

    /// Reports degenerate geometry as a configuration fault.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "camera resolution must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !(self.fov > Angle::ZERO && self.fov < Angle::HALF_TURN) {
            return Err(Error::Config(format!(
                "field of view must be between 0 and 180 degrees, got {}",
                self.fov.get::<degree>()
            )));
        }
        if !(self.distance > Length::ZERO && self.distance.get::<meter>().is_finite()) {
            return Err(Error::Config(format!(
                "camera distance must be positive, got {} m",
                self.distance.get::<meter>()
            )));
        }
        if !self.azimuth.get::<radian>().is_finite() {
            return Err(Error::Config("camera azimuth must be finite".into()));
        }
        Ok(())
    }

    /// Focal length in pixels, `(width / 2) / tan(fov / 2)`.
    pub fn focal_length_px(&self) -> f64 {
        (self.width as f64 / 2.) / (self.fov.get::<radian>() / 2.).tan()
    }

    /// The image centre in pixel coordinates.
    pub fn principal_point(&self) -> Pixel {
        Pixel::new(self.width as f64 / 2., self.height as f64 / 2.)
    }

    /// The camera's placement on the ring, aimed at the vertical axis.
    pub fn pose(&self) -> CameraPose {
        let a = self.azimuth.get::<radian>();
        let d = self.distance.get::<meter>();
        let (sin, cos) = a.sin_cos();

        let right = Vector3::new(-sin, cos, 0.);
        let up = Vector3::z();
        let forward = Vector3::new(-cos, -sin, 0.);

        // Camera +Z points away from the scene.
        let rotation = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[
            right, up, -forward,
        ]));

        CameraPose {
            position: Point3::new(d * cos, d * sin, 0.),
            rotation,
        }
    }
}

/// Converts between image pixels and world rays for one camera.
pub trait CameraModel {
    /// Returns the world ray implied by `detection`, or `None` when the
    /// detection is occluded.
    ///
    /// Degenerate `camera` metadata is an error, never a silent miss.
    fn ray_for(
        &self,
        detection: &Detection,
        camera: &CameraMetadata,
    ) -> Result<Option<Ray<WorldFrame>>>;

    /// Projects a world point into the image, or `None` if it is behind the
    /// camera or outside the frame.
    fn project(&self, point: &Point3<f64>, camera: &CameraMetadata) -> Option<Pixel>;
}

/// Pinhole cameras on an idealized ring.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RingPinhole;

impl RingPinhole {
    /// Trace `pixel` through the pinhole into a world ray.
    pub fn trace_from_pixel(
        &self,
        pixel: Pixel,
        camera: &CameraMetadata,
        angle_id: u32,
        confidence: f64,
    ) -> Result<Ray<WorldFrame>> {
        camera.validate()?;
        if !pixel.is_finite() {
            return Err(Error::InvalidInput(format!(
                "pixel must be finite, got ({}, {})",
                pixel.x, pixel.y
            )));
        }

        let f = camera.focal_length_px();
        let c = camera.principal_point();
        let direction = Vector3::new((pixel.x - c.x) / f, -(pixel.y - c.y) / f, -1.);

        Ok(Ray::<CameraFrame>::new(
            Point3::origin(),
            Unit::new_normalize(direction),
            angle_id,
            confidence,
        )
        .into_world_frame(&camera.pose()))
    }
}

impl CameraModel for RingPinhole {
    fn ray_for(
        &self,
        detection: &Detection,
        camera: &CameraMetadata,
    ) -> Result<Option<Ray<WorldFrame>>> {
        camera.validate()?;
        match detection.pixel() {
            Some(pixel) if !detection.is_occluded() => self
                .trace_from_pixel(pixel, camera, detection.angle_id(), detection.confidence())
                .map(Some),
            _ => Ok(None),
        }
    }

    fn project(&self, point: &Point3<f64>, camera: &CameraMetadata) -> Option<Pixel> {
        let pose = camera.pose();
        let local = pose.rotation.inverse() * (point - pose.position);

        // The camera looks down its -Z axis.
        let depth = -local.z;
        if depth <= 0. {
            return None;
        }

        let f = camera.focal_length_px();
        let c = camera.principal_point();
        let pixel = Pixel::new(c.x + f * local.x / depth, c.y - f * local.y / depth);

        let inside = (0.0..camera.width as f64).contains(&pixel.x)
            && (0.0..camera.height as f64).contains(&pixel.y);
        match inside {
            true => Some(pixel),
            false => None,
        }
    }
}
