use nalgebra::{Point3, Rotation3, Unit, Vector3};

pub trait RayFrame: Copy + Clone {}

/// Coordinates local to one camera: +X right, +Y up, looking down -Z.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraFrame;
impl RayFrame for CameraFrame {}

/// Installation coordinates: X-Y horizontal, Z up, origin on the vertical axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorldFrame;
impl RayFrame for WorldFrame {}

/// A half-line implied by one detection, seen from one camera angle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray<Frame: RayFrame> {
    origin: Point3<f64>,
    direction: Unit<Vector3<f64>>,

    /// Angle the detection was captured from.
    angle_id: u32,

    /// Confidence of the detection the ray was derived from.
    confidence: f64,
    _phan: std::marker::PhantomData<Frame>,
}

impl<Frame: RayFrame> Ray<Frame> {
    pub fn new(
        origin: Point3<f64>,
        direction: Unit<Vector3<f64>>,
        angle_id: u32,
        confidence: f64,
    ) -> Self {
        Self {
            origin,
            direction,
            angle_id,
            confidence,
            _phan: std::marker::PhantomData,
        }
    }

    pub fn origin(&self) -> &Point3<f64> {
        &self.origin
    }

    pub fn direction(&self) -> &Unit<Vector3<f64>> {
        &self.direction
    }

    pub fn angle_id(&self) -> u32 {
        self.angle_id
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Returns the point `t` units along the ray.
    pub fn point_at(&self, t: f64) -> Point3<f64> {
        self.origin + self.direction.into_inner() * t
    }

    /// Perpendicular distance from `point` to the infinite line through the ray.
    pub fn distance_to(&self, point: &Point3<f64>) -> f64 {
        let offset = point - self.origin;
        let along = offset.dot(self.direction.as_ref());
        (offset - self.direction.into_inner() * along).norm()
    }
}

/// Placement of a camera in the world.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraPose {
    /// Optical centre in world coordinates.
    pub position: Point3<f64>,

    /// Rotation taking camera-frame vectors into the world frame.
    pub rotation: Rotation3<f64>,
}

impl Ray<CameraFrame> {
    /// Transforms the ray from the camera frame into the world frame.
    pub fn into_world_frame(self, pose: &CameraPose) -> Ray<WorldFrame> {
        Ray::new(
            pose.position + pose.rotation * self.origin.coords,
            pose.rotation * self.direction,
            self.angle_id,
            self.confidence,
        )
    }
}
