//! A synthetic LED installation and camera ring.
//!
//! The rig renders what each ring camera would see with one LED lit: a
//! Gaussian blob at the LED's projected pixel over a noisy dark background.
//! LEDs can be hidden from individual cameras, mirrored into reflections, and
//! the actuator or camera can be made to fail a number of times, which makes
//! the rig usable both for tests and for generating sample datasets.

use crate::{
    actuator::{Actuator, ActuatorError, Rgb},
    camera::{CameraMetadata, CameraModel, Pixel, RingPinhole},
    capture::FrameSource,
    error::{Error, Result},
    frame::Frame,
};
use nalgebra::Point3;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    f64::consts::TAU,
    rc::Rc,
};

/// State shared between the actuator and every camera of a rig.
#[derive(Debug, Default)]
struct LitState {
    lit: Option<(usize, u8)>,
    actuator_failures: HashMap<usize, u32>,
    capture_failures: HashMap<usize, u32>,
    illuminate_calls: usize,
    all_off_calls: usize,
}

#[derive(Debug)]
pub struct SimulatedRig {
    points: Vec<Point3<f64>>,
    cameras: Vec<CameraMetadata>,
    sigma_px: f64,
    peak: u8,
    ambient: u8,
    noise: u8,
    hidden: HashSet<(usize, usize)>,
    reflections: HashMap<(usize, usize), Pixel>,
    seed: u64,
    state: Rc<RefCell<LitState>>,
}

impl SimulatedRig {
    /// A rig with LEDs at `points`, seen by `cameras`.
    pub fn new(points: Vec<Point3<f64>>, cameras: Vec<CameraMetadata>) -> Self {
        Self {
            points,
            cameras,
            sigma_px: 1.5,
            peak: 250,
            ambient: 10,
            noise: 3,
            hidden: HashSet::new(),
            reflections: HashMap::new(),
            seed: 0,
            state: Rc::default(),
        }
    }

    /// `count` cameras evenly spaced on a ring, starting at azimuth zero.
    pub fn ring_cameras(
        count: usize,
        width: u32,
        height: u32,
        fov_deg: f64,
        distance_m: f64,
    ) -> Vec<CameraMetadata> {
        (0..count)
            .map(|i| {
                let azimuth = i as f64 * 360. / count as f64;
                CameraMetadata::on_ring(width, height, fov_deg, distance_m, azimuth)
            })
            .collect()
    }

    /// `count` points on an upward helix, like a strip wound around a tree.
    pub fn helix(count: usize, radius: f64, height: f64, turns: f64) -> Vec<Point3<f64>> {
        (0..count)
            .map(|i| {
                let t = match count {
                    1 => 0.,
                    _ => i as f64 / (count - 1) as f64,
                };
                let angle = t * turns * TAU;
                let r = radius * (1. - 0.5 * t);
                Point3::new(r * angle.cos(), r * angle.sin(), height * (t - 0.5))
            })
            .collect()
    }

    /// Blob width in pixels and peak intensity at full brightness.
    pub fn with_blob(mut self, sigma_px: f64, peak: u8) -> Self {
        self.sigma_px = sigma_px;
        self.peak = peak;
        self
    }

    /// Background level and the maximum of the uniform noise added to it.
    pub fn with_background(mut self, ambient: u8, noise: u8) -> Self {
        self.ambient = ambient;
        self.noise = noise;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Hide LED `index` from camera `camera`.
    pub fn hide(mut self, camera: usize, index: usize) -> Self {
        self.hidden.insert((camera, index));
        self
    }

    /// Make LED `index` also appear at `pixel` in camera `camera`.
    pub fn reflect(mut self, camera: usize, index: usize, pixel: Pixel) -> Self {
        self.reflections.insert((camera, index), pixel);
        self
    }

    /// Fail the next `times` attempts to light LED `index`.
    pub fn fail_illuminate(self, index: usize, times: u32) -> Self {
        self.state
            .borrow_mut()
            .actuator_failures
            .insert(index, times);
        self
    }

    /// Fail the next `times` captures while LED `index` is lit.
    pub fn fail_capture(self, index: usize, times: u32) -> Self {
        self.state.borrow_mut().capture_failures.insert(index, times);
        self
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn cameras(&self) -> &[CameraMetadata] {
        &self.cameras
    }

    /// The LED currently lit, if any.
    pub fn lit(&self) -> Option<usize> {
        self.state.borrow().lit.map(|(index, _)| index)
    }

    pub fn illuminate_calls(&self) -> usize {
        self.state.borrow().illuminate_calls
    }

    pub fn all_off_calls(&self) -> usize {
        self.state.borrow().all_off_calls
    }

    /// Where LED `index` projects into camera `camera`, if it is visible.
    pub fn expected_pixel(&self, camera: usize, index: usize) -> Option<Pixel> {
        RingPinhole.project(self.points.get(index)?, self.cameras.get(camera)?)
    }

    /// The actuator that lights this rig's LEDs.
    pub fn actuator(&self) -> RigActuator {
        RigActuator {
            count: self.points.len(),
            state: Rc::clone(&self.state),
        }
    }

    /// A frame source for camera number `camera`.
    pub fn camera(&self, camera: usize) -> Result<RigCamera<'_>> {
        if camera >= self.cameras.len() {
            return Err(Error::InvalidInput(format!(
                "rig has {} cameras, no camera {camera}",
                self.cameras.len()
            )));
        }
        Ok(RigCamera {
            rig: self,
            camera,
            rng: StdRng::seed_from_u64(self.seed.wrapping_add(camera as u64)),
        })
    }

    /// Render the current lit state as seen from `camera`.
    fn render(&self, camera: usize, rng: &mut impl Rng) -> Result<Frame> {
        let metadata = &self.cameras[camera];
        let (width, height) = (metadata.width, metadata.height);

        let mut blobs = Vec::new();
        let lit = self.state.borrow().lit;
        if let Some((index, brightness)) = lit
            && !self.hidden.contains(&(camera, index))
        {
            let amplitude = self.peak as f64 * brightness as f64 / u8::MAX as f64;
            blobs.extend(
                self.expected_pixel(camera, index)
                    .into_iter()
                    .chain(self.reflections.get(&(camera, index)).copied())
                    .map(|pixel| (pixel, amplitude)),
            );
        }

        let two_sigma_sq = 2. * self.sigma_px * self.sigma_px;
        let ambient = self.ambient as f64;
        let mut intensity: Vec<f64> = (0..width as usize * height as usize)
            .into_par_iter()
            .map(|i| {
                let (x, y) = ((i % width as usize) as f64, (i / width as usize) as f64);
                blobs.iter().fold(ambient, |value, (pixel, amplitude)| {
                    let r_sq = (x - pixel.x).powi(2) + (y - pixel.y).powi(2);
                    value + amplitude * (-r_sq / two_sigma_sq).exp()
                })
            })
            .collect();

        if self.noise > 0 {
            intensity
                .iter_mut()
                .for_each(|value| *value += rng.random_range(0..=self.noise) as f64);
        }

        let bytes: Vec<u8> = intensity
            .into_iter()
            .map(|value| value.round().clamp(0., 255.) as u8)
            .collect();
        Frame::from_bytes(width, height, &bytes)
    }
}

/// The rig's LED controller.
#[derive(Debug)]
pub struct RigActuator {
    count: usize,
    state: Rc<RefCell<LitState>>,
}

impl Actuator for RigActuator {
    fn illuminate(
        &mut self,
        index: usize,
        _color: Rgb,
        brightness: u8,
    ) -> std::result::Result<(), ActuatorError> {
        let mut state = self.state.borrow_mut();
        state.illuminate_calls += 1;
        if index >= self.count {
            return Err(ActuatorError::Rejected(format!(
                "index {index} is outside 0..{}",
                self.count
            )));
        }
        if let Some(left) = state.actuator_failures.get_mut(&index)
            && *left > 0
        {
            *left -= 1;
            return Err(ActuatorError::Unreachable("simulated timeout".into()));
        }
        state.lit = Some((index, brightness));
        Ok(())
    }

    fn all_off(&mut self) -> std::result::Result<(), ActuatorError> {
        let mut state = self.state.borrow_mut();
        state.all_off_calls += 1;
        state.lit = None;
        Ok(())
    }
}

/// One of the rig's cameras.
#[derive(Debug)]
pub struct RigCamera<'a> {
    rig: &'a SimulatedRig,
    camera: usize,
    rng: StdRng,
}

impl FrameSource for RigCamera<'_> {
    fn capture(&mut self) -> Result<Frame> {
        {
            let mut state = self.rig.state.borrow_mut();
            if let Some((index, _)) = state.lit
                && let Some(left) = state.capture_failures.get_mut(&index)
                && *left > 0
            {
                *left -= 1;
                return Err(Error::Capture("simulated camera dropout".into()));
            }
        }
        self.rig.render(self.camera, &mut self.rng)
    }
}
