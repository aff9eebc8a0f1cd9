//! The per-angle capture sweep.
//!
//! One sweep holds the actuator exclusively and walks LED indices in
//! ascending order: illuminate, wait for the light to settle, capture, detect,
//! record. The loop is synchronous on purpose since every step depends on the
//! physical state left by the previous one.
//!
//! ```text
//!   all_off ─► warm-up ─► [baseline] ─┬─► illuminate(i) ─► settle ─► capture ─► detect ─► record ─┐
//!                                     └───────────────────────── i + 1 ◄────────────────────────────┘
//! ```
//!
//! Transient actuator or camera failures are retried with exponential
//! backoff and then recorded as occluded detections, so one flaky index never
//! voids a sweep. Whatever happens, the actuator is switched off before
//! control returns to the caller.

use crate::{
    actuator::{Actuator, ActuatorGuard, Rgb},
    camera::CameraMetadata,
    config::CaptureParams,
    detector::{Detector, OcclusionReason},
    error::{Error, Result},
    frame::Frame,
    session::{CaptureSession, Detection},
};
use std::{
    fmt::Display,
    ops::Range,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};
use tracing::{debug, info, warn};

/// A camera that can be asked for the next frame.
pub trait FrameSource {
    /// Returns the next frame. Failures are treated as transient and retried.
    fn capture(&mut self) -> Result<Frame>;
}

impl<F: FrameSource + ?Sized> FrameSource for &mut F {
    fn capture(&mut self) -> Result<Frame> {
        (**self).capture()
    }
}

/// An operator abort signal, shared between the sweep and whoever may stop it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the sweep to stop at the next index boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancel this token when the process receives Ctrl-C.
    ///
    /// A process can install only one such handler.
    pub fn cancel_on_interrupt(&self) -> Result<()> {
        let token = self.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, stopping after the current index");
            token.cancel();
        })
        .map_err(|err| Error::Config(format!("cannot install the interrupt handler: {err}")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every index in the requested range was recorded.
    Complete,

    /// The sweep was cancelled before `next_index` was attempted.
    Interrupted { next_index: usize },
}

/// Tallies of one sweep, written next to the session file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub angle_id: u32,
    pub count: usize,
    pub lit: usize,
    pub below_threshold: usize,
    pub ambiguous: usize,
    pub actuator_faults: usize,
    pub capture_faults: usize,
}

impl CaptureSummary {
    fn new(angle_id: u32, count: usize) -> Self {
        Self {
            angle_id,
            count,
            ..Default::default()
        }
    }

    fn tally(&mut self, detection: &Detection) {
        match detection.reason() {
            None => self.lit += 1,
            Some(OcclusionReason::BelowThreshold) => self.below_threshold += 1,
            Some(OcclusionReason::Ambiguous { .. }) => self.ambiguous += 1,
            Some(OcclusionReason::ActuatorFault) => self.actuator_faults += 1,
            Some(OcclusionReason::CaptureFault) => self.capture_faults += 1,
        }
    }

    /// Indices attempted during the sweep.
    pub fn attempted(&self) -> usize {
        self.lit + self.occluded()
    }

    pub fn occluded(&self) -> usize {
        self.below_threshold + self.ambiguous + self.faulted()
    }

    pub fn faulted(&self) -> usize {
        self.actuator_faults + self.capture_faults
    }

    /// The conventional summary file name for `angle_id`.
    pub fn file_name(angle_id: u32) -> String {
        format!("session_angle_{angle_id}_summary.txt")
    }
}

impl std::fmt::Display for CaptureSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Capture summary for angle {}", self.angle_id)?;
        writeln!(f, "  attempted:       {:>5} / {}", self.attempted(), self.count)?;
        writeln!(f, "  lit:             {:>5}", self.lit)?;
        writeln!(f, "  below threshold: {:>5}", self.below_threshold)?;
        writeln!(f, "  ambiguous:       {:>5}", self.ambiguous)?;
        writeln!(f, "  actuator faults: {:>5}", self.actuator_faults)?;
        write!(f, "  capture faults:  {:>5}", self.capture_faults)
    }
}

/// The result of a sweep, complete or not.
#[derive(Clone, Debug, PartialEq)]
pub struct Sweep {
    pub session: CaptureSession,
    pub outcome: Outcome,
    pub summary: CaptureSummary,
}

/// A capture sweep for one camera placement.
#[derive(Clone, Debug)]
pub struct Capture {
    name: String,
    angle_id: u32,
    camera: CameraMetadata,
    count: usize,
    detector: Detector,
    params: CaptureParams,
    frame_dir: Option<PathBuf>,
}

impl Capture {
    pub fn new(
        angle_id: u32,
        camera: CameraMetadata,
        count: usize,
        detector: Detector,
        params: CaptureParams,
    ) -> Self {
        Self {
            name: format!("angle {angle_id}"),
            angle_id,
            camera,
            count,
            detector,
            params,
            frame_dir: None,
        }
    }

    /// Name stored in sessions created by this capture.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Save every captured frame as `led_NNN.png` in `dir`.
    pub fn with_frame_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.frame_dir = Some(dir.into());
        self
    }

    pub fn angle_id(&self) -> u32 {
        self.angle_id
    }

    /// Sweep `range` into a new session.
    pub fn run<A, F>(
        &self,
        range: Range<usize>,
        actuator: &mut A,
        frames: &mut F,
        cancel: &CancelToken,
    ) -> Result<Sweep>
    where
        A: Actuator + ?Sized,
        F: FrameSource + ?Sized,
    {
        self.camera.validate()?;
        if range.end > self.count {
            return Err(Error::InvalidInput(format!(
                "range {range:?} exceeds LED count {}",
                self.count
            )));
        }

        let session = CaptureSession::new(self.name.clone(), self.angle_id, self.count, self.camera);
        self.sweep(session, range, actuator, frames, cancel)
    }

    /// Continue an interrupted `session` from `start` to the end.
    ///
    /// Indices below `start` are left exactly as they were recorded.
    pub fn resume<A, F>(
        &self,
        session: CaptureSession,
        start: usize,
        actuator: &mut A,
        frames: &mut F,
        cancel: &CancelToken,
    ) -> Result<Sweep>
    where
        A: Actuator + ?Sized,
        F: FrameSource + ?Sized,
    {
        self.camera.validate()?;
        if session.angle_id() != self.angle_id
            || session.count() != self.count
            || *session.camera() != self.camera
        {
            return Err(Error::InvalidInput(format!(
                "session for angle {} cannot be resumed by the capture for angle {}",
                session.angle_id(),
                self.angle_id
            )));
        }
        if start > self.count {
            return Err(Error::InvalidInput(format!(
                "resume index {start} exceeds LED count {}",
                self.count
            )));
        }

        self.sweep(session, start..self.count, actuator, frames, cancel)
    }

    fn sweep<A, F>(
        &self,
        mut session: CaptureSession,
        range: Range<usize>,
        actuator: &mut A,
        frames: &mut F,
        cancel: &CancelToken,
    ) -> Result<Sweep>
    where
        A: Actuator + ?Sized,
        F: FrameSource + ?Sized,
    {
        let mut guard = ActuatorGuard::new(actuator);
        info!(
            angle_id = self.angle_id,
            start = range.start,
            end = range.end,
            "starting capture sweep"
        );

        if let Some(dir) = &self.frame_dir {
            std::fs::create_dir_all(dir)?;
        }

        retry(&self.params, "all off", None, || guard.all_off())?;
        for _ in 0..self.params.warmup_frames {
            if let Err(err) = frames.capture() {
                debug!(%err, "warm-up frame failed");
            }
        }

        let baseline = match self.params.background_subtraction {
            true => {
                thread::sleep(self.params.settle_delay());
                let frame = retry(&self.params, "baseline capture", None, || frames.capture())?;
                self.check_shape(&frame)?;
                Some(frame)
            }
            false => None,
        };

        let mut summary = CaptureSummary::new(self.angle_id, self.count);
        let mut outcome = Outcome::Complete;
        for index in range {
            if cancel.is_cancelled() {
                warn!(angle_id = self.angle_id, index, "capture cancelled");
                outcome = Outcome::Interrupted { next_index: index };
                break;
            }

            let detection = self.capture_index(index, &mut guard, frames, baseline.as_ref())?;
            summary.tally(&detection);
            session.record(detection)?;
        }

        info!(
            angle_id = self.angle_id,
            lit = summary.lit,
            occluded = summary.occluded(),
            "capture sweep finished"
        );
        Ok(Sweep {
            session,
            outcome,
            summary,
        })
    }

    fn capture_index<A, F>(
        &self,
        index: usize,
        guard: &mut ActuatorGuard<'_, A>,
        frames: &mut F,
        baseline: Option<&Frame>,
    ) -> Result<Detection>
    where
        A: Actuator + ?Sized,
        F: FrameSource + ?Sized,
    {
        let color = Rgb::from(self.params.color);
        let brightness = self.params.brightness;

        if let Err(err) = retry(&self.params, "illuminate", Some(index), || {
            guard.illuminate(index, color, brightness)
        }) {
            warn!(index, %err, "giving up on index, actuator unavailable");
            return Ok(Detection::occluded(
                index,
                self.angle_id,
                OcclusionReason::ActuatorFault,
            ));
        }

        thread::sleep(self.params.settle_delay());

        let frame = match retry(&self.params, "capture", Some(index), || frames.capture()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(index, %err, "giving up on index, no frame captured");
                return Ok(Detection::occluded(
                    index,
                    self.angle_id,
                    OcclusionReason::CaptureFault,
                ));
            }
        };
        self.check_shape(&frame)?;

        if let Some(dir) = &self.frame_dir {
            frame.save(dir.join(frame_file_name(index)))?;
        }

        let observation = self.detector.detect(&frame, baseline)?;
        let detection = Detection::from_observation(index, self.angle_id, observation);
        match detection.pixel() {
            Some(pixel) => debug!(index, x = pixel.x, y = pixel.y, "detected"),
            None => debug!(index, reason = ?detection.reason(), "occluded"),
        }
        Ok(detection)
    }

    fn check_shape(&self, frame: &Frame) -> Result<()> {
        let expected = (self.camera.width, self.camera.height);
        match frame.dimensions() == expected {
            true => Ok(()),
            false => Err(Error::InvalidInput(format!(
                "camera delivered a {}x{} frame, expected {}x{}",
                frame.width(),
                frame.height(),
                expected.0,
                expected.1
            ))),
        }
    }
}

/// The file name of the saved frame for `index`.
pub fn frame_file_name(index: usize) -> String {
    format!("led_{index:03}.png")
}

/// Parses an index back out of a [`frame_file_name`].
pub fn parse_frame_file_name(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("led_")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}

/// Run `op` up to `max_attempts` times, sleeping with exponential backoff
/// between attempts.
fn retry<T, E: Display>(
    params: &CaptureParams,
    what: &str,
    index: Option<usize>,
    mut op: impl FnMut() -> std::result::Result<T, E>,
) -> std::result::Result<T, E> {
    let mut retries = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if retries + 1 < params.max_attempts => {
                let wait = params.backoff(retries);
                warn!(?index, retry = retries + 1, %err, ?wait, "{what} failed, retrying");
                thread::sleep(wait);
                retries += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
