//! The LED actuator interface and its scoped ownership.
//!
//! An [`Actuator`] is the remote service that lights individual LEDs. Only one
//! LED may be lit at a time and the lit state outlives any single request, so
//! the capture loop borrows the actuator through an [`ActuatorGuard`] that
//! switches everything off when the borrow ends.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActuatorError {
    #[error("actuator unreachable: {0}")]
    Unreachable(String),

    #[error("actuator rejected command: {0}")]
    Rejected(String),
}

/// An RGB colour sent to the actuator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Returns the index of the strictly dominant channel, or `None` for
    /// white and mixed colours.
    pub fn dominant_channel(&self) -> Option<usize> {
        let (r, g, b) = (self.r, self.g, self.b);
        if r > g && r > b {
            Some(0)
        } else if g > r && g > b {
            Some(1)
        } else if b > r && b > g {
            Some(2)
        } else {
            None
        }
    }
}

impl From<[u8; 3]> for Rgb {
    fn from([r, g, b]: [u8; 3]) -> Self {
        Self::new(r, g, b)
    }
}

/// A device that can light one addressable LED at a time.
///
/// Both operations must be idempotent and safe to call at any time,
/// including when nothing is lit.
pub trait Actuator {
    /// Light only the LED at `index`.
    fn illuminate(&mut self, index: usize, color: Rgb, brightness: u8)
    -> Result<(), ActuatorError>;

    /// Switch every LED off.
    fn all_off(&mut self) -> Result<(), ActuatorError>;
}

impl<A: Actuator + ?Sized> Actuator for &mut A {
    fn illuminate(
        &mut self,
        index: usize,
        color: Rgb,
        brightness: u8,
    ) -> Result<(), ActuatorError> {
        (**self).illuminate(index, color, brightness)
    }

    fn all_off(&mut self) -> Result<(), ActuatorError> {
        (**self).all_off()
    }
}

/// Exclusive, scoped access to an [`Actuator`].
///
/// Dropping the guard issues `all_off`, whether the holder finished
/// normally, returned early, propagated an error or unwound from a panic.
pub struct ActuatorGuard<'a, A: Actuator + ?Sized> {
    actuator: &'a mut A,
}

impl<'a, A: Actuator + ?Sized> ActuatorGuard<'a, A> {
    pub fn new(actuator: &'a mut A) -> Self {
        Self { actuator }
    }

    pub fn illuminate(
        &mut self,
        index: usize,
        color: Rgb,
        brightness: u8,
    ) -> Result<(), ActuatorError> {
        self.actuator.illuminate(index, color, brightness)
    }

    pub fn all_off(&mut self) -> Result<(), ActuatorError> {
        self.actuator.all_off()
    }
}

impl<A: Actuator + ?Sized> Drop for ActuatorGuard<'_, A> {
    fn drop(&mut self) {
        match self.actuator.all_off() {
            Ok(()) => debug!("released actuator with all LEDs off"),
            Err(err) => error!(%err, "failed to switch LEDs off on release"),
        }
    }
}
