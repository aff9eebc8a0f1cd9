//! Camera-ring calibration for addressable LED installations.
//!
//! Each LED is lit in turn while a camera placed at several angles around
//! the installation photographs it. The brightest spot in every frame becomes
//! a [`session::Detection`], every detection becomes a ray through the
//! assumed camera ring, and the rays of one LED are intersected to place it
//! in 3D. The result is exported as a normalized [`export::PositionMap`].
//!
//! ```text
//!   Detector ─► Capture (per angle) ─► session files ─► Triangulator (per index) ─► Exporter
//! ```

pub mod actuator;
pub mod camera;
pub mod capture;
pub mod config;
pub mod detector;
pub mod error;
pub mod export;
pub mod frame;
pub mod ray;
pub mod report;
pub mod session;
pub mod simulation;
pub mod triangulate;

pub use error::{Error, Result};
