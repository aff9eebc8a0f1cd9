use crate::actuator::ActuatorError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration fault: {0}")]
    Config(String),

    #[error("corrupt session file {}: {reason}", .path.display())]
    CorruptSession { path: PathBuf, reason: String },

    #[error("actuator fault: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("position map already exists at {}", .0.display())]
    MapExists(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;
