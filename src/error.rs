use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::capture::SessionStateKind;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
    #[error("Source Error: {0}")]
    Source(#[from] SourceError),
    #[error("Detector Error: {0}")]
    Detector(#[from] DetectorError),
    #[error("Session Error: {0}")]
    Session(#[from] SessionError),
    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("pixel buffer holds {actual} bytes, expected {expected} for {width}x{height}")]
    BufferSize {
        actual: usize,
        expected: usize,
        width: u32,
        height: u32,
    },
    #[error("frame has zero area")]
    Empty,
}

// Video input Error Type
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source {source_name} is unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },
    #[error("failed to read from video source: {0}")]
    Read(std::io::Error),
    #[error("failed to decode {path:?}: {error}")]
    Decode {
        path: PathBuf,
        error: image::ImageError,
    },
    #[error("video source produced no frame after rewinding")]
    EmptyStream,
    #[error("no frame produced within {0:?}")]
    NoFrame(Duration),
    #[error("video source delivered nothing for {0:?}")]
    Stalled(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to load model {path:?}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },
    #[error("inference failed in {model}: {reason}")]
    Inference { model: &'static str, reason: String },
    #[error("detector busy for longer than {0:?}")]
    Contention(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {action} while the capture session is {state}")]
    InvalidTransition {
        action: &'static str,
        state: SessionStateKind,
    },
}
