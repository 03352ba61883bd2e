pub mod app;
pub mod capture;
pub mod common;
pub mod config;
pub mod detection;
pub mod error;
pub mod intake;
pub mod tracking;

#[cfg(test)]
mod testing;

pub use app::{LocalizationStep, Notifier};
pub use capture::{CaptureSession, PatientRecord};
pub use config::Settings;
pub use error::{AppError, DetectorError, SessionError, SourceError};
