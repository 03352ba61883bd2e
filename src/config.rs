use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Settings for the live localization step, layered as defaults, then an optional
/// file, then environment variables such as `PAINLOC__SOURCE__TARGET_FPS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub source: SourceSettings,
    pub detector: DetectorSettings,
    pub tracker: TrackerSettings,
    pub capture: CaptureSettings,
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Directory of still images, a video file, or a camera device (`/dev/video0` or `0`).
    pub path: PathBuf,
    pub target_fps: u32,
    /// Decode size requested from ffmpeg backed inputs.
    pub capture_width: u32,
    pub capture_height: u32,
    pub first_frame_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Longest wait for one frame from a streaming input before the read counts as failed.
    pub read_timeout_ms: u64,
    /// Consecutive read failures tolerated before frame production gives up.
    pub max_consecutive_errors: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    pub model_dir: PathBuf,
    pub keypoint_confidence: f32,
    pub marker_class: u32,
    pub verify_lock_timeout_ms: u64,
    pub live_lock_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub tracker_hz: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub countdown_ms: u64,
    pub annotate_verified: bool,
    pub event_buffer_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: SourceSettings::default(),
            detector: DetectorSettings::default(),
            tracker: TrackerSettings::default(),
            capture: CaptureSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("0"),
            target_fps: 30,
            capture_width: 1280,
            capture_height: 720,
            first_frame_timeout_ms: 500,
            poll_interval_ms: 5,
            read_timeout_ms: 2_000,
            max_consecutive_errors: 30,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            keypoint_confidence: 0.5,
            marker_class: 1,
            verify_lock_timeout_ms: 50,
            live_lock_wait_ms: 5,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self { tracker_hz: 30 }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            countdown_ms: 5_000,
            annotate_verified: true,
            event_buffer_size: 64,
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix("PAINLOC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate().map_err(AppError::InvalidSettings)?;
        Ok(settings)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.source.path.as_os_str().is_empty() {
            return Err("Source path must not be empty".to_string());
        }

        if self.source.target_fps == 0 {
            return Err("Target fps must be greater than 0".to_string());
        }

        if self.source.capture_width == 0 || self.source.capture_height == 0 {
            return Err("Capture size must be greater than 0".to_string());
        }

        if self.source.read_timeout_ms == 0 {
            return Err("Read timeout must be greater than 0".to_string());
        }

        if self.tracker.tracker_hz == 0 {
            return Err("Tracker frequency must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.detector.keypoint_confidence) {
            return Err("Keypoint confidence must be between 0.0 and 1.0".to_string());
        }

        if self.capture.countdown_ms == 0 {
            return Err("Countdown must be greater than 0".to_string());
        }

        if self.capture.event_buffer_size == 0 {
            return Err("Event buffer size must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl SourceSettings {
    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl DetectorSettings {
    pub fn verify_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_lock_timeout_ms)
    }

    pub fn live_lock_wait(&self) -> Duration {
        Duration::from_millis(self.live_lock_wait_ms)
    }
}

impl CaptureSettings {
    pub fn countdown(&self) -> Duration {
        Duration::from_millis(self.countdown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut settings = Settings::default();
        settings.detector.keypoint_confidence = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.tracker.tracker_hz = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{ "source": {{ "path": "frames", "target_fps": 12 }}, "capture": {{ "countdown_ms": 1500 }} }}"#
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.source.path, PathBuf::from("frames"));
        assert_eq!(settings.source.target_fps, 12);
        assert_eq!(settings.capture.countdown(), Duration::from_millis(1500));
        // untouched sections keep their defaults
        assert_eq!(settings.tracker.tracker_hz, 30);
        assert_eq!(settings.detector.verify_lock_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn environment_overrides_file_and_defaults() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{ "detector": {{ "marker_class": 3 }} }}"#).unwrap();

        std::env::set_var("PAINLOC__DETECTOR__MARKER_CLASS", "7");
        let loaded = Settings::load(Some(file.path()));
        std::env::remove_var("PAINLOC__DETECTOR__MARKER_CLASS");

        let settings = loaded.unwrap();
        assert_eq!(settings.detector.marker_class, 7);
        assert_eq!(settings.source.read_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn invalid_file_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{ "tracker": {{ "tracker_hz": 0 }} }}"#).unwrap();
        assert!(matches!(
            Settings::load(Some(file.path())),
            Err(AppError::InvalidSettings(_))
        ));
    }
}
