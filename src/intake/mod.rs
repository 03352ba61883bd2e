pub mod ffmpeg_input;
pub mod frame_source;
pub mod video_input;

use std::path::Path;

pub use ffmpeg_input::FfmpegInput;
pub use frame_source::{FrameHandle, FramePump, FrameSource, SourceHealth};
pub use video_input::{ImageSequenceInput, Interrupter, MemoryInput, VideoInput};

use crate::config::SourceSettings;

/// Picks the input kind for a configured path: directories are image sequences,
/// everything else (files, devices, URLs) goes through ffmpeg.
pub fn input_for(settings: &SourceSettings) -> Box<dyn VideoInput> {
    let path: &Path = &settings.path;
    if path.is_dir() {
        Box::new(ImageSequenceInput::new(path))
    } else {
        Box::new(
            FfmpegInput::new(
                path.to_string_lossy().into_owned(),
                (settings.capture_width, settings.capture_height),
            )
            .with_read_timeout(settings.read_timeout()),
        )
    }
}
