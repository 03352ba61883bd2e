use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbImage;
use tracing::debug;

use crate::error::SourceError;

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

/// Unblocks a [`VideoInput::read`] that is waiting on a device, from another thread.
/// Reads after an interrupt fail until the input is opened again.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// A polled video input. Implementations are driven from a single producer thread.
pub trait VideoInput: Send {
    /// Opens the underlying device or file. Failure here is terminal for the session.
    fn open(&mut self) -> Result<(), SourceError>;

    /// Reads the next image, or `None` once the end of the stream is reached.
    fn read(&mut self) -> Result<Option<RgbImage>, SourceError>;

    /// Seeks back to the first image of the stream.
    fn rewind(&mut self) -> Result<(), SourceError>;

    /// Releases the input. Must be safe to call more than once.
    fn close(&mut self);

    fn describe(&self) -> String;

    /// Inputs whose reads can block indefinitely hand out a way to break them.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

/// Reads a directory of still images in lexical file-name order.
pub struct ImageSequenceInput {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
}

impl ImageSequenceInput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
            cursor: 0,
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Unavailable {
            source_name: self.describe(),
            reason: reason.into(),
        }
    }

    fn is_image(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    }
}

impl VideoInput for ImageSequenceInput {
    fn open(&mut self) -> Result<(), SourceError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| self.unavailable(e.to_string()))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && Self::is_image(path))
            .collect();
        if files.is_empty() {
            return Err(self.unavailable("directory contains no images"));
        }
        files.sort();
        debug!("Opened image sequence {:?} with {} frames", self.dir, files.len());
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        let image = image::open(path).map_err(|error| SourceError::Decode {
            path: path.clone(),
            error,
        })?;
        self.cursor += 1;
        Ok(Some(image.to_rgb8()))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.cursor = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.files.clear();
        self.cursor = 0;
    }

    fn describe(&self) -> String {
        format!("image sequence {}", self.dir.display())
    }
}

/// Serves images held in memory. Opening an empty input fails like an unplugged camera.
pub struct MemoryInput {
    images: Vec<RgbImage>,
    cursor: usize,
    opened: bool,
}

impl MemoryInput {
    pub fn new(images: Vec<RgbImage>) -> Self {
        Self {
            images,
            cursor: 0,
            opened: false,
        }
    }
}

impl VideoInput for MemoryInput {
    fn open(&mut self) -> Result<(), SourceError> {
        if self.images.is_empty() {
            return Err(SourceError::Unavailable {
                source_name: self.describe(),
                reason: "no images loaded".to_string(),
            });
        }
        self.opened = true;
        self.cursor = 0;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if !self.opened {
            return Ok(None);
        }
        let image = self.images.get(self.cursor).cloned();
        if image.is_some() {
            self.cursor += 1;
        }
        Ok(image)
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.cursor = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn describe(&self) -> String {
        format!("in-memory input ({} images)", self.images.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn image_sequence_reads_in_name_order_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([2, 0, 0]))
            .save(dir.path().join("b.png"))
            .unwrap();
        RgbImage::from_pixel(4, 4, Rgb([1, 0, 0]))
            .save(dir.path().join("a.png"))
            .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut input = ImageSequenceInput::new(dir.path());
        input.open().unwrap();
        assert_eq!(input.read().unwrap().unwrap().get_pixel(0, 0), &Rgb([1, 0, 0]));
        assert_eq!(input.read().unwrap().unwrap().get_pixel(0, 0), &Rgb([2, 0, 0]));
        assert!(input.read().unwrap().is_none());

        input.rewind().unwrap();
        assert_eq!(input.read().unwrap().unwrap().get_pixel(0, 0), &Rgb([1, 0, 0]));
    }

    #[test]
    fn image_sequence_without_images_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = ImageSequenceInput::new(dir.path());
        assert!(matches!(input.open(), Err(SourceError::Unavailable { .. })));

        let mut missing = ImageSequenceInput::new(dir.path().join("missing"));
        assert!(matches!(missing.open(), Err(SourceError::Unavailable { .. })));
    }

    #[test]
    fn empty_memory_input_fails_to_open() {
        let mut input = MemoryInput::new(vec![]);
        assert!(matches!(input.open(), Err(SourceError::Unavailable { .. })));
    }
}
