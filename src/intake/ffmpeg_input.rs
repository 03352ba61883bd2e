use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use image::RgbImage;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::intake::video_input::{Interrupter, VideoInput};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
const QUEUE_SIZE: usize = 2;

type DecodedFrame = Result<Option<RgbImage>, SourceError>;

/// The running decoder, shared with whoever may need to kill it mid-read.
#[derive(Default)]
struct FfmpegProcess {
    child: Mutex<Option<Child>>,
    interrupted: AtomicBool,
}

impl FfmpegProcess {
    fn kill(&self) {
        if let Some(mut child) = self.child.lock().take() {
            if let Err(e) = child.kill() {
                debug!("ffmpeg already exited: {}", e);
            }
            let _ = child.wait();
        }
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.kill();
    }
}

/// Decodes a video file or camera through an `ffmpeg` child process emitting raw
/// RGB24 frames on stdout. A reader thread feeds a small bounded queue, so a read
/// never waits longer than the read timeout. Rewinding restarts the process.
pub struct FfmpegInput {
    uri: String,
    size: (u32, u32),
    read_timeout: Duration,
    process: Arc<FfmpegProcess>,
    frames: Option<Receiver<DecodedFrame>>,
    /// First frame, read while opening to prove the device delivers.
    pending: Option<RgbImage>,
}

impl FfmpegInput {
    pub fn new(uri: impl Into<String>, size: (u32, u32)) -> Self {
        Self {
            uri: uri.into(),
            size,
            read_timeout: DEFAULT_READ_TIMEOUT,
            process: Arc::new(FfmpegProcess::default()),
            frames: None,
            pending: None,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn unavailable(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Unavailable {
            source_name: self.describe(),
            reason: reason.into(),
        }
    }

    fn device_path(&self) -> Option<String> {
        parse_device_index(&self.uri)
            .map(|index| format!("/dev/video{index}"))
            .or_else(|| self.uri.starts_with("/dev/video").then(|| self.uri.clone()))
    }

    fn command(&self) -> Command {
        let scale_arg = format!("scale={}:{}", self.size.0, self.size.1);
        let device = self.device_path();

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");
        if device.is_some() {
            cmd.arg("-f").arg("video4linux2");
        }
        cmd.arg("-i")
            .arg(device.as_deref().unwrap_or(&self.uri))
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        cmd
    }

    fn spawn(&mut self) -> Result<(), SourceError> {
        if self.process.interrupted.load(Ordering::SeqCst) {
            return Err(self.unavailable("input was interrupted"));
        }
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| self.unavailable(format!("failed to spawn ffmpeg: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.unavailable("failed to capture ffmpeg stdout"))?;
        *self.process.child.lock() = Some(child);

        let (tx, rx) = bounded(QUEUE_SIZE);
        let size = self.size;
        thread::spawn(move || read_frames(stdout, size, tx));
        self.frames = Some(rx);
        debug!("Spawned ffmpeg for {}", self.uri);
        Ok(())
    }

    fn kill(&mut self) {
        self.frames = None;
        self.pending = None;
        self.process.kill();
    }

    fn next_decoded(&mut self) -> DecodedFrame {
        let Some(frames) = self.frames.as_ref() else {
            return Ok(None);
        };
        match frames.recv_timeout(self.read_timeout) {
            Ok(decoded) => decoded,
            Err(RecvTimeoutError::Timeout) => Err(SourceError::Stalled(self.read_timeout)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

impl VideoInput for FfmpegInput {
    fn open(&mut self) -> Result<(), SourceError> {
        if self.size.0 == 0 || self.size.1 == 0 {
            return Err(self.unavailable("capture size must be non-zero"));
        }
        match self.device_path() {
            Some(device) if !Path::new(&device).exists() => {
                return Err(self.unavailable(format!("no such device {device}")));
            }
            Some(_) => {}
            None if !self.uri.contains("://") && !Path::new(&self.uri).exists() => {
                return Err(self.unavailable("no such file"));
            }
            None => {}
        }

        self.process.interrupted.store(false, Ordering::SeqCst);
        self.spawn()?;
        match self.next_decoded() {
            Ok(Some(image)) => {
                self.pending = Some(image);
                Ok(())
            }
            Ok(None) => {
                self.kill();
                Err(self.unavailable("ffmpeg produced no frame"))
            }
            Err(e) => {
                self.kill();
                Err(self.unavailable(format!("no first frame: {e}")))
            }
        }
    }

    fn read(&mut self) -> Result<Option<RgbImage>, SourceError> {
        if let Some(image) = self.pending.take() {
            return Ok(Some(image));
        }
        self.next_decoded()
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        self.kill();
        self.spawn().map_err(|e| {
            warn!("Failed to restart ffmpeg for {}: {}", self.uri, e);
            e
        })
    }

    fn close(&mut self) {
        self.kill();
    }

    fn describe(&self) -> String {
        format!("ffmpeg {}", self.uri)
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let process = self.process.clone();
        Some(Arc::new(move || process.interrupt()))
    }
}

impl Drop for FfmpegInput {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Reader thread body: forwards decoded frames until end of stream, a read error,
/// or the receiving input going away.
fn read_frames(mut stdout: ChildStdout, size: (u32, u32), tx: Sender<DecodedFrame>) {
    let mut buffer = vec![0u8; size.0 as usize * size.1 as usize * 3];
    loop {
        let decoded = match stdout.read_exact(&mut buffer) {
            Ok(()) => match RgbImage::from_raw(size.0, size.1, buffer.clone()) {
                Some(image) => Ok(Some(image)),
                None => Ok(None),
            },
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(SourceError::Read(e)),
        };
        let last = !matches!(decoded, Ok(Some(_)));
        if tx.send(decoded).is_err() || last {
            break;
        }
    }
}

pub(crate) fn parse_device_index(uri: &str) -> Option<u32> {
    if let Ok(index) = uri.parse::<u32>() {
        return Some(index);
    }
    uri.strip_prefix("/dev/video")
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
}
