use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::Frame;
use crate::common::pacing::{period_for_hz, sleep_unless_cancelled};
use crate::config::SourceSettings;
use crate::error::SourceError;
use crate::intake::video_input::{Interrupter, VideoInput};

/// Frame production as seen from the reading side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceHealth {
    Stopped,
    Running,
    /// Production gave up. No frame follows until the source is started again.
    Failed { source_name: String, reason: String },
}

/// Cloneable read side of the newest frame. Readers always see a whole frame,
/// either the previous one or the next one.
#[derive(Clone)]
pub struct FrameHandle {
    frame_rx: watch::Receiver<Option<Frame>>,
    health_rx: watch::Receiver<SourceHealth>,
    first_frame_timeout: Duration,
    poll_interval: Duration,
}

impl FrameHandle {
    /// Newest frame without waiting.
    pub fn try_latest(&self) -> Option<Frame> {
        self.frame_rx.borrow().clone()
    }

    /// Newest frame, waiting up to the configured bound for the first one to exist.
    /// A source that gave up never serves a frame.
    pub fn latest(&self) -> Result<Frame, SourceError> {
        let deadline = Instant::now() + self.first_frame_timeout;
        loop {
            if let Some(e) = self.failure() {
                return Err(e);
            }
            if let Some(frame) = self.try_latest() {
                return Ok(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SourceError::NoFrame(self.first_frame_timeout));
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Frame>> {
        self.frame_rx.clone()
    }

    pub fn health(&self) -> SourceHealth {
        self.health_rx.borrow().clone()
    }

    /// The terminal error once production has given up.
    pub fn failure(&self) -> Option<SourceError> {
        match &*self.health_rx.borrow() {
            SourceHealth::Failed {
                source_name,
                reason,
            } => Some(SourceError::Unavailable {
                source_name: source_name.clone(),
                reason: reason.clone(),
            }),
            SourceHealth::Stopped | SourceHealth::Running => None,
        }
    }
}

#[cfg(test)]
impl FrameHandle {
    /// Handle fed by the returned sender instead of a running source.
    pub(crate) fn detached(frame: Option<Frame>) -> (watch::Sender<Option<Frame>>, Self) {
        let (frame_tx, frame_rx) = watch::channel(frame);
        let (_, health_rx) = watch::channel(SourceHealth::Running);
        let handle = Self {
            frame_rx,
            health_rx,
            first_frame_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
        };
        (frame_tx, handle)
    }
}

/// Pulls images from a [`VideoInput`] and publishes them as numbered frames.
pub struct FramePump {
    input: Box<dyn VideoInput>,
    sequence: u64,
    frame_tx: Arc<watch::Sender<Option<Frame>>>,
    preview_tx: Arc<watch::Sender<Option<Frame>>>,
    preview_size: Arc<Mutex<Option<(u32, u32)>>>,
}

impl FramePump {
    /// Advances to the next frame, rewinding at end of stream so the sequence never ends.
    pub fn poll_next(&mut self) -> Result<Frame, SourceError> {
        let image = match self.input.read()? {
            Some(image) => image,
            None => {
                debug!("End of stream on {}, rewinding", self.input.describe());
                self.input.rewind()?;
                self.input.read()?.ok_or(SourceError::EmptyStream)?
            }
        };
        self.sequence += 1;
        let frame = Frame::from_rgb_image(image, self.sequence)?;
        let preview = match *self.preview_size.lock() {
            Some((width, height)) => frame.fit_within(width, height),
            None => frame.clone(),
        };
        self.frame_tx.send_replace(Some(frame.clone()));
        self.preview_tx.send_replace(Some(preview));
        Ok(frame)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn close(&mut self) {
        self.input.close();
    }

    /// Drops the published frames so nobody keeps working on a dead feed.
    fn clear(&self) {
        self.frame_tx.send_replace(None);
        self.preview_tx.send_replace(None);
    }
}

/// Owns the video input and produces frames on a dedicated thread at a fixed cadence.
pub struct FrameSource {
    input: Option<Box<dyn VideoInput>>,
    target_fps: u32,
    poll_interval: Duration,
    first_frame_timeout: Duration,
    max_consecutive_errors: u32,
    frame_tx: Arc<watch::Sender<Option<Frame>>>,
    preview_tx: Arc<watch::Sender<Option<Frame>>>,
    preview_size: Arc<Mutex<Option<(u32, u32)>>>,
    health_tx: Arc<watch::Sender<SourceHealth>>,
    cancel_token: CancellationToken,
    interrupter: Option<Interrupter>,
    producer_thread: Option<JoinHandle<Box<dyn VideoInput>>>,
}

impl FrameSource {
    pub fn new(input: Box<dyn VideoInput>, settings: &SourceSettings) -> Self {
        let (frame_tx, _) = watch::channel(None);
        let (preview_tx, _) = watch::channel(None);
        let (health_tx, _) = watch::channel(SourceHealth::Stopped);
        Self {
            input: Some(input),
            target_fps: settings.target_fps,
            poll_interval: settings.poll_interval(),
            first_frame_timeout: settings.first_frame_timeout(),
            max_consecutive_errors: settings.max_consecutive_errors,
            frame_tx: Arc::new(frame_tx),
            preview_tx: Arc::new(preview_tx),
            preview_size: Arc::new(Mutex::new(None)),
            health_tx: Arc::new(health_tx),
            cancel_token: CancellationToken::new(),
            interrupter: None,
            producer_thread: None,
        }
    }

    /// Opens the input and starts producing frames.
    pub fn start(&mut self) -> Result<(), SourceError> {
        if self.producer_thread.is_some() {
            return Ok(());
        }
        let Some(mut input) = self.input.take() else {
            return Err(SourceError::Unavailable {
                source_name: "frame source".to_string(),
                reason: "input was lost by a previous producer".to_string(),
            });
        };
        if let Err(e) = input.open() {
            error!("Failed to open {}: {}", input.describe(), e);
            self.input = Some(input);
            return Err(e);
        }
        info!("Opened {} at {} fps", input.describe(), self.target_fps);

        // Frames from an earlier run must never be handed out again.
        self.frame_tx.send_replace(None);
        self.preview_tx.send_replace(None);
        self.health_tx.send_replace(SourceHealth::Running);
        self.cancel_token = CancellationToken::new();
        self.interrupter = input.interrupter();

        let pump = FramePump {
            input,
            sequence: 0,
            frame_tx: self.frame_tx.clone(),
            preview_tx: self.preview_tx.clone(),
            preview_size: self.preview_size.clone(),
        };
        let producer = FrameProducer {
            pump,
            period: period_for_hz(self.target_fps),
            poll_interval: self.poll_interval,
            max_consecutive_errors: self.max_consecutive_errors,
            health_tx: self.health_tx.clone(),
        };
        let cancel_token = self.cancel_token.clone();
        self.producer_thread = Some(std::thread::spawn(move || producer.run(cancel_token)));
        Ok(())
    }

    pub fn handle(&self) -> FrameHandle {
        FrameHandle {
            frame_rx: self.frame_tx.subscribe(),
            health_rx: self.health_tx.subscribe(),
            first_frame_timeout: self.first_frame_timeout,
            poll_interval: self.poll_interval,
        }
    }

    pub fn latest(&self) -> Result<Frame, SourceError> {
        self.handle().latest()
    }

    /// Preview frames, downscaled according to the last [`FrameSource::resize_hint`].
    pub fn preview(&self) -> watch::Receiver<Option<Frame>> {
        self.preview_tx.subscribe()
    }

    /// Advisory display size for the preview path; detection keeps full resolution.
    pub fn resize_hint(&self, width: u32, height: u32) {
        let hint = (width > 0 && height > 0).then_some((width, height));
        *self.preview_size.lock() = hint;
    }

    pub fn health(&self) -> SourceHealth {
        self.health_tx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.producer_thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    /// Stops production and releases the input. A read blocked on the device is
    /// interrupted first, so this never waits on the camera. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(thread) = self.producer_thread.take() {
            if let Some(interrupt) = self.interrupter.take() {
                interrupt();
            }
            match thread.join() {
                Ok(input) => {
                    info!("Released {}", input.describe());
                    self.input = Some(input);
                }
                Err(_) => error!("Frame producer thread panicked"),
            }
        }
        self.health_tx.send_if_modified(|health| {
            let running = *health == SourceHealth::Running;
            if running {
                *health = SourceHealth::Stopped;
            }
            running
        });
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FrameProducer {
    pump: FramePump,
    period: Duration,
    poll_interval: Duration,
    max_consecutive_errors: u32,
    health_tx: Arc<watch::Sender<SourceHealth>>,
}

impl FrameProducer {
    fn run(mut self, cancel_token: CancellationToken) -> Box<dyn VideoInput> {
        let mut consecutive_errors = 0u32;
        while !cancel_token.is_cancelled() {
            let started = Instant::now();
            match self.pump.poll_next() {
                Ok(_) => consecutive_errors = 0,
                Err(_) if cancel_token.is_cancelled() => break,
                Err(e) => {
                    consecutive_errors += 1;
                    warn!("Failed to produce frame ({} in a row): {}", consecutive_errors, e);
                    if consecutive_errors >= self.max_consecutive_errors.max(1) {
                        error!("Giving up on frame production after {} errors", consecutive_errors);
                        self.give_up(e);
                        break;
                    }
                }
            }
            let rest = self.period.saturating_sub(started.elapsed());
            sleep_unless_cancelled(&cancel_token, rest, self.poll_interval);
        }
        debug!("Frame producer stopped after {} frames", self.pump.sequence());
        self.pump.close();
        self.pump.input
    }

    fn give_up(&self, last_error: SourceError) {
        self.health_tx.send_replace(SourceHealth::Failed {
            source_name: self.pump.input.describe(),
            reason: format!(
                "{} consecutive read failures, last: {}",
                self.max_consecutive_errors.max(1),
                last_error
            ),
        });
        self.pump.clear();
    }
}
