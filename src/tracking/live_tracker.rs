use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::pacing::{period_for_hz, sleep_unless_cancelled};
use crate::config::Settings;
use crate::detection::{DetectionResult, SharedDetector};
use crate::error::DetectorError;
use crate::intake::FrameHandle;
use crate::tracking::overlay::LiveOverlay;
use crate::tracking::timings::{DetectionPass, DetectionTimings};

/// What one tracker cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    NoFrame,
    Duplicate,
    /// Detector was busy or a verification is pending.
    Yielded,
    Failed,
    Published,
    /// Result was computed but the overlay was cleared meanwhile.
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub cycles: u64,
    pub published: u64,
    pub duplicates: u64,
    pub yielded: u64,
    pub failed: u64,
}

impl TrackerStats {
    fn count(&mut self, outcome: CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Published => self.published += 1,
            CycleOutcome::Duplicate => self.duplicates += 1,
            CycleOutcome::Yielded => self.yielded += 1,
            CycleOutcome::Failed => self.failed += 1,
            CycleOutcome::NoFrame | CycleOutcome::Discarded => {}
        }
    }
}

/// Best-effort background detection on the newest frame, published as a [`LiveOverlay`].
///
/// Lossy by construction: frames produced between two cycles are never looked at.
pub struct LiveTracker {
    frames: FrameHandle,
    detector: SharedDetector,
    period: Duration,
    poll_interval: Duration,
    live_lock_wait: Duration,
    overlay_tx: Arc<watch::Sender<LiveOverlay>>,
    stats: Arc<Mutex<TrackerStats>>,
    timings: Arc<Mutex<DetectionTimings>>,
    cancel_token: CancellationToken,
    worker_thread: Option<JoinHandle<()>>,
}

impl LiveTracker {
    pub fn new(frames: FrameHandle, detector: SharedDetector, settings: &Settings) -> Self {
        let (overlay_tx, _) = watch::channel(LiveOverlay::default());
        Self {
            frames,
            detector,
            period: period_for_hz(settings.tracker.tracker_hz),
            poll_interval: settings.source.poll_interval(),
            live_lock_wait: settings.detector.live_lock_wait(),
            overlay_tx: Arc::new(overlay_tx),
            stats: Arc::new(Mutex::new(TrackerStats::default())),
            timings: Arc::new(Mutex::new(DetectionTimings::new())),
            cancel_token: CancellationToken::new(),
            worker_thread: None,
        }
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.cancel_token = CancellationToken::new();
        let mut tracker_loop = self.tracker_loop();
        let period = self.period;
        let poll_interval = self.poll_interval;
        let cancel_token = self.cancel_token.clone();
        info!("Starting live tracker every {:?}", period);
        self.worker_thread = Some(std::thread::spawn(move || {
            while !cancel_token.is_cancelled() {
                let started = Instant::now();
                tracker_loop.run_cycle();
                let rest = period.saturating_sub(started.elapsed());
                sleep_unless_cancelled(&cancel_token, rest, poll_interval);
            }
            debug!("Live tracker loop exited");
        }));
    }

    pub fn overlay(&self) -> LiveOverlay {
        self.overlay_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveOverlay> {
        self.overlay_tx.subscribe()
    }

    /// Blanks the overlay. A cycle already in flight cannot republish its result.
    pub fn clear(&self) {
        self.overlay_tx.send_modify(|overlay| {
            *overlay = LiveOverlay {
                epoch: overlay.epoch + 1,
                ..LiveOverlay::default()
            };
        });
    }

    pub fn stats(&self) -> TrackerStats {
        *self.stats.lock()
    }

    pub fn timings(&self) -> DetectionTimings {
        self.timings.lock().clone()
    }

    /// Adds a pass measured outside the loop, such as a capture verification.
    pub fn record_timing(&self, pass: DetectionPass, elapsed: Duration) {
        self.timings.lock().record(pass, elapsed);
    }

    pub fn is_running(&self) -> bool {
        self.worker_thread
            .as_ref()
            .map(|thread| !thread.is_finished())
            .unwrap_or(false)
    }

    /// Cancels the loop and waits for the cycle in flight, so the detector is idle
    /// when this returns.
    pub fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(thread) = self.worker_thread.take() {
            if thread.join().is_err() {
                error!("Live tracker thread panicked");
            } else {
                info!("Live tracker stopped");
            }
        }
    }

    fn tracker_loop(&self) -> TrackerLoop {
        TrackerLoop {
            frames: self.frames.clone(),
            detector: self.detector.clone(),
            live_lock_wait: self.live_lock_wait,
            overlay_tx: self.overlay_tx.clone(),
            stats: self.stats.clone(),
            timings: self.timings.clone(),
            last_processed: None,
        }
    }
}

impl Drop for LiveTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TimedDetection {
    result: DetectionResult,
    shoulders: Duration,
    marker: Duration,
}

struct TrackerLoop {
    frames: FrameHandle,
    detector: SharedDetector,
    live_lock_wait: Duration,
    overlay_tx: Arc<watch::Sender<LiveOverlay>>,
    stats: Arc<Mutex<TrackerStats>>,
    timings: Arc<Mutex<DetectionTimings>>,
    /// Frame sequence and overlay epoch of the last published cycle.
    last_processed: Option<(u64, u64)>,
}

impl TrackerLoop {
    fn run_cycle(&mut self) -> CycleOutcome {
        let outcome = self.cycle();
        self.stats.lock().count(outcome);
        outcome
    }

    fn cycle(&mut self) -> CycleOutcome {
        let Some(frame) = self.frames.try_latest() else {
            return CycleOutcome::NoFrame;
        };
        let epoch = self.overlay_tx.borrow().epoch;
        if self.last_processed == Some((frame.sequence(), epoch)) {
            return CycleOutcome::Duplicate;
        }

        let detection = self.detector.run_live(self.live_lock_wait, |detector| {
            let started = Instant::now();
            let (left_shoulder, right_shoulder) = detector.detect_shoulders(&frame)?;
            let shoulders = started.elapsed();
            let started = Instant::now();
            let marker = detector.detect_marker(&frame)?;
            Ok::<_, DetectorError>(TimedDetection {
                result: DetectionResult {
                    left_shoulder,
                    right_shoulder,
                    marker,
                },
                shoulders,
                marker: started.elapsed(),
            })
        });

        let detection = match detection {
            None => return CycleOutcome::Yielded,
            Some(Err(e)) => {
                warn!("Live detection failed on frame {}: {}", frame.sequence(), e);
                return CycleOutcome::Failed;
            }
            Some(Ok(detection)) => detection,
        };

        {
            let mut timings = self.timings.lock();
            timings.record(DetectionPass::Shoulders, detection.shoulders);
            timings.record(DetectionPass::Marker, detection.marker);
        }

        if !publish(&self.overlay_tx, epoch, frame.sequence(), detection.result) {
            debug!("Overlay cleared during cycle, dropping frame {}", frame.sequence());
            return CycleOutcome::Discarded;
        }
        self.last_processed = Some((frame.sequence(), epoch));
        CycleOutcome::Published
    }
}

/// Replaces the overlay unless it has been cleared since `epoch` was read.
fn publish(
    overlay_tx: &watch::Sender<LiveOverlay>,
    epoch: u64,
    frame_sequence: u64,
    detection: DetectionResult,
) -> bool {
    overlay_tx.send_if_modified(|overlay| {
        if overlay.epoch != epoch {
            return false;
        }
        *overlay = LiveOverlay {
            detection,
            frame_sequence: Some(frame_sequence),
            published_at: Some(Utc::now()),
            epoch,
        };
        true
    })
}
