use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::record::PatientRecord;
use crate::common::{Frame, Point2D};
use crate::detection::{DetectionResult, SharedDetector};
use crate::error::{DetectorError, SessionError};
use crate::intake::FrameHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStateKind {
    Idle,
    Timing,
    Frozen,
    Verified,
    Failed,
}

impl fmt::Display for SessionStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStateKind::Idle => "idle",
            SessionStateKind::Timing => "timing",
            SessionStateKind::Frozen => "frozen",
            SessionStateKind::Verified => "verified",
            SessionStateKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a frozen frame did not verify. Every reason is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ShoulderNotDetected,
    MarkerNotDetected,
    DetectorBusy,
    DetectorFault,
}

impl FailureReason {
    pub fn message(self) -> &'static str {
        match self {
            FailureReason::ShoulderNotDetected => "shoulder not detected",
            FailureReason::MarkerNotDetected => "marker not detected",
            FailureReason::DetectorBusy => "detector busy, try again",
            FailureReason::DetectorFault => "detection failed, try again",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Both shoulders and the marker, all present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifiedLocalization {
    pub left_shoulder: Point2D,
    pub right_shoulder: Point2D,
    pub marker: Point2D,
}

impl VerifiedLocalization {
    /// Shoulders are checked before the marker, so a frame missing both reports the shoulders.
    pub fn from_detection(result: &DetectionResult) -> Result<Self, FailureReason> {
        let (Some(left_shoulder), Some(right_shoulder)) =
            (result.left_shoulder, result.right_shoulder)
        else {
            return Err(FailureReason::ShoulderNotDetected);
        };
        let marker = result.marker.ok_or(FailureReason::MarkerNotDetected)?;
        Ok(Self {
            left_shoulder,
            right_shoulder,
            marker,
        })
    }

    pub fn as_detection(&self) -> DetectionResult {
        DetectionResult {
            left_shoulder: Some(self.left_shoulder),
            right_shoulder: Some(self.right_shoulder),
            marker: Some(self.marker),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionChange {
    TimerStarted { countdown_ms: u64 },
    TimerCancelled,
    /// The countdown expired before the source had produced anything.
    NoFrameAtExpiry,
    Frozen { frame_sequence: u64 },
    Verified { localization: VerifiedLocalization },
    Failed { reason: FailureReason },
    Confirmed { frame_sequence: u64 },
    Retried,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub episode: usize,
    pub state: SessionStateKind,
    pub change: SessionChange,
    pub at: DateTime<Utc>,
}

/// The frame travels with the states that own one, so a frozen frame exists
/// exactly in `Frozen`, `Verified` and `Failed`.
#[derive(Debug, Clone)]
enum SessionState {
    Idle,
    Timing { deadline: Instant },
    Frozen { frame: Frame },
    Verified { frame: Frame, localization: VerifiedLocalization },
    Failed { frame: Frame, reason: FailureReason },
}

impl SessionState {
    fn kind(&self) -> SessionStateKind {
        match self {
            SessionState::Idle => SessionStateKind::Idle,
            SessionState::Timing { .. } => SessionStateKind::Timing,
            SessionState::Frozen { .. } => SessionStateKind::Frozen,
            SessionState::Verified { .. } => SessionStateKind::Verified,
            SessionState::Failed { .. } => SessionStateKind::Failed,
        }
    }
}

/// Countdown, freeze and verification for one pain episode.
///
/// Driven from a single control thread. Only verification touches the detector,
/// and only through exclusive access.
pub struct CaptureSession {
    id: Uuid,
    episode: usize,
    countdown: Duration,
    state: SessionState,
    events: broadcast::Sender<SessionEvent>,
}

impl CaptureSession {
    pub fn new(episode: usize, countdown: Duration, event_buffer_size: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer_size.max(1));
        Self::with_events(episode, countdown, events)
    }

    /// Session publishing on an existing event channel, so subscribers outlive it.
    pub fn with_events(
        episode: usize,
        countdown: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let id = Uuid::new_v4();
        debug!("Capture session {} created for episode {}", id, episode);
        Self {
            id,
            episode,
            countdown,
            state: SessionState::Idle,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn episode(&self) -> usize {
        self.episode
    }

    pub fn state(&self) -> SessionStateKind {
        self.state.kind()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn countdown_deadline(&self) -> Option<Instant> {
        match &self.state {
            SessionState::Timing { deadline } => Some(*deadline),
            _ => None,
        }
    }

    pub fn frozen_frame(&self) -> Option<&Frame> {
        match &self.state {
            SessionState::Frozen { frame }
            | SessionState::Verified { frame, .. }
            | SessionState::Failed { frame, .. } => Some(frame),
            SessionState::Idle | SessionState::Timing { .. } => None,
        }
    }

    pub fn verified_result(&self) -> Option<&VerifiedLocalization> {
        match &self.state {
            SessionState::Verified { localization, .. } => Some(localization),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.state {
            SessionState::Failed { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Starts the countdown. A failed capture is discarded first.
    pub fn start_timer(&mut self, now: Instant) -> Result<Instant, SessionError> {
        match self.state {
            SessionState::Idle | SessionState::Failed { .. } => {}
            _ => return Err(self.invalid("start the timer")),
        }
        let deadline = now + self.countdown;
        self.state = SessionState::Timing { deadline };
        info!("Countdown started for episode {} ({:?})", self.episode, self.countdown);
        self.emit(SessionChange::TimerStarted {
            countdown_ms: self.countdown.as_millis() as u64,
        });
        Ok(deadline)
    }

    pub fn cancel_timer(&mut self) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Timing { .. }) {
            return Err(self.invalid("cancel the timer"));
        }
        self.state = SessionState::Idle;
        info!("Countdown cancelled for episode {}", self.episode);
        self.emit(SessionChange::TimerCancelled);
        Ok(())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.countdown_deadline()
            .map(|deadline| now >= deadline)
            .unwrap_or(false)
    }

    /// Countdown left for display, `None` outside `Timing`.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.countdown_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Takes ownership of the frame captured at expiry.
    pub fn freeze(&mut self, frame: Frame) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Timing { .. }) {
            return Err(self.invalid("freeze a frame"));
        }
        let frame_sequence = frame.sequence();
        self.state = SessionState::Frozen { frame };
        debug!("Froze frame {} for episode {}", frame_sequence, self.episode);
        self.emit(SessionChange::Frozen { frame_sequence });
        Ok(())
    }

    /// Countdown expired but there is nothing to freeze; back to `Idle`.
    pub fn abort_no_frame(&mut self) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Timing { .. }) {
            return Err(self.invalid("abort the countdown"));
        }
        self.state = SessionState::Idle;
        warn!("No frame available at countdown expiry for episode {}", self.episode);
        self.emit(SessionChange::NoFrameAtExpiry);
        Ok(())
    }

    /// Runs `detect` on the frozen frame and settles on `Verified` or `Failed`.
    pub fn verify_with<F>(&mut self, detect: F) -> Result<SessionStateKind, SessionError>
    where
        F: FnOnce(&Frame) -> Result<DetectionResult, DetectorError>,
    {
        let frame = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Frozen { frame } => frame,
            other => {
                self.state = other;
                return Err(self.invalid("verify"));
            }
        };

        let outcome = match detect(&frame) {
            Ok(result) => VerifiedLocalization::from_detection(&result),
            Err(DetectorError::Contention(waited)) => {
                warn!("Verification could not get the detector within {:?}", waited);
                Err(FailureReason::DetectorBusy)
            }
            Err(e) => {
                error!("Verification failed on frame {}: {}", frame.sequence(), e);
                Err(FailureReason::DetectorFault)
            }
        };

        match outcome {
            Ok(localization) => {
                info!("Episode {} verified on frame {}", self.episode, frame.sequence());
                self.state = SessionState::Verified {
                    frame,
                    localization,
                };
                self.emit(SessionChange::Verified { localization });
            }
            Err(reason) => {
                warn!("Episode {} capture failed: {}", self.episode, reason);
                self.state = SessionState::Failed { frame, reason };
                self.emit(SessionChange::Failed { reason });
            }
        }
        Ok(self.state())
    }

    /// Verifies under exclusive detector access, waiting at most `lock_timeout`.
    pub fn verify(
        &mut self,
        detector: &SharedDetector,
        lock_timeout: Duration,
    ) -> Result<SessionStateKind, SessionError> {
        self.verify_with(|frame| {
            detector
                .run_exclusive(lock_timeout, |d| d.detect(frame))
                .and_then(|result| result)
        })
    }

    /// Advances an expired countdown: freeze the newest frame and verify it.
    /// Returns the new state when something changed.
    pub fn poll(
        &mut self,
        now: Instant,
        frames: &FrameHandle,
        detector: &SharedDetector,
        lock_timeout: Duration,
    ) -> Result<Option<SessionStateKind>, SessionError> {
        if !self.is_expired(now) {
            return Ok(None);
        }
        match frames.latest() {
            Ok(frame) => {
                self.freeze(frame)?;
                self.verify(detector, lock_timeout).map(Some)
            }
            Err(e) => {
                debug!("Nothing to freeze: {}", e);
                self.abort_no_frame()?;
                Ok(Some(self.state()))
            }
        }
    }

    /// Writes the verified capture into `record` under this session's episode and
    /// returns to `Idle`.
    pub fn confirm(&mut self, record: &mut PatientRecord) -> Result<usize, SessionError> {
        let (frame, localization) = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Verified {
                frame,
                localization,
            } => (frame, localization),
            other => {
                self.state = other;
                return Err(self.invalid("confirm"));
            }
        };
        let frame_sequence = frame.sequence();
        record.commit_localization(self.episode, frame, localization);
        info!(
            "Episode {} localization committed from frame {}",
            self.episode, frame_sequence
        );
        self.emit(SessionChange::Confirmed { frame_sequence });
        Ok(self.episode)
    }

    /// Discards a verified or failed capture.
    pub fn retry(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Verified { .. } | SessionState::Failed { .. } => {}
            _ => return Err(self.invalid("retry")),
        }
        self.state = SessionState::Idle;
        debug!("Episode {} capture discarded for retry", self.episode);
        self.emit(SessionChange::Retried);
        Ok(())
    }

    /// Drops whatever is in flight. Valid from every state.
    pub fn reset(&mut self) {
        if matches!(self.state, SessionState::Idle) {
            return;
        }
        self.state = SessionState::Idle;
        self.emit(SessionChange::Reset);
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        debug!("Rejected {} in state {}", action, self.state());
        SessionError::InvalidTransition {
            action,
            state: self.state(),
        }
    }

    fn emit(&self, change: SessionChange) {
        // no subscribers is fine
        let _ = self.events.send(SessionEvent {
            session_id: self.id,
            episode: self.episode,
            state: self.state(),
            change,
            at: Utc::now(),
        });
    }
}
