use std::time::{Duration, Instant};

use image::RgbImage;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::app::annotation::annotate_verified;
use crate::app::notification::Notifier;
use crate::capture::{CaptureSession, PatientRecord, SessionEvent, SessionStateKind};
use crate::common::Frame;
use crate::config::Settings;
use crate::detection::SharedDetector;
use crate::error::AppError;
use crate::intake::{FrameHandle, FrameSource, SourceHealth, VideoInput};
use crate::tracking::{DetectionPass, DetectionTimings, LiveOverlay, LiveTracker, TrackerStats};

/// What the presentation layer renders while framing the shot.
pub struct PreviewFeed {
    pub frames: watch::Receiver<Option<Frame>>,
    pub overlay: watch::Receiver<LiveOverlay>,
}

/// The live localization step of the examination wizard.
///
/// Owns the frame source, the live tracker and the capture session of the current
/// pain episode. Commands come from the presentation thread, which also calls
/// [`LocalizationStep::tick`] to drive the countdown. Session events from every
/// episode go out on one channel.
pub struct LocalizationStep {
    source: FrameSource,
    frames: FrameHandle,
    tracker: LiveTracker,
    session: CaptureSession,
    detector: SharedDetector,
    notifier: Notifier,
    events: broadcast::Sender<SessionEvent>,
    countdown: Duration,
    verify_lock_timeout: Duration,
    annotate_verified: bool,
    annotated: Option<RgbImage>,
    source_lost: bool,
    active: bool,
}

impl LocalizationStep {
    /// Opens the video input and starts live tracking. An input that cannot be
    /// opened is reported before any capture session exists.
    pub fn enter(
        settings: &Settings,
        input: Box<dyn VideoInput>,
        detector: SharedDetector,
        episode: usize,
        notifier: Notifier,
    ) -> Result<Self, AppError> {
        let mut source = FrameSource::new(input, &settings.source);
        if let Err(e) = source.start() {
            notifier.error(format!("Video source unavailable: {}", e));
            return Err(e.into());
        }

        let frames = source.handle();
        let mut tracker = LiveTracker::new(frames.clone(), detector.clone(), settings);
        tracker.start();

        let (events, _) = broadcast::channel(settings.capture.event_buffer_size.max(1));
        let session =
            CaptureSession::with_events(episode, settings.capture.countdown(), events.clone());
        info!("Entered localization for pain {}", episode + 1);

        Ok(Self {
            source,
            frames,
            tracker,
            session,
            detector,
            notifier,
            events,
            countdown: settings.capture.countdown(),
            verify_lock_timeout: settings.detector.verify_lock_timeout(),
            annotate_verified: settings.capture.annotate_verified,
            annotated: None,
            source_lost: false,
            active: true,
        })
    }

    /// Advances the countdown; on expiry freezes and verifies synchronously.
    ///
    /// Fails with [`crate::error::SourceError::Unavailable`] once frame production
    /// has given up.
    pub fn tick(&mut self, now: Instant) -> Result<SessionStateKind, AppError> {
        self.check_source()?;
        let started = Instant::now();
        let Some(state) =
            self.session
                .poll(now, &self.frames, &self.detector, self.verify_lock_timeout)?
        else {
            return Ok(self.session.state());
        };

        match state {
            SessionStateKind::Verified => {
                self.tracker
                    .record_timing(DetectionPass::Verification, started.elapsed());
                if self.annotate_verified {
                    self.annotated = self
                        .session
                        .frozen_frame()
                        .zip(self.session.verified_result())
                        .map(|(frame, localization)| annotate_verified(frame, localization));
                }
                self.notifier
                    .success("Pain localized, confirm to save or retry");
            }
            SessionStateKind::Failed => {
                self.tracker
                    .record_timing(DetectionPass::Verification, started.elapsed());
                if let Some(reason) = self.session.failure_reason() {
                    self.notifier.warning(reason.message());
                }
            }
            SessionStateKind::Idle => self.notifier.warning("no frame available"),
            SessionStateKind::Timing | SessionStateKind::Frozen => {}
        }
        Ok(state)
    }

    pub fn start_timer(&mut self, now: Instant) -> Result<Instant, AppError> {
        self.check_source()?;
        let deadline = self.session.start_timer(now)?;
        self.annotated = None;
        Ok(deadline)
    }

    pub fn cancel_timer(&mut self) -> Result<(), AppError> {
        self.session.cancel_timer()?;
        Ok(())
    }

    /// Saves the verified capture into `record` under the current episode.
    pub fn confirm(&mut self, record: &mut PatientRecord) -> Result<usize, AppError> {
        let episode = self.session.confirm(record)?;
        self.annotated = None;
        self.notifier
            .success(format!("Localization saved for pain {}", episode + 1));
        Ok(episode)
    }

    pub fn retry(&mut self) -> Result<(), AppError> {
        self.session.retry()?;
        self.annotated = None;
        Ok(())
    }

    /// Switches to a new pain episode with a fresh session and a blank overlay.
    pub fn begin_episode(&mut self, episode: usize) {
        self.session.reset();
        self.session = CaptureSession::with_events(episode, self.countdown, self.events.clone());
        self.tracker.clear();
        self.annotated = None;
        debug!("Localization switched to pain {}", episode + 1);
    }

    pub fn preview(&self) -> PreviewFeed {
        PreviewFeed {
            frames: self.source.preview(),
            overlay: self.tracker.subscribe(),
        }
    }

    pub fn resize_preview(&self, width: u32, height: u32) {
        self.source.resize_hint(width, height);
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn source_health(&self) -> SourceHealth {
        self.frames.health()
    }

    /// Frozen frame with the verified points drawn, while the capture awaits confirmation.
    pub fn annotated_frame(&self) -> Option<&RgbImage> {
        self.annotated.as_ref()
    }

    pub fn overlay(&self) -> LiveOverlay {
        self.tracker.overlay()
    }

    pub fn tracker_stats(&self) -> TrackerStats {
        self.tracker.stats()
    }

    pub fn timings(&self) -> DetectionTimings {
        self.tracker.timings()
    }

    /// A dead source is terminal: the countdown is dropped so nothing stale gets
    /// frozen, and the operator hears about it once.
    fn check_source(&mut self) -> Result<(), AppError> {
        let Some(e) = self.frames.failure() else {
            return Ok(());
        };
        if !self.source_lost {
            self.source_lost = true;
            if self.session.state() == SessionStateKind::Timing {
                self.session.cancel_timer()?;
            }
            self.notifier.error(format!("Video source lost: {}", e));
        }
        Err(e.into())
    }

    /// Cancels the countdown, joins the tracker, then stops the source. Idempotent.
    pub fn leave(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.session.reset();
        self.tracker.stop();
        self.source.stop();
        self.annotated = None;
        info!("Left localization for pain {}", self.session.episode() + 1);
    }
}

impl Drop for LocalizationStep {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::notification::{Notification, NotificationLevel};
    use crate::common::Point2D;
    use crate::detection::{ColorLandmarkEstimator, ColorRegionSegmenter, Detector};
    use crate::error::SourceError;
    use crate::intake::MemoryInput;
    use crate::capture::SessionChange;
    use crate::testing::{
        FailingInput, landmark_config, patient_scene, patient_scene_marker_at, region_config,
    };

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.source.target_fps = 100;
        settings.source.poll_interval_ms = 1;
        settings.source.first_frame_timeout_ms = 1_000;
        settings.tracker.tracker_hz = 100;
        settings.detector.verify_lock_timeout_ms = 500;
        settings.capture.countdown_ms = 3_000;
        settings
    }

    fn color_detector() -> SharedDetector {
        SharedDetector::new(Detector::new(
            Box::new(ColorLandmarkEstimator::new(landmark_config())),
            Box::new(ColorRegionSegmenter::new(region_config())),
        ))
    }

    fn enter(scene: RgbImage, episode: usize, notifier: &Notifier) -> LocalizationStep {
        LocalizationStep::enter(
            &settings(),
            Box::new(MemoryInput::new(vec![scene])),
            color_detector(),
            episode,
            notifier.clone(),
        )
        .unwrap()
    }

    fn capture(step: &mut LocalizationStep) -> SessionStateKind {
        let now = Instant::now();
        step.start_timer(now).unwrap();
        step.tick(now + Duration::from_millis(3_000)).unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn unavailable_source_is_reported_before_any_session() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        let result = LocalizationStep::enter(
            &settings(),
            Box::new(MemoryInput::new(vec![])),
            color_detector(),
            0,
            notifier.clone(),
        );
        assert!(matches!(
            result,
            Err(AppError::Source(SourceError::Unavailable { .. }))
        ));
        let notes = drain(&mut rx);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, NotificationLevel::Error);
    }

    #[test]
    fn lost_source_stops_the_countdown_and_is_reported_once() {
        let notifier = Notifier::new(16);
        let mut rx = notifier.subscribe();
        let mut settings = settings();
        settings.source.target_fps = 10;
        settings.source.max_consecutive_errors = 3;
        let mut step = LocalizationStep::enter(
            &settings,
            Box::new(FailingInput::after(vec![patient_scene(true)])),
            color_detector(),
            0,
            notifier.clone(),
        )
        .unwrap();

        let now = Instant::now();
        step.start_timer(now).unwrap();
        let deadline = Instant::now() + Duration::from_secs(3);
        while step.source_health() == SourceHealth::Running && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(step.source_health(), SourceHealth::Failed { .. }));

        let result = step.tick(now + Duration::from_millis(3_000));
        assert!(matches!(
            result,
            Err(AppError::Source(SourceError::Unavailable { .. }))
        ));
        assert_eq!(step.session().state(), SessionStateKind::Idle);
        assert!(step.session().frozen_frame().is_none());
        assert!(step.start_timer(Instant::now()).is_err());
        assert!(step.tick(Instant::now()).is_err());

        let errors = drain(&mut rx)
            .into_iter()
            .filter(|note| note.level == NotificationLevel::Error)
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn event_subscription_survives_episode_switch() {
        let notifier = Notifier::new(8);
        let mut step = enter(patient_scene(true), 0, &notifier);
        let mut events = step.subscribe_events();

        step.begin_episode(1);
        step.start_timer(Instant::now()).unwrap();

        let event = events.try_recv().unwrap();
        assert_eq!(event.episode, 1);
        assert!(matches!(event.change, SessionChange::TimerStarted { .. }));
        assert_eq!(event.session_id, step.session().id());
    }

    #[test]
    fn verified_capture_is_annotated_and_confirmed_into_record() {
        let notifier = Notifier::new(8);
        let mut step = enter(patient_scene(true), 0, &notifier);
        let mut record = PatientRecord::new();

        assert_eq!(capture(&mut step), SessionStateKind::Verified);
        assert!(step.annotated_frame().is_some());
        assert_eq!(step.timings().get(DetectionPass::Verification).count, 1);

        assert_eq!(step.confirm(&mut record).unwrap(), 0);
        assert!(step.annotated_frame().is_none());
        assert_eq!(
            record.localization(0).unwrap().localization.marker,
            Point2D::new(80, 70)
        );
        step.leave();
        step.leave();
    }

    #[test]
    fn failed_capture_warns_with_reason() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        let mut step = enter(patient_scene(false), 0, &notifier);

        assert_eq!(capture(&mut step), SessionStateKind::Failed);
        let notes = drain(&mut rx);
        let last = notes.last().unwrap();
        assert_eq!(last.level, NotificationLevel::Warning);
        assert_eq!(last.message, "marker not detected");

        let mut record = PatientRecord::new();
        assert!(step.confirm(&mut record).is_err());
        step.retry().unwrap();
        assert_eq!(step.session().state(), SessionStateKind::Idle);
    }

    #[test]
    fn cancelled_countdown_never_freezes() {
        let notifier = Notifier::new(8);
        let mut step = enter(patient_scene(true), 0, &notifier);
        let now = Instant::now();
        step.start_timer(now).unwrap();
        step.cancel_timer().unwrap();
        assert_eq!(
            step.tick(now + Duration::from_secs(10)).unwrap(),
            SessionStateKind::Idle
        );
        assert!(step.session().frozen_frame().is_none());
    }

    #[tokio::test]
    async fn live_overlay_keeps_flowing_to_the_preview() {
        let notifier = Notifier::new(8);
        let step = enter(patient_scene(true), 0, &notifier);
        let mut preview = step.preview();

        tokio::time::timeout(
            Duration::from_secs(2),
            preview.overlay.wait_for(|overlay| overlay.detection.marker.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(preview.frames.borrow().is_some());
    }

    #[test]
    fn episodes_are_independent() {
        let notifier = Notifier::new(16);
        let mut record = PatientRecord::new();

        let mut step = enter(patient_scene(true), record.current_episode(), &notifier);
        assert_eq!(capture(&mut step), SessionStateKind::Verified);
        step.confirm(&mut record).unwrap();

        let next = record.begin_next_episode();
        let cleared_at = chrono::Utc::now();
        step.begin_episode(next);
        // the tracker may already have republished from the live feed, never from before the switch
        let overlay = step.overlay();
        assert_eq!(overlay.epoch, 1);
        assert!(overlay.published_at.map_or(true, |at| at >= cleared_at));
        assert_eq!(step.session().state(), SessionStateKind::Idle);
        assert!(step.session().verified_result().is_none());
        step.leave();

        let mut step = enter(patient_scene_marker_at((100, 90)), next, &notifier);
        assert_eq!(capture(&mut step), SessionStateKind::Verified);
        assert_eq!(step.confirm(&mut record).unwrap(), 1);

        assert_eq!(
            record.localization(0).unwrap().localization.marker,
            Point2D::new(80, 70)
        );
        assert_eq!(
            record.localization(1).unwrap().localization.marker,
            Point2D::new(100, 90)
        );
    }
}
