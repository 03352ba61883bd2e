use std::path::PathBuf;
use std::time::{Duration, Instant};

use painloc::app::{LocalizationStep, Notifier};
use painloc::capture::{PatientRecord, SessionStateKind};
use painloc::config::Settings;
use painloc::detection::{ModelDirectory, SharedDetector};
use painloc::error::AppError;
use painloc::intake::input_for;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const MAX_ATTEMPTS: u32 = 5;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Headless run of one localization: countdown, capture, verify, and confirm on
/// success, retrying failed captures a few times.
#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref())?;
    init_logging(&settings.log_level);

    let models = ModelDirectory::new(&settings.detector.model_dir);
    let detector = SharedDetector::new(models.load_detector(&settings.detector)?);
    let notifier = Notifier::new(settings.capture.event_buffer_size);

    let mut record = PatientRecord::new();
    let mut step = LocalizationStep::enter(
        &settings,
        input_for(&settings.source),
        detector,
        record.current_episode(),
        notifier,
    )?;

    step.start_timer(Instant::now())?;
    let mut attempts = 1;
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                warn!("Interrupted, leaving localization");
                break;
            }
            _ = ticker.tick() => {
                let state = tokio::task::block_in_place(|| step.tick(Instant::now()))?;
                match state {
                    SessionStateKind::Verified => {
                        step.confirm(&mut record)?;
                        break;
                    }
                    SessionStateKind::Failed | SessionStateKind::Idle => {
                        if attempts >= MAX_ATTEMPTS {
                            warn!("No verified capture after {} attempts", attempts);
                            break;
                        }
                        if state == SessionStateKind::Failed {
                            step.retry()?;
                        }
                        attempts += 1;
                        step.start_timer(Instant::now())?;
                    }
                    SessionStateKind::Timing | SessionStateKind::Frozen => {}
                }
            }
        }
    }

    let stats = step.tracker_stats();
    step.leave();
    info!(
        "Live tracker ran {} cycles, published {}, yielded {}",
        stats.cycles, stats.published, stats.yielded
    );
    println!("{}", record.summary_json()?);
    Ok(())
}
