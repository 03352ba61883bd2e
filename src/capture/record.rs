use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::capture::session::VerifiedLocalization;
use crate::common::Frame;

/// A confirmed localization: the frozen frame and the points verified on it.
#[derive(Debug, Clone, Serialize)]
pub struct LocalizationEntry {
    #[serde(skip)]
    pub frame: Frame,
    pub frame_sequence: u64,
    pub frame_size: (u32, u32),
    pub localization: VerifiedLocalization,
    pub committed_at: DateTime<Utc>,
}

/// Caller-owned record of the examination, keyed by pain episode.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatientRecord {
    pain_count: usize,
    localizations: IndexMap<usize, LocalizationEntry>,
}

impl PatientRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the pain episode currently being recorded.
    pub fn current_episode(&self) -> usize {
        self.pain_count
    }

    /// The operator reported another pain.
    pub fn begin_next_episode(&mut self) -> usize {
        self.pain_count += 1;
        self.pain_count
    }

    /// Stores the localization for `episode`, replacing a previous one.
    pub fn commit_localization(
        &mut self,
        episode: usize,
        frame: Frame,
        localization: VerifiedLocalization,
    ) -> Option<LocalizationEntry> {
        let entry = LocalizationEntry {
            frame_sequence: frame.sequence(),
            frame_size: frame.dimensions(),
            frame,
            localization,
            committed_at: Utc::now(),
        };
        self.localizations.insert(episode, entry)
    }

    pub fn localization(&self, episode: usize) -> Option<&LocalizationEntry> {
        self.localizations.get(&episode)
    }

    pub fn localizations(&self) -> impl Iterator<Item = (usize, &LocalizationEntry)> {
        self.localizations.iter().map(|(episode, entry)| (*episode, entry))
    }

    pub fn summary_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
