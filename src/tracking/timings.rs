use std::time::Duration;

use indexmap::IndexMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionPass {
    Shoulders,
    Marker,
    Verification,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub count: u64,
    pub total: Duration,
    pub last: Duration,
    pub max: Duration,
}

impl PassStats {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total / self.count as u32
    }
}

/// Accumulated wall time per detection pass, in first-recorded order.
#[derive(Debug, Clone, Default)]
pub struct DetectionTimings {
    passes: IndexMap<DetectionPass, PassStats>,
}

impl DetectionTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, pass: DetectionPass, duration: Duration) {
        let stats = self.passes.entry(pass).or_default();
        stats.count += 1;
        stats.total += duration;
        stats.last = duration;
        stats.max = stats.max.max(duration);
    }

    pub fn get(&self, pass: DetectionPass) -> PassStats {
        self.passes.get(&pass).copied().unwrap_or_default()
    }

    pub fn passes(&self) -> &IndexMap<DetectionPass, PassStats> {
        &self.passes
    }

    pub fn reset(&mut self) {
        self.passes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_pass() {
        let mut timings = DetectionTimings::new();
        timings.record(DetectionPass::Marker, Duration::from_millis(4));
        timings.record(DetectionPass::Shoulders, Duration::from_millis(10));
        timings.record(DetectionPass::Shoulders, Duration::from_millis(20));

        let shoulders = timings.get(DetectionPass::Shoulders);
        assert_eq!(shoulders.count, 2);
        assert_eq!(shoulders.last, Duration::from_millis(20));
        assert_eq!(shoulders.max, Duration::from_millis(20));
        assert_eq!(shoulders.average(), Duration::from_millis(15));
        assert_eq!(
            timings.passes().keys().copied().collect::<Vec<_>>(),
            vec![DetectionPass::Marker, DetectionPass::Shoulders]
        );
        assert_eq!(timings.get(DetectionPass::Verification), PassStats::default());
    }
}
