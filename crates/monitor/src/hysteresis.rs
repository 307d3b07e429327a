use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadVerdict {
    Available,
    Busy,
}

/// Asymmetric load gate.
///
/// A single sample above `threshold` flips to `Busy`. Getting back to
/// `Available` needs the mean of the trailing window to be at or below
/// `threshold / 2`.
#[derive(Debug, Clone)]
pub struct LoadGate {
    window: VecDeque<f32>,
    size: usize,
    threshold: f32,
    verdict: LoadVerdict,
}

impl LoadGate {
    pub fn new(size: usize, threshold: f32) -> Self {
        let size = size.max(1);
        Self {
            window: VecDeque::with_capacity(size),
            size,
            threshold,
            verdict: LoadVerdict::Available,
        }
    }

    /// Feeds one reading; returns the verdict after it.
    pub fn record(&mut self, sample: f32) -> LoadVerdict {
        let sample = if sample.is_finite() { sample.clamp(0.0, 100.0) } else { 100.0 };
        if self.window.len() == self.size {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        match self.verdict {
            LoadVerdict::Available if sample > self.threshold => {
                self.verdict = LoadVerdict::Busy;
            }
            LoadVerdict::Busy if self.average() <= self.threshold / 2.0 => {
                self.verdict = LoadVerdict::Available;
            }
            _ => {}
        }
        self.verdict
    }

    /// A failed reading is counted as fully busy.
    pub fn record_failure(&mut self) -> LoadVerdict {
        self.record(100.0)
    }

    pub fn verdict(&self) -> LoadVerdict {
        self.verdict
    }

    pub fn average(&self) -> f32 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f32>() / self.window.len() as f32
    }

    pub fn last(&self) -> Option<f32> {
        self.window.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_spike_flips_to_busy() {
        let mut gate = LoadGate::new(10, 80.0);
        assert_eq!(gate.record(20.0), LoadVerdict::Available);
        assert_eq!(gate.record(81.0), LoadVerdict::Busy);
    }

    #[test]
    fn test_brief_dip_does_not_flip_back() {
        let mut gate = LoadGate::new(4, 80.0);
        gate.record(90.0);
        gate.record(90.0);
        gate.record(90.0);
        // Mean of [90, 90, 90, 10] is 70, still above 40.
        assert_eq!(gate.record(10.0), LoadVerdict::Busy);
        // [90, 90, 10, 90]
        assert_eq!(gate.record(90.0), LoadVerdict::Busy);
    }

    #[test]
    fn test_sustained_low_average_flips_back() {
        let mut gate = LoadGate::new(4, 80.0);
        gate.record(95.0);
        assert_eq!(gate.verdict(), LoadVerdict::Busy);
        gate.record(30.0);
        gate.record(30.0);
        gate.record(30.0);
        // [95, 30, 30, 30] -> 46.25
        assert_eq!(gate.verdict(), LoadVerdict::Busy);
        // [30, 30, 30, 30] -> 30
        assert_eq!(gate.record(30.0), LoadVerdict::Available);
    }

    #[test]
    fn test_value_between_half_and_threshold_holds_state() {
        let mut gate = LoadGate::new(3, 80.0);
        assert_eq!(gate.record(60.0), LoadVerdict::Available);
        gate.record(85.0);
        gate.record(60.0);
        gate.record(60.0);
        assert_eq!(gate.record(60.0), LoadVerdict::Busy);
    }

    #[test]
    fn test_failure_counts_as_full_load() {
        let mut gate = LoadGate::new(5, 80.0);
        assert_eq!(gate.record_failure(), LoadVerdict::Busy);
        assert_eq!(gate.last(), Some(100.0));
        assert_eq!(gate.record(f32::NAN), LoadVerdict::Busy);
    }
}
