//! Progress reporting for batch runs.
//!
//! A snapshot is sent after every item completion; consumers can compute
//! rate = done / elapsed_secs and ETA = (total - done) / rate.

/// Snapshot of batch progress (CLI-friendly).
#[derive(Debug, Clone)]
pub struct BatchProgress {
    /// Items finished so far, in any outcome.
    pub done: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Key of the item that just finished.
    pub last_key: String,
    /// Elapsed time since the batch started (seconds).
    pub elapsed_secs: f64,
}

impl BatchProgress {
    /// Items per second (0 if elapsed is 0).
    pub fn items_per_sec(&self) -> f64 {
        if self.elapsed_secs <= 0.0 {
            return 0.0;
        }
        self.done as f64 / self.elapsed_secs
    }

    /// Estimated seconds remaining (None if rate is 0).
    pub fn eta_secs(&self) -> Option<f64> {
        let remaining = self.total.saturating_sub(self.done);
        if remaining == 0 {
            return Some(0.0);
        }
        let rate = self.items_per_sec();
        if rate <= 0.0 {
            return None;
        }
        Some(remaining as f64 / rate)
    }

    /// Fraction complete in [0.0, 1.0].
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.done as f64 / self.total as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(done: usize, total: usize, elapsed_secs: f64) -> BatchProgress {
        BatchProgress {
            done,
            total,
            succeeded: done,
            failed: 0,
            last_key: String::new(),
            elapsed_secs,
        }
    }

    #[test]
    fn rate_eta_and_fraction() {
        let p = snapshot(5, 20, 10.0);
        assert!((p.items_per_sec() - 0.5).abs() < 1e-9);
        assert!((p.eta_secs().unwrap() - 30.0).abs() < 1e-9);
        assert!((p.fraction() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn degenerate_values() {
        assert_eq!(snapshot(0, 10, 0.0).eta_secs(), None);
        assert_eq!(snapshot(10, 10, 0.0).eta_secs(), Some(0.0));
        assert_eq!(snapshot(0, 0, 1.0).fraction(), 1.0);
    }
}
