use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Aggregate counters for one run. Counters only ever grow within a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub records_processed: u64,
    pub records_transformed: u64,
    pub records_skipped: u64,
    pub records_failed: u64,
    pub elapsed: Duration,
}

impl Statistics {
    /// Records processed per second of elapsed time.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.records_processed as f64 / secs
    }

    pub fn add_processed(&mut self, count: u64) {
        self.records_processed = self.records_processed.saturating_add(count);
    }

    pub fn add_transformed(&mut self, count: u64) {
        self.records_transformed = self.records_transformed.saturating_add(count);
    }

    pub fn add_skipped(&mut self, count: u64) {
        self.records_skipped = self.records_skipped.saturating_add(count);
    }

    pub fn add_failed(&mut self, count: u64) {
        self.records_failed = self.records_failed.saturating_add(count);
    }

    /// Elapsed time never moves backwards.
    pub fn observe_elapsed(&mut self, elapsed: Duration) {
        if elapsed > self.elapsed {
            self.elapsed = elapsed;
        }
    }
}
