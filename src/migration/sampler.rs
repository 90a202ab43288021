//! Adaptive time-budget controller.
//!
//! The stepper sizes each migration transaction so the time spent holding
//! the write lock stays proportional to a fixed ceiling. A small ring of
//! (in-transaction, whole-transaction) duration pairs estimates how much of
//! a transaction's wall time is useful work; the next budget is that
//! fraction of the ceiling, shrinking automatically when commit/fsync
//! overhead grows.

use std::time::Duration;

/// Ceiling for the expected whole-transaction duration.
pub const MAX_EXPECTING_DURATION: Duration = Duration::from_millis(10);

/// Budget used until the ring holds a usable sample.
pub const INITIALIZE_DURATION: Duration = Duration::from_millis(5);

const SAMPLE_WINDOW: usize = 10;

#[derive(Clone, Copy, Debug, Default)]
struct Sample {
    within_transaction: Duration,
    whole_transaction: Duration,
}

impl Sample {
    fn is_valid(&self) -> bool {
        self.within_transaction > Duration::ZERO && self.whole_transaction > Duration::ZERO
    }
}

/// Fixed ring of duration pairs sizing the next transaction's in-transaction
/// budget.
#[derive(Debug)]
pub struct DurationSampler {
    samples: [Sample; SAMPLE_WINDOW],
    cursor: usize,
}

impl DurationSampler {
    pub fn new() -> Self {
        Self {
            samples: [Sample::default(); SAMPLE_WINDOW],
            cursor: 0,
        }
    }

    /// Record one completed transaction. Callers must not record degenerate
    /// samples: `whole > within > 0`.
    pub fn record(&mut self, within_transaction: Duration, whole_transaction: Duration) {
        debug_assert!(within_transaction > Duration::ZERO);
        debug_assert!(whole_transaction > within_transaction);
        debug_assert!(self.cursor < SAMPLE_WINDOW);

        self.samples[self.cursor] = Sample {
            within_transaction,
            whole_transaction,
        };
        self.cursor = (self.cursor + 1) % SAMPLE_WINDOW;
    }

    /// The in-transaction budget for the next transaction: the historical
    /// in-transaction fraction of wall time, scaled to the ceiling. Falls
    /// back to the initialization budget while the ring is empty or the
    /// arithmetic degenerates.
    pub fn next_budget(&self) -> Duration {
        let mut total_within = 0.0f64;
        let mut total_whole = 0.0f64;
        for sample in self.samples.iter().filter(|sample| sample.is_valid()) {
            total_within += sample.within_transaction.as_secs_f64();
            total_whole += sample.whole_transaction.as_secs_f64();
        }

        if total_whole == 0.0 {
            return INITIALIZE_DURATION;
        }

        let budget = MAX_EXPECTING_DURATION.as_secs_f64() * total_within / total_whole;
        // NaN compares false, so the positive check also rejects it.
        if !(budget > 0.0) || budget > MAX_EXPECTING_DURATION.as_secs_f64() {
            return INITIALIZE_DURATION;
        }
        Duration::from_secs_f64(budget)
    }
}

impl Default for DurationSampler {
    fn default() -> Self {
        Self::new()
    }
}
