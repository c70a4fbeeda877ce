//! Aggregate request statistics reported at shutdown.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::worker::RequestCounters;

/// Totals folded from worker reports plus active-worker samples.
#[derive(Debug, Default)]
pub struct Stats {
    totals: RequestCounters,
    /// Active worker count → number of samples with that count.
    active_samples: BTreeMap<usize, u64>,
    sample_sum: u64,
    sample_count: u64,
    started: Option<Instant>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fold(&mut self, counters: &RequestCounters) {
        self.totals.merge(counters);
    }

    /// Record how many workers were busy. The clock starts with the first sample.
    pub fn sample(&mut self, active_workers: usize) {
        self.started.get_or_insert_with(Instant::now);
        *self.active_samples.entry(active_workers).or_default() += 1;
        self.sample_sum += active_workers as u64;
        self.sample_count += 1;
    }

    pub fn totals(&self) -> RequestCounters {
        self.totals
    }

    /// `None` if no client ever became ready.
    pub fn summary(&self) -> Option<Summary> {
        let started = self.started?;
        let average_active = if self.sample_count == 0 {
            0.0
        } else {
            self.sample_sum as f64 / self.sample_count as f64
        };
        // ties go to the smaller count
        let modal_active = self
            .active_samples
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(active, _)| *active)
            .unwrap_or_default();
        let completion_ratio = if self.totals.session == 0 {
            0.0
        } else {
            self.totals.complete as f64 / self.totals.session as f64
        };

        Some(Summary {
            elapsed: started.elapsed(),
            average_active,
            modal_active,
            completion_ratio,
            totals: self.totals,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub elapsed: Duration,
    pub average_active: f64,
    pub modal_active: usize,
    pub completion_ratio: f64,
    pub totals: RequestCounters,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "elapsed {:.3}s, average active workers {:.2}, modal active workers {}, \
             completed/total {:.3}, completed {}, total {}, failed read {}",
            self.elapsed.as_secs_f64(),
            self.average_active,
            self.modal_active,
            self.completion_ratio,
            self.totals.complete,
            self.totals.session,
            self.totals.failed_read
        )
    }
}
