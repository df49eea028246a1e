//! Per-block latency statistics.

use std::time::Duration;

use serde::Serialize;

/// Collects per-block processing times.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    samples: Vec<u64>,
    overruns: usize,
    budget_us: u64,
}

impl LatencyStats {
    /// Create a collector that counts blocks slower than `budget`.
    pub fn new(budget: Duration) -> Self {
        Self {
            samples: Vec::new(),
            overruns: 0,
            budget_us: duration_us(budget),
        }
    }

    /// Preallocate room for `blocks` samples so recording does not allocate.
    pub fn with_capacity(budget: Duration, blocks: usize) -> Self {
        Self {
            samples: Vec::with_capacity(blocks),
            ..Self::new(budget)
        }
    }

    /// Record one block's processing time.
    pub fn record(&mut self, elapsed: Duration) {
        let us = duration_us(elapsed);
        if self.budget_us > 0 && us > self.budget_us {
            self.overruns += 1;
        }
        self.samples.push(us);
    }

    /// Number of recorded blocks.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Blocks that took longer than the budget.
    pub fn overruns(&self) -> usize {
        self.overruns
    }

    /// Mean time in microseconds.
    pub fn mean_us(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    /// Median time in microseconds.
    pub fn p50_us(&self) -> u64 {
        self.percentile(50)
    }

    /// 99th percentile time in microseconds.
    pub fn p99_us(&self) -> u64 {
        self.percentile(99)
    }

    /// Nearest-rank percentile in microseconds.
    pub fn percentile(&self, p: usize) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = (p * sorted.len() / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Fastest block in microseconds.
    pub fn min_us(&self) -> u64 {
        self.samples.iter().copied().min().unwrap_or(0)
    }

    /// Slowest block in microseconds.
    pub fn max_us(&self) -> u64 {
        self.samples.iter().copied().max().unwrap_or(0)
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        format!(
            "n={} min={}us mean={:.1}us p50={}us p99={}us max={}us overruns={}",
            self.count(),
            self.min_us(),
            self.mean_us(),
            self.p50_us(),
            self.p99_us(),
            self.max_us(),
            self.overruns
        )
    }

    /// Snapshot for serialization.
    pub fn report(&self) -> LatencyReport {
        LatencyReport {
            blocks: self.count(),
            budget_us: self.budget_us,
            min_us: self.min_us(),
            mean_us: self.mean_us(),
            p50_us: self.p50_us(),
            p99_us: self.p99_us(),
            max_us: self.max_us(),
            overruns: self.overruns,
        }
    }
}

/// Serializable latency summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    /// Blocks measured
    pub blocks: usize,
    /// Per-block deadline
    pub budget_us: u64,
    /// Fastest block
    pub min_us: u64,
    /// Mean block time
    pub mean_us: f64,
    /// Median block time
    pub p50_us: u64,
    /// 99th percentile block time
    pub p99_us: u64,
    /// Slowest block
    pub max_us: u64,
    /// Blocks over the deadline
    pub overruns: usize,
}

fn duration_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
