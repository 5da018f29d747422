use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Adds `delta` and returns the new value.
    pub fn add(&self, delta: u64) -> u64 {
        self.0.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn sub(&self, delta: u64) {
        self.0.fetch_sub(delta, Ordering::Relaxed);
    }

    /// Raises the gauge to `value` if it is currently lower.
    pub fn max(&self, value: u64) {
        let mut prev = self.0.load(Ordering::Relaxed);
        while value > prev {
            match self
                .0
                .compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct DurationAgg {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl DurationAgg {
    pub fn record(&self, dur: Duration) {
        let ns = dur.as_nanos().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);

        let mut prev = self.max_ns.load(Ordering::Relaxed);
        while ns > prev {
            match self
                .max_ns
                .compare_exchange_weak(prev, ns, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn snapshot(&self) -> DurationAggSnapshot {
        DurationAggSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_ns: self.total_ns.load(Ordering::Relaxed),
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DurationAggSnapshot {
    pub count: u64,
    pub total_ns: u64,
    pub max_ns: u64,
}

impl DurationAggSnapshot {
    pub fn avg_ns(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total_ns / self.count
        }
    }
}

pub struct ScopedTimer<'a> {
    start: Instant,
    agg: &'a DurationAgg,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(agg: &'a DurationAgg) -> Self {
        Self {
            start: Instant::now(),
            agg,
        }
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        self.agg.record(self.start.elapsed());
    }
}

/// Worker-local accumulator for per-task wall times.
///
/// Not thread-safe on purpose: each worker owns one and reports a summary
/// when it exits.
#[derive(Debug, Default)]
pub struct TaskStats {
    samples_ms: Vec<f64>,
}

impl TaskStats {
    pub fn record(&mut self, dur: Duration) {
        self.samples_ms.push(dur.as_secs_f64() * 1e3);
    }

    pub fn count(&self) -> usize {
        self.samples_ms.len()
    }

    pub fn total_ms(&self) -> f64 {
        self.samples_ms.iter().sum()
    }

    pub fn mean_ms(&self) -> f64 {
        if self.samples_ms.is_empty() {
            return 0.0;
        }
        self.total_ms() / self.samples_ms.len() as f64
    }

    pub fn stddev_ms(&self) -> f64 {
        if self.samples_ms.is_empty() {
            return 0.0;
        }
        let mean = self.mean_ms();
        let var = self
            .samples_ms
            .iter()
            .map(|t| (t - mean) * (t - mean))
            .sum::<f64>()
            / self.samples_ms.len() as f64;
        var.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_max_only_raises() {
        let g = Gauge::default();
        g.max(10);
        assert_eq!(g.get(), 10);
        g.max(4);
        assert_eq!(g.get(), 10);
        g.max(12);
        assert_eq!(g.get(), 12);
    }

    #[test]
    fn duration_agg_tracks_count_total_max() {
        let agg = DurationAgg::default();
        agg.record(Duration::from_millis(2));
        agg.record(Duration::from_millis(6));
        let snap = agg.snapshot();
        assert_eq!(snap.count, 2);
        assert!(snap.total_ns >= 8_000_000);
        assert!(snap.max_ns >= 6_000_000);
        assert!(snap.avg_ns() >= 4_000_000);
    }

    #[test]
    fn task_stats_mean_and_stddev() {
        let mut stats = TaskStats::default();
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        assert_eq!(stats.count(), 2);
        assert!((stats.mean_ms() - 20.0).abs() < 1.0);
        assert!((stats.stddev_ms() - 10.0).abs() < 1.0);
    }
}
