use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Latency value recorded for an operation that failed.
pub const FAILED: i64 = -1;

/// Whole-run latency statistics in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyStats {
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Per-bucket percentile columns, one entry per bucket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PercentileSeries {
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
    pub p95: Vec<f64>,
    pub p99: Vec<f64>,
}

/// Per-second series attached to a time-boxed [`RunResult`].
///
/// All vectors are parallel: index `i` describes second `sec[i]` (1-based)
/// counted from `start_ms`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecondSeries {
    pub start_ms: i64,
    pub sec: Vec<u32>,
    /// Successful operations completed in each second.
    pub rps: Vec<f64>,
    /// Failed operations completed in each second.
    pub err: Vec<f64>,
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
    pub p95: Vec<f64>,
    pub p99: Vec<f64>,
}

/// Outcome of one (config, mode, concurrency) scenario.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub config: String,
    #[serde(default)]
    pub targets: String,
    pub mode: String,
    pub concurrency: usize,
    pub total: u64,
    pub success: u64,
    pub errors: u64,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub rps: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<SecondSeries>,
}

impl RunResult {
    /// Fills the latency statistics and derives RPS from `duration`.
    pub fn apply_metrics(&mut self, latencies: &[i64]) {
        let stats = compute_metrics(latencies, self.success);
        self.avg_ms = stats.avg;
        self.p50_ms = stats.p50;
        self.p90_ms = stats.p90;
        self.p95_ms = stats.p95;
        self.p99_ms = stats.p99;
        self.max_ms = stats.max;
        if !self.duration.is_zero() {
            self.rps = self.success as f64 / self.duration.as_secs_f64();
        }
    }

    pub fn stats(&self) -> LatencyStats {
        LatencyStats {
            avg: self.avg_ms,
            p50: self.p50_ms,
            p90: self.p90_ms,
            p95: self.p95_ms,
            p99: self.p99_ms,
            max: self.max_ms,
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode={} conc={} ok={} err={} rps={:.2} p95={:.1}ms",
            self.mode, self.concurrency, self.success, self.errors, self.rps, self.p95_ms
        )?;
        if !self.targets.is_empty() {
            write!(f, " targets={}", self.targets)?;
        }
        Ok(())
    }
}

/// Computes avg/p50/p90/p95/p99/max over the successful samples in `latencies`.
///
/// Samples below zero mark failures and are skipped. With no successful
/// samples every statistic is zero.
pub fn compute_metrics(latencies: &[i64], success_count: u64) -> LatencyStats {
    if success_count == 0 {
        return LatencyStats::default();
    }
    let mut vals: Vec<i64> = latencies.iter().copied().filter(|d| *d >= 0).collect();
    if vals.is_empty() {
        return LatencyStats::default();
    }
    vals.sort_unstable();

    let sum: i64 = vals.iter().sum();
    LatencyStats {
        avg: sum as f64 / vals.len() as f64,
        p50: percentile(&vals, 50.0),
        p90: percentile(&vals, 90.0),
        p95: percentile(&vals, 95.0),
        p99: percentile(&vals, 99.0),
        max: vals[vals.len() - 1] as f64,
    }
}

/// Nearest-rank percentile of an ascending slice: the value at
/// `ceil(p/100 * n) - 1`, clamped into `[0, n-1]`.
pub fn percentile(sorted: &[i64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as i64 - 1;
    let idx = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[idx] as f64
}

/// Applies [`percentile`] to every bucket independently. Empty buckets yield zeros.
pub fn percentile_series(mut buckets: Vec<Vec<i64>>) -> PercentileSeries {
    let n = buckets.len();
    let mut out = PercentileSeries {
        p50: vec![0.0; n],
        p90: vec![0.0; n],
        p95: vec![0.0; n],
        p99: vec![0.0; n],
    };
    for (i, bucket) in buckets.iter_mut().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        bucket.sort_unstable();
        out.p50[i] = percentile(bucket, 50.0);
        out.p90[i] = percentile(bucket, 90.0);
        out.p95[i] = percentile(bucket, 95.0);
        out.p99[i] = percentile(bucket, 99.0);
    }
    out
}

pub(crate) fn counts_to_f64(counts: &[u64]) -> Vec<f64> {
    counts.iter().map(|c| *c as f64).collect()
}

mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}
