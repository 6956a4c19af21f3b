use crate::error::{Error, Result};
use crate::logger::unix_ms;
use crate::metrics::{counts_to_f64, percentile_series, SecondSeries, FAILED};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, error};

// =============================================================================
// Types
// =============================================================================

/// How a scenario consumes its item pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Every item exactly once.
    FixedCount,
    /// Items cycled until the wall-clock deadline passes.
    TimeBoxed(Duration),
}

impl RunMode {
    /// `None`/zero duration selects [`RunMode::FixedCount`].
    pub fn from_duration(duration: Option<Duration>) -> Self {
        match duration {
            Some(d) if !d.is_zero() => RunMode::TimeBoxed(d),
            _ => RunMode::FixedCount,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::FixedCount => write!(f, "fixed"),
            RunMode::TimeBoxed(d) => write!(f, "timed {}", humantime::format_duration(*d)),
        }
    }
}

/// What an operation reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub ok: bool,
    pub latency_ms: i64,
    pub resp_bytes: u64,
    pub error: Option<String>,
}

impl Outcome {
    pub fn success(latency_ms: i64, resp_bytes: u64) -> Self {
        Self {
            ok: true,
            latency_ms,
            resp_bytes,
            error: None,
        }
    }

    pub fn failure(latency_ms: i64, error: impl ToString) -> Self {
        Self {
            ok: false,
            latency_ms,
            resp_bytes: 0,
            error: Some(error.to_string()),
        }
    }
}

/// Per-call timeout handed to the operation. The runner never enforces it.
#[derive(Debug, Clone, Copy)]
pub struct OpContext {
    pub timeout: Duration,
    pub deadline: Instant,
}

impl OpContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Raw output of one runner invocation.
#[derive(Debug, Clone, Default)]
pub struct JobRun {
    pub workers: usize,
    pub success: u64,
    pub errors: u64,
    /// One entry per executed operation; [`FAILED`] marks failures.
    pub latencies: Vec<i64>,
    pub elapsed: Duration,
    pub series: Option<SecondSeries>,
}

// =============================================================================
// Runner
// =============================================================================

pub struct JobRunner {
    concurrency: usize,
    mode: RunMode,
    timeout: Duration,
}

impl JobRunner {
    pub fn new(concurrency: usize, mode: RunMode, timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            mode,
            timeout,
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Drives `work` over `item_count` indices with the configured mode.
    ///
    /// Failed outcomes are counted, never propagated. Only an empty item pool
    /// is an error.
    pub async fn run<F, Fut>(&self, item_count: usize, work: F) -> Result<JobRun>
    where
        F: Fn(usize, OpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        if item_count == 0 {
            return Err(Error::NoWorkItems);
        }
        let work = Arc::new(work);
        match self.mode {
            RunMode::FixedCount => Ok(self.run_fixed(item_count, work).await),
            RunMode::TimeBoxed(duration) => Ok(self.run_timed(item_count, duration, work).await),
        }
    }

    async fn run_fixed<F, Fut>(&self, item_count: usize, work: Arc<F>) -> JobRun
    where
        F: Fn(usize, OpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let workers = self.concurrency.min(item_count).max(1);
        debug!("fixed run: items={}, workers={}", item_count, workers);

        let latencies: Arc<Vec<AtomicI64>> =
            Arc::new((0..item_count).map(|_| AtomicI64::new(FAILED)).collect());
        let success = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));
        let (tx, rx) = async_channel::bounded::<usize>(workers);

        let start = Instant::now();
        let mut tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let rx = rx.clone();
            let work = Arc::clone(&work);
            let latencies = Arc::clone(&latencies);
            let success = Arc::clone(&success);
            let errors = Arc::clone(&errors);
            let timeout = self.timeout;
            tasks.push(tokio::spawn(async move {
                while let Ok(idx) = rx.recv().await {
                    let outcome = work(idx, OpContext::new(timeout)).await;
                    if outcome.ok {
                        latencies[idx].store(outcome.latency_ms.max(0), Ordering::Relaxed);
                        success.fetch_add(1, Ordering::Relaxed);
                    } else {
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }
        drop(rx);

        for idx in 0..item_count {
            if tx.send(idx).await.is_err() {
                error!("all workers exited with {} items undispatched", item_count - idx);
                break;
            }
        }
        tx.close();

        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("worker task failed: {}", e);
            }
        }

        JobRun {
            workers,
            success: success.load(Ordering::Relaxed),
            errors: errors.load(Ordering::Relaxed),
            latencies: latencies.iter().map(|l| l.load(Ordering::Relaxed)).collect(),
            elapsed: start.elapsed(),
            series: None,
        }
    }

    async fn run_timed<F, Fut>(&self, item_count: usize, duration: Duration, work: Arc<F>) -> JobRun
    where
        F: Fn(usize, OpContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let workers = self.concurrency;
        let bucket_count = (duration.as_secs_f64().ceil() as usize).max(1);
        debug!(
            "timed run: items={}, workers={}, buckets={}",
            item_count, workers, bucket_count
        );

        let buckets: Arc<Vec<Bucket>> =
            Arc::new((0..bucket_count).map(|_| Bucket::default()).collect());
        let next = Arc::new(AtomicUsize::new(0));
        let success = Arc::new(AtomicU64::new(0));
        let errors = Arc::new(AtomicU64::new(0));

        let start_ms = unix_ms(OffsetDateTime::now_utc());
        let start = Instant::now();
        let deadline = start + duration;

        let mut tasks = Vec::with_capacity(workers);
        for _ in 0..workers {
            let work = Arc::clone(&work);
            let buckets = Arc::clone(&buckets);
            let next = Arc::clone(&next);
            let success = Arc::clone(&success);
            let errors = Arc::clone(&errors);
            let timeout = self.timeout;
            tasks.push(tokio::spawn(async move {
                let mut local = Vec::new();
                while Instant::now() < deadline {
                    let idx = next.fetch_add(1, Ordering::Relaxed) % item_count;
                    let outcome = work(idx, OpContext::new(timeout)).await;

                    let sec = (start.elapsed().as_secs() as usize).min(bucket_count - 1);
                    let bucket = &buckets[sec];
                    if outcome.ok {
                        let latency = outcome.latency_ms.max(0);
                        bucket.record_success(latency);
                        success.fetch_add(1, Ordering::Relaxed);
                        local.push(latency);
                    } else {
                        bucket.err.fetch_add(1, Ordering::Relaxed);
                        errors.fetch_add(1, Ordering::Relaxed);
                        local.push(FAILED);
                    }
                }
                local
            }));
        }

        let mut latencies = Vec::new();
        for result in futures_util::future::join_all(tasks).await {
            match result {
                Ok(local) => latencies.extend(local),
                Err(e) => error!("worker task failed: {}", e),
            }
        }
        let elapsed = start.elapsed();

        let buckets = Arc::try_unwrap(buckets).unwrap_or_else(|shared| {
            shared.iter().map(Bucket::snapshot).collect()
        });
        let mut ok_counts = Vec::with_capacity(bucket_count);
        let mut err_counts = Vec::with_capacity(bucket_count);
        let mut samples = Vec::with_capacity(bucket_count);
        for bucket in buckets {
            ok_counts.push(bucket.ok.into_inner());
            err_counts.push(bucket.err.into_inner());
            samples.push(bucket.samples.into_inner().unwrap_or_else(|e| e.into_inner()));
        }
        let pct = percentile_series(samples);

        JobRun {
            workers,
            success: success.load(Ordering::Relaxed),
            errors: errors.load(Ordering::Relaxed),
            latencies,
            elapsed,
            series: Some(SecondSeries {
                start_ms,
                sec: (1..=bucket_count as u32).collect(),
                rps: counts_to_f64(&ok_counts),
                err: counts_to_f64(&err_counts),
                p50: pct.p50,
                p90: pct.p90,
                p95: pct.p95,
                p99: pct.p99,
            }),
        }
    }
}

/// One second of a time-boxed run.
#[derive(Default)]
struct Bucket {
    ok: AtomicU64,
    err: AtomicU64,
    samples: Mutex<Vec<i64>>,
}

impl Bucket {
    fn record_success(&self, latency: i64) {
        self.ok.fetch_add(1, Ordering::Relaxed);
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(latency);
    }

    fn snapshot(&self) -> Bucket {
        Bucket {
            ok: AtomicU64::new(self.ok.load(Ordering::Relaxed)),
            err: AtomicU64::new(self.err.load(Ordering::Relaxed)),
            samples: Mutex::new(self.samples.lock().unwrap_or_else(|e| e.into_inner()).clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn fixed_clamps_workers_and_visits_each_item_once() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let runner = JobRunner::new(50, RunMode::FixedCount, Duration::from_secs(1));
        let (f, p, s) = (in_flight.clone(), peak.clone(), seen.clone());
        let run = runner
            .run(37, move |idx, _ctx| {
                let (f, p, s) = (f.clone(), p.clone(), s.clone());
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    s.lock().unwrap().push(idx);
                    f.fetch_sub(1, Ordering::SeqCst);
                    Outcome::success(idx as i64, 0)
                }
            })
            .await
            .unwrap();

        assert_eq!(run.workers, 37);
        assert_eq!(run.success, 37);
        assert_eq!(run.errors, 0);
        assert_eq!(run.latencies.len(), 37);
        assert!(peak.load(Ordering::SeqCst) <= 37);
        let seen: HashSet<usize> = seen.lock().unwrap().iter().copied().collect();
        assert_eq!(seen.len(), 37);
        // latencies land at the item's own slot
        assert_eq!(run.latencies[12], 12);
    }

    #[tokio::test]
    async fn fixed_marks_failures_with_sentinel() {
        let runner = JobRunner::new(4, RunMode::FixedCount, Duration::from_secs(1));
        let run = runner
            .run(10, |idx, _ctx| async move {
                if idx % 2 == 0 {
                    Outcome::failure(3, "EOF")
                } else {
                    Outcome::success(7, 10)
                }
            })
            .await
            .unwrap();
        assert_eq!((run.success, run.errors), (5, 5));
        assert_eq!(run.latencies[0], FAILED);
        assert_eq!(run.latencies[1], 7);
        assert!(run.series.is_none());
    }

    #[tokio::test]
    async fn empty_pool_is_fatal() {
        let runner = JobRunner::new(4, RunMode::FixedCount, Duration::from_secs(1));
        let res = runner.run(0, |_, _| async { Outcome::success(1, 0) }).await;
        assert!(matches!(res, Err(Error::NoWorkItems)));
    }

    #[tokio::test]
    async fn timeout_reaches_the_operation() {
        let runner = JobRunner::new(1, RunMode::FixedCount, Duration::from_millis(750));
        let run = runner
            .run(1, |_, ctx| async move {
                assert_eq!(ctx.timeout, Duration::from_millis(750));
                assert!(ctx.remaining() <= ctx.timeout);
                Outcome::success(1, 0)
            })
            .await
            .unwrap();
        assert_eq!(run.success, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_run_fills_one_bucket_per_second() {
        let runner = JobRunner::new(
            4,
            RunMode::TimeBoxed(Duration::from_secs(3)),
            Duration::from_secs(1),
        );
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let run = runner
            .run(7, move |_idx, _ctx| {
                let c = c.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if c.fetch_add(1, Ordering::SeqCst) % 3 == 0 {
                        Outcome::failure(10, "connection reset by peer")
                    } else {
                        Outcome::success(10, 64)
                    }
                }
            })
            .await
            .unwrap();

        let series = run.series.expect("timed runs carry a series");
        assert_eq!(series.sec, vec![1, 2, 3]);
        assert_eq!(series.rps.len(), 3);
        assert_eq!(series.p99.len(), 3);
        assert_eq!(series.rps.iter().sum::<f64>() as u64, run.success);
        assert_eq!(series.err.iter().sum::<f64>() as u64, run.errors);
        assert_eq!(run.success + run.errors, 1200);
        assert_eq!(run.latencies.len(), 1200);
        assert!(series.p50.iter().all(|p| *p == 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_deadline_is_soft() {
        let runner = JobRunner::new(
            2,
            RunMode::TimeBoxed(Duration::from_secs(1)),
            Duration::from_secs(5),
        );
        let run = runner
            .run(3, |_, _| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Outcome::success(2000, 0)
            })
            .await
            .unwrap();
        // the in-flight call finishes past the deadline and lands in the last bucket
        assert_eq!(run.success, 2);
        assert!(run.elapsed >= Duration::from_secs(2));
        assert_eq!(run.series.unwrap().rps, vec![2.0]);
    }

    #[test]
    fn mode_from_duration() {
        assert_eq!(RunMode::from_duration(None), RunMode::FixedCount);
        assert_eq!(RunMode::from_duration(Some(Duration::ZERO)), RunMode::FixedCount);
        assert_eq!(
            RunMode::from_duration(Some(Duration::from_secs(3))),
            RunMode::TimeBoxed(Duration::from_secs(3))
        );
        assert_eq!(RunMode::TimeBoxed(Duration::from_secs(90)).to_string(), "timed 1m 30s");
    }
}
