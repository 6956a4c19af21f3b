//! Report synthesis.
//!
//! Everything here is a pure function of the run results and the request log,
//! so a report rebuilt later from persisted artifacts matches the one produced
//! right after the run. Maps are ordered and every sort has a total key, which
//! keeps repeated output byte-identical.

use crate::logger::{unix_ms, LogEntry};
use crate::metrics::{counts_to_f64, percentile_series, RunResult, SecondSeries};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

// =============================================================================
// Error taxonomy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Timeout,
    UnknownQuery,
    ConnReset,
    BrokenPipe,
    Eof,
    Canceled,
    NotFound,
    Other,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::UnknownQuery => "unknown_query",
            ErrorCode::ConnReset => "conn_reset",
            ErrorCode::BrokenPipe => "broken_pipe",
            ErrorCode::Eof => "eof",
            ErrorCode::Canceled => "canceled",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Other => "other",
            ErrorCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialOrd for ErrorCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ordered by name so maps and sorted output read alphabetically
impl Ord for ErrorCode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

/// Maps an error message onto the fixed taxonomy. First match wins.
pub fn classify_error(message: &str) -> ErrorCode {
    let v = message.trim().to_lowercase();
    if v.is_empty() {
        ErrorCode::Unknown
    } else if v.contains("context deadline exceeded")
        || v.contains("deadline has elapsed")
        || v.contains("timeout")
        || v.contains("timed out")
    {
        ErrorCode::Timeout
    } else if v.contains("unknown query") {
        ErrorCode::UnknownQuery
    } else if v.contains("connection reset") {
        ErrorCode::ConnReset
    } else if v.contains("broken pipe") {
        ErrorCode::BrokenPipe
    } else if v.contains("eof") {
        ErrorCode::Eof
    } else if v.contains("canceled") || v.contains("cancelled") {
        ErrorCode::Canceled
    } else if v.contains("not found") {
        ErrorCode::NotFound
    } else {
        ErrorCode::Other
    }
}

// =============================================================================
// Series types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MethodKey {
    pub config: String,
    pub mode: String,
    pub concurrency: usize,
    pub method: String,
}

impl From<&LogEntry> for MethodKey {
    fn from(e: &LogEntry) -> Self {
        Self {
            config: e.config.clone(),
            mode: e.mode.clone(),
            concurrency: e.concurrency,
            method: e.request.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodSeries {
    pub start_ms: i64,
    pub sec: Vec<u32>,
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
    pub p95: Vec<f64>,
    pub p99: Vec<f64>,
    pub ok: Vec<f64>,
    pub err: Vec<f64>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSeriesEntry {
    pub config: String,
    pub mode: String,
    pub concurrency: usize,
    pub method: String,
    pub sec: Vec<u32>,
    pub p50: Vec<f64>,
    pub p90: Vec<f64>,
    pub p95: Vec<f64>,
    pub p99: Vec<f64>,
    pub ok: Vec<f64>,
    pub err: Vec<f64>,
    pub total: u64,
    pub start_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ErrorSeriesKey {
    pub config: String,
    pub mode: String,
    pub concurrency: usize,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorSeries {
    pub start_ms: i64,
    pub sec: Vec<u32>,
    pub cnt: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSeriesEntry {
    pub config: String,
    pub mode: String,
    pub concurrency: usize,
    pub code: ErrorCode,
    pub start_ms: i64,
    pub sec: Vec<u32>,
    pub cnt: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummaryEntry {
    pub config: String,
    pub mode: String,
    pub concurrency: usize,
    pub request: String,
    pub code: ErrorCode,
    pub error: String,
    pub count: u64,
}

/// Per-method totals over a whole scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSummaryRow {
    pub config: String,
    pub mode: String,
    pub concurrency: usize,
    pub method: String,
    pub total: u64,
    pub ok: u64,
    pub err: u64,
    pub avg_rps: f64,
}

/// One config's figures next to the best config at the same mode/concurrency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub mode: String,
    pub concurrency: usize,
    pub config: String,
    pub rps: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    /// Percent versus the highest RPS in the group.
    pub rps_delta_pct: f64,
    /// Percent versus the lowest average latency in the group.
    pub avg_delta_pct: f64,
}

/// Everything the rendering layer consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    /// RFC 3339 stamp set when the payload is written out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    pub max_points: usize,
    pub results: Vec<RunResult>,
    pub methods: Vec<MethodSeriesEntry>,
    pub errors: Vec<ErrorSeriesEntry>,
    pub error_summary: Vec<ErrorSummaryEntry>,
    pub method_summary: Vec<MethodSummaryRow>,
    pub comparisons: Vec<ComparisonRow>,
}

// =============================================================================
// Bucketing
// =============================================================================

/// Whole-second buckets from the first to the last timestamp of a group.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: OffsetDateTime,
    len: usize,
}

impl Span {
    fn index(&self, ts: OffsetDateTime) -> usize {
        let secs = (ts - self.start).whole_seconds().max(0) as usize;
        secs.min(self.len - 1)
    }
}

fn spans<K: Ord>(items: impl Iterator<Item = (K, OffsetDateTime)>) -> BTreeMap<K, Span> {
    let mut bounds: BTreeMap<K, (OffsetDateTime, OffsetDateTime)> = BTreeMap::new();
    for (key, ts) in items {
        bounds
            .entry(key)
            .and_modify(|(min, max)| {
                if ts < *min {
                    *min = ts;
                }
                if ts > *max {
                    *max = ts;
                }
            })
            .or_insert((ts, ts));
    }
    bounds
        .into_iter()
        .map(|(key, (min, max))| {
            let len = (max - min).whole_seconds().max(0) as usize + 1;
            (key, Span { start: min, len })
        })
        .collect()
}

fn seconds(len: usize) -> Vec<u32> {
    (1..=len as u32).collect()
}

// =============================================================================
// Builders
// =============================================================================

/// Per (config, mode, concurrency, method) second-by-second series.
pub fn build_method_series(entries: &[LogEntry]) -> BTreeMap<MethodKey, MethodSeries> {
    struct Agg {
        span: Span,
        samples: Vec<Vec<i64>>,
        ok: Vec<u64>,
        err: Vec<u64>,
        total: u64,
    }

    let keyed = entries.iter().map(|e| (MethodKey::from(e), e.ts));
    let mut aggs: BTreeMap<MethodKey, Agg> = spans(keyed)
        .into_iter()
        .map(|(key, span)| {
            let agg = Agg {
                span,
                samples: vec![Vec::new(); span.len],
                ok: vec![0; span.len],
                err: vec![0; span.len],
                total: 0,
            };
            (key, agg)
        })
        .collect();

    for e in entries {
        let Some(agg) = aggs.get_mut(&MethodKey::from(e)) else {
            continue;
        };
        let idx = agg.span.index(e.ts);
        agg.total += 1;
        if e.ok {
            agg.ok[idx] += 1;
            agg.samples[idx].push(e.latency_ms);
        } else {
            agg.err[idx] += 1;
        }
    }

    aggs.into_iter()
        .map(|(key, agg)| {
            let pct = percentile_series(agg.samples);
            let series = MethodSeries {
                start_ms: unix_ms(agg.span.start),
                sec: seconds(agg.span.len),
                p50: pct.p50,
                p90: pct.p90,
                p95: pct.p95,
                p99: pct.p99,
                ok: counts_to_f64(&agg.ok),
                err: counts_to_f64(&agg.err),
                total: agg.total,
            };
            (key, series)
        })
        .collect()
}

fn error_series_key(e: &LogEntry) -> ErrorSeriesKey {
    ErrorSeriesKey {
        config: e.config.clone(),
        mode: e.mode.clone(),
        concurrency: e.concurrency,
        code: classify_error(e.error.as_deref().unwrap_or_default()),
    }
}

/// Per (config, mode, concurrency, error code) failure counts per second.
pub fn build_error_series(entries: &[LogEntry]) -> BTreeMap<ErrorSeriesKey, ErrorSeries> {
    let failed = || entries.iter().filter(|e| !e.ok);

    let mut aggs: BTreeMap<ErrorSeriesKey, (Span, Vec<u64>)> =
        spans(failed().map(|e| (error_series_key(e), e.ts)))
            .into_iter()
            .map(|(key, span)| (key, (span, vec![0; span.len])))
            .collect();

    for e in failed() {
        if let Some((span, cnt)) = aggs.get_mut(&error_series_key(e)) {
            cnt[span.index(e.ts)] += 1;
        }
    }

    aggs.into_iter()
        .map(|(key, (span, cnt))| {
            let series = ErrorSeries {
                start_ms: unix_ms(span.start),
                sec: seconds(span.len),
                cnt: counts_to_f64(&cnt),
            };
            (key, series)
        })
        .collect()
}

/// Failure counts per (config, mode, concurrency, request, code, message),
/// most frequent first.
pub fn build_error_summary(entries: &[LogEntry]) -> Vec<ErrorSummaryEntry> {
    let mut counts: BTreeMap<(String, String, usize, String, ErrorCode, String), u64> =
        BTreeMap::new();
    for e in entries.iter().filter(|e| !e.ok) {
        let message = e.error.clone().unwrap_or_default();
        let key = (
            e.config.clone(),
            e.mode.clone(),
            e.concurrency,
            e.request.clone(),
            classify_error(&message),
            message,
        );
        *counts.entry(key).or_default() += 1;
    }

    let mut out: Vec<ErrorSummaryEntry> = counts
        .into_iter()
        .map(|((config, mode, concurrency, request, code, error), count)| ErrorSummaryEntry {
            config,
            mode,
            concurrency,
            request,
            code,
            error,
            count,
        })
        .collect();
    out.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.config.cmp(&b.config))
            .then_with(|| a.mode.cmp(&b.mode))
            .then_with(|| a.concurrency.cmp(&b.concurrency))
            .then_with(|| a.request.cmp(&b.request))
            .then_with(|| a.code.cmp(&b.code))
            .then_with(|| a.error.cmp(&b.error))
    });
    out
}

pub fn method_summary(methods: &BTreeMap<MethodKey, MethodSeries>) -> Vec<MethodSummaryRow> {
    let mut rows: Vec<MethodSummaryRow> = methods
        .iter()
        .map(|(key, series)| {
            let ok = series.ok.iter().sum::<f64>() as u64;
            let err = series.err.iter().sum::<f64>() as u64;
            let total = if series.total > 0 { series.total } else { ok + err };
            let secs = series.ok.len().max(1);
            MethodSummaryRow {
                config: key.config.clone(),
                mode: key.mode.clone(),
                concurrency: key.concurrency,
                method: key.method.clone(),
                total,
                ok,
                err,
                avg_rps: total as f64 / secs as f64,
            }
        })
        .collect();
    rows.sort_by(|a, b| {
        a.config
            .cmp(&b.config)
            .then_with(|| a.mode.cmp(&b.mode))
            .then_with(|| a.concurrency.cmp(&b.concurrency))
            .then_with(|| a.method.cmp(&b.method))
    });
    rows
}

fn percent_delta(v: f64, best: f64) -> f64 {
    if best == 0.0 {
        return 0.0;
    }
    (v / best - 1.0) * 100.0
}

/// Side-by-side rows for every mode/concurrency measured on two or more configs.
pub fn compare_configs(results: &[RunResult]) -> Vec<ComparisonRow> {
    let mut groups: BTreeMap<(String, usize), Vec<&RunResult>> = BTreeMap::new();
    for r in results {
        groups.entry((r.mode.clone(), r.concurrency)).or_default().push(r);
    }

    let mut rows = Vec::new();
    for ((mode, concurrency), mut list) in groups {
        if list.len() < 2 {
            continue;
        }
        list.sort_by(|a, b| a.config.cmp(&b.config));
        let best_rps = list.iter().map(|r| r.rps).fold(f64::MIN, f64::max);
        let best_avg = list.iter().map(|r| r.avg_ms).fold(f64::MAX, f64::min);
        for r in list {
            rows.push(ComparisonRow {
                mode: mode.clone(),
                concurrency,
                config: r.config.clone(),
                rps: r.rps,
                avg_ms: r.avg_ms,
                p50_ms: r.p50_ms,
                rps_delta_pct: percent_delta(r.rps, best_rps),
                avg_delta_pct: percent_delta(r.avg_ms, best_avg),
            });
        }
    }
    rows
}

// =============================================================================
// Downsampling
// =============================================================================

/// Indices kept when reducing `n` points to at most `max_points` (+1 for the
/// forced last point). `max_points == 0` or `n <= max_points` keeps everything.
pub fn sample_indices(n: usize, max_points: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    if max_points == 0 || n <= max_points {
        return (0..n).collect();
    }
    let step = n.div_ceil(max_points).max(1);
    let mut idxs: Vec<usize> = (0..n).step_by(step).collect();
    if idxs.last() != Some(&(n - 1)) {
        idxs.push(n - 1);
    }
    idxs
}

/// Picks `idxs` out of `src`, ignoring indices past its end.
pub fn sample<T: Copy>(src: &[T], idxs: &[usize]) -> Vec<T> {
    idxs.iter().filter_map(|i| src.get(*i).copied()).collect()
}

/// Reduces every parallel column of a series with one shared index selection.
pub trait Downsample {
    fn len(&self) -> usize;

    fn retain_indices(&mut self, idxs: &[usize]);

    fn downsample(&mut self, max_points: usize) {
        let n = self.len();
        if max_points == 0 || n == 0 || n <= max_points {
            return;
        }
        let idxs = sample_indices(n, max_points);
        self.retain_indices(&idxs);
    }
}

impl Downsample for SecondSeries {
    fn len(&self) -> usize {
        self.sec.len()
    }

    fn retain_indices(&mut self, idxs: &[usize]) {
        self.sec = sample(&self.sec, idxs);
        self.rps = sample(&self.rps, idxs);
        self.err = sample(&self.err, idxs);
        self.p50 = sample(&self.p50, idxs);
        self.p90 = sample(&self.p90, idxs);
        self.p95 = sample(&self.p95, idxs);
        self.p99 = sample(&self.p99, idxs);
    }
}

impl Downsample for MethodSeries {
    fn len(&self) -> usize {
        self.sec.len()
    }

    fn retain_indices(&mut self, idxs: &[usize]) {
        self.sec = sample(&self.sec, idxs);
        self.p50 = sample(&self.p50, idxs);
        self.p90 = sample(&self.p90, idxs);
        self.p95 = sample(&self.p95, idxs);
        self.p99 = sample(&self.p99, idxs);
        self.ok = sample(&self.ok, idxs);
        self.err = sample(&self.err, idxs);
    }
}

impl Downsample for ErrorSeries {
    fn len(&self) -> usize {
        self.sec.len()
    }

    fn retain_indices(&mut self, idxs: &[usize]) {
        self.sec = sample(&self.sec, idxs);
        self.cnt = sample(&self.cnt, idxs);
    }
}

// =============================================================================
// Flattening
// =============================================================================

pub fn flatten_method_series(methods: BTreeMap<MethodKey, MethodSeries>) -> Vec<MethodSeriesEntry> {
    let mut out: Vec<MethodSeriesEntry> = methods
        .into_iter()
        .map(|(k, v)| MethodSeriesEntry {
            config: k.config,
            mode: k.mode,
            concurrency: k.concurrency,
            method: k.method,
            sec: v.sec,
            p50: v.p50,
            p90: v.p90,
            p95: v.p95,
            p99: v.p99,
            ok: v.ok,
            err: v.err,
            total: v.total,
            start_ms: v.start_ms,
        })
        .collect();
    out.sort_by(|a, b| {
        a.mode
            .cmp(&b.mode)
            .then_with(|| a.config.cmp(&b.config))
            .then_with(|| a.concurrency.cmp(&b.concurrency))
            .then_with(|| a.method.cmp(&b.method))
    });
    out
}

pub fn flatten_error_series(
    errors: BTreeMap<ErrorSeriesKey, ErrorSeries>,
) -> Vec<ErrorSeriesEntry> {
    let mut out: Vec<ErrorSeriesEntry> = errors
        .into_iter()
        .map(|(k, v)| ErrorSeriesEntry {
            config: k.config,
            mode: k.mode,
            concurrency: k.concurrency,
            code: k.code,
            start_ms: v.start_ms,
            sec: v.sec,
            cnt: v.cnt,
        })
        .collect();
    out.sort_by(|a, b| {
        a.mode
            .cmp(&b.mode)
            .then_with(|| a.config.cmp(&b.config))
            .then_with(|| a.concurrency.cmp(&b.concurrency))
            .then_with(|| a.code.cmp(&b.code))
    });
    out
}

// =============================================================================
// Synthesizer
// =============================================================================

/// Builds the report payload from run results and, when available, the request log.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportSynthesizer {
    max_points: usize,
}

impl ReportSynthesizer {
    /// `max_points == 0` disables downsampling.
    pub fn new(max_points: usize) -> Self {
        Self { max_points }
    }

    pub fn synthesize(&self, results: &[RunResult], entries: Option<&[LogEntry]>) -> ReportPayload {
        let mut results = results.to_vec();
        for series in results.iter_mut().filter_map(|r| r.series.as_mut()) {
            series.downsample(self.max_points);
        }
        let comparisons = compare_configs(&results);

        let (methods, errors, error_summary, method_rows) = match entries {
            Some(entries) => {
                let mut methods = build_method_series(entries);
                let method_rows = method_summary(&methods);
                for series in methods.values_mut() {
                    series.downsample(self.max_points);
                }
                let mut errors = build_error_series(entries);
                for series in errors.values_mut() {
                    series.downsample(self.max_points);
                }
                (
                    flatten_method_series(methods),
                    flatten_error_series(errors),
                    build_error_summary(entries),
                    method_rows,
                )
            }
            None => Default::default(),
        };

        ReportPayload {
            generated_at: None,
            max_points: self.max_points,
            results,
            methods,
            errors,
            error_summary,
            method_summary: method_rows,
            comparisons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use time::macros::datetime;

    fn log(
        ms: u64,
        config: &str,
        request: &str,
        ok: bool,
        latency_ms: i64,
        error: &str,
    ) -> LogEntry {
        LogEntry {
            ts: datetime!(2024-05-01 12:00:00 UTC) + Duration::from_millis(ms),
            config: config.into(),
            targets: String::new(),
            mode: "blocks".into(),
            concurrency: 4,
            request: request.into(),
            resp_bytes: 0,
            ok,
            latency_ms,
            error: (!error.is_empty()).then(|| error.to_string()),
        }
    }

    fn sample_log() -> Vec<LogEntry> {
        vec![
            log(2_500, "alpha", "getBlock", true, 30, ""),
            log(0, "alpha", "getBlock", true, 10, ""),
            log(400, "alpha", "getBlock", true, 20, ""),
            log(1_100, "alpha", "getBlock", false, 5, "context deadline exceeded"),
            log(900, "alpha", "getLatest", true, 2, ""),
            log(1_200, "beta", "getBlock", false, 5, "EOF"),
            log(1_300, "beta", "getBlock", false, 5, "EOF"),
            log(3_200, "beta", "getBlock", false, 5, "read: connection reset by peer"),
        ]
    }

    #[test]
    fn classifies_errors() {
        assert_eq!(classify_error("context deadline exceeded"), ErrorCode::Timeout);
        assert_eq!(classify_error("  Request TIMEOUT "), ErrorCode::Timeout);
        assert_eq!(classify_error("deadline has elapsed"), ErrorCode::Timeout);
        assert_eq!(classify_error("EOF"), ErrorCode::Eof);
        assert_eq!(classify_error("unknown query prefix"), ErrorCode::UnknownQuery);
        assert_eq!(classify_error("connection reset by peer"), ErrorCode::ConnReset);
        assert_eq!(classify_error("write: broken pipe"), ErrorCode::BrokenPipe);
        assert_eq!(classify_error("context canceled"), ErrorCode::Canceled);
        assert_eq!(classify_error("block not found"), ErrorCode::NotFound);
        assert_eq!(classify_error(""), ErrorCode::Unknown);
        assert_eq!(classify_error("   "), ErrorCode::Unknown);
        assert_eq!(classify_error("something odd"), ErrorCode::Other);
        // priority: timeout beats eof
        assert_eq!(classify_error("timeout waiting for EOF"), ErrorCode::Timeout);
        assert_eq!(sonic_rs::to_string(&ErrorCode::ConnReset).unwrap(), r#""conn_reset""#);
    }

    #[test]
    fn method_series_buckets_by_first_timestamp() {
        let methods = build_method_series(&sample_log());
        assert_eq!(methods.len(), 3);

        let key = MethodKey {
            config: "alpha".into(),
            mode: "blocks".into(),
            concurrency: 4,
            method: "getBlock".into(),
        };
        let s = &methods[&key];
        // 0 .. 2.5s spans three buckets
        assert_eq!(s.sec, vec![1, 2, 3]);
        assert_eq!(s.ok, vec![2.0, 0.0, 1.0]);
        assert_eq!(s.err, vec![0.0, 1.0, 0.0]);
        assert_eq!(s.p50, vec![10.0, 0.0, 30.0]);
        assert_eq!(s.p99, vec![20.0, 0.0, 30.0]);
        assert_eq!(s.total, 4);
        assert_eq!(s.start_ms, unix_ms(datetime!(2024-05-01 12:00:00 UTC)));

        let latest = MethodKey {
            method: "getLatest".into(),
            ..key
        };
        assert_eq!(methods[&latest].sec, vec![1]);
        assert_eq!(methods[&latest].start_ms - s.start_ms, 900);
    }

    #[test]
    fn error_series_and_summary() {
        let entries = sample_log();
        let errors = build_error_series(&entries);
        let eof = ErrorSeriesKey {
            config: "beta".into(),
            mode: "blocks".into(),
            concurrency: 4,
            code: ErrorCode::Eof,
        };
        assert_eq!(errors[&eof].cnt, vec![2.0]);
        let reset = ErrorSeriesKey {
            code: ErrorCode::ConnReset,
            ..eof.clone()
        };
        assert_eq!(errors[&reset].sec, vec![1]);
        assert_eq!(errors.len(), 3);

        let summary = build_error_summary(&entries);
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].count, 2);
        assert_eq!(summary[0].code, ErrorCode::Eof);
        assert_eq!(summary[0].error, "EOF");
        assert_eq!(summary[1].config, "alpha");
        assert_eq!(summary[1].code, ErrorCode::Timeout);
    }

    #[test]
    fn downsample_keeps_first_and_last() {
        let idxs = sample_indices(1000, 100);
        assert_eq!(idxs.len(), 101);
        assert_eq!(idxs[0], 0);
        assert_eq!(idxs[1], 10);
        assert_eq!(*idxs.last().unwrap(), 999);

        assert_eq!(sample_indices(50, 100), (0..50).collect::<Vec<_>>());
        assert_eq!(sample_indices(50, 0), (0..50).collect::<Vec<_>>());
        assert!(sample_indices(0, 10).is_empty());
        // last index already on the grid
        assert_eq!(sample_indices(7, 3), vec![0, 3, 6]);
    }

    #[test]
    fn downsample_is_a_noop_below_budget() {
        let mut s = ErrorSeries {
            start_ms: 0,
            sec: seconds(950),
            cnt: (0..950).map(|v| v as f64).collect(),
        };
        s.downsample(100);
        assert_eq!(s.sec.len(), 96);
        let once = s.clone();
        s.downsample(100);
        assert_eq!(s, once);
    }

    #[test]
    fn downsample_keeps_columns_aligned() {
        let mut s = SecondSeries {
            start_ms: 5,
            sec: seconds(10),
            rps: (0..10).map(|v| v as f64).collect(),
            err: (0..10).map(|v| v as f64 * 10.0).collect(),
            p50: (0..10).map(|v| v as f64 + 0.5).collect(),
            p90: vec![1.0; 10],
            p95: vec![2.0; 10],
            p99: vec![3.0; 10],
        };
        s.downsample(4);
        assert_eq!(s.sec, vec![1, 4, 7, 10]);
        assert_eq!(s.rps, vec![0.0, 3.0, 6.0, 9.0]);
        assert_eq!(s.err, vec![0.0, 30.0, 60.0, 90.0]);
        assert_eq!(s.p50, vec![0.5, 3.5, 6.5, 9.5]);
        assert_eq!(s.p99.len(), 4);
    }

    #[test]
    fn comparisons_against_best() {
        let r = |config: &str, rps: f64, avg: f64| RunResult {
            config: config.into(),
            mode: "blocks".into(),
            concurrency: 10,
            rps,
            avg_ms: avg,
            ..Default::default()
        };
        let lone = RunResult {
            concurrency: 20,
            ..r("alpha", 1.0, 1.0)
        };
        let rows = compare_configs(&[r("beta", 50.0, 20.0), r("alpha", 100.0, 10.0), lone]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].config, "alpha");
        assert_eq!(rows[0].rps_delta_pct, 0.0);
        assert_eq!(rows[1].rps_delta_pct, -50.0);
        assert_eq!(rows[1].avg_delta_pct, 100.0);
        assert_eq!(percent_delta(3.0, 0.0), 0.0);
    }

    #[test]
    fn method_summary_rows() {
        let rows = method_summary(&build_method_series(&sample_log()));
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].method, "getBlock");
        assert_eq!((rows[0].total, rows[0].ok, rows[0].err), (4, 3, 1));
        assert!((rows[0].avg_rps - 4.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn synthesis_is_deterministic() {
        let entries = sample_log();
        let results = vec![RunResult {
            config: "alpha".into(),
            mode: "blocks".into(),
            concurrency: 4,
            series: Some(SecondSeries {
                sec: seconds(5),
                rps: vec![1.0; 5],
                err: vec![0.0; 5],
                p50: vec![1.0; 5],
                p90: vec![1.0; 5],
                p95: vec![1.0; 5],
                p99: vec![1.0; 5],
                start_ms: 0,
            }),
            ..Default::default()
        }];
        let synth = ReportSynthesizer::new(2);
        let a = synth.synthesize(&results, Some(&entries));
        let mut shuffled = entries.clone();
        shuffled.reverse();
        let b = synth.synthesize(&results, Some(&shuffled));

        assert_eq!(
            sonic_rs::to_string(&a.methods).unwrap(),
            sonic_rs::to_string(&b.methods).unwrap()
        );
        assert_eq!(
            sonic_rs::to_string(&a.errors).unwrap(),
            sonic_rs::to_string(&b.errors).unwrap()
        );
        assert_eq!(a, b);

        assert_eq!(a.results[0].series.as_ref().unwrap().sec, vec![1, 4, 5]);
        assert_eq!(a.methods[0].sec, vec![1, 3]);
        assert_eq!(a.method_summary[0].total, 4);
        assert_eq!(a.methods.len(), 3);
        assert_eq!(a.errors.len(), 3);

        let bare = synth.synthesize(&results, None);
        assert!(bare.methods.is_empty() && bare.errors.is_empty() && bare.error_summary.is_empty());
    }
}
