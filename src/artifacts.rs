//! Run artifacts on disk and offline report regeneration.

use crate::config::resolve_request_log;
use crate::error::{Error, Result};
use crate::logger::{read_log, ts_format};
use crate::metrics::RunResult;
use crate::report::{ReportPayload, ReportSynthesizer};
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{info, warn};

pub const SUMMARY_FILE: &str = "summary.json";
pub const ERRORS_FILE: &str = "errors.json";
pub const REPORT_FILE: &str = "report.json";

pub fn write_json<T: Serialize + ?Sized>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let json = sonic_rs::to_string_pretty(value)?;
    std::fs::write(path, json).map_err(|e| Error::io(path, e))
}

/// Loads `summary.json` from a results directory.
pub fn read_summary(dir: impl AsRef<Path>) -> Result<Vec<RunResult>> {
    let path = dir.as_ref().join(SUMMARY_FILE);
    if !path.exists() {
        return Err(Error::MissingInput(path));
    }
    let content = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
    Ok(sonic_rs::from_str(&content)?)
}

/// Writes `summary.json` with full-resolution results.
pub fn write_summary(dir: impl AsRef<Path>, results: &[RunResult]) -> Result<PathBuf> {
    let path = dir.as_ref().join(SUMMARY_FILE);
    write_json(&path, results)?;
    Ok(path)
}

/// Writes `report.json` and, when there were failures, `errors.json`.
pub fn write_report(dir: impl AsRef<Path>, payload: &ReportPayload) -> Result<PathBuf> {
    let dir = dir.as_ref();
    if !payload.error_summary.is_empty() {
        write_json(dir.join(ERRORS_FILE), &payload.error_summary)?;
    }
    let stamped = ReportPayload {
        generated_at: Some(ts_format::format(&OffsetDateTime::now_utc())),
        ..payload.clone()
    };
    let path = dir.join(REPORT_FILE);
    write_json(&path, &stamped)?;
    Ok(path)
}

/// Rebuilds the report of a finished run from `summary.json` and the request
/// log named by `request_log` (`auto`, `off` or a path).
pub fn regenerate(
    dir: impl AsRef<Path>,
    request_log: &str,
    max_points: usize,
) -> Result<ReportPayload> {
    let dir = dir.as_ref();
    let results = read_summary(dir)?;
    if results.is_empty() {
        warn!("{:?} holds no results", dir.join(SUMMARY_FILE));
    }

    let entries = match resolve_request_log(request_log, dir) {
        Some(path) => {
            let entries = read_log(&path)?;
            info!("Loaded {} request log entries from {:?}", entries.len(), path);
            Some(entries)
        }
        None => None,
    };

    let payload = ReportSynthesizer::new(max_points).synthesize(&results, entries.as_deref());
    let path = write_report(dir, &payload)?;
    info!("Report written to: {:?}", path);
    Ok(payload)
}
