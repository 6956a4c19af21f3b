use crate::error::{Error, Result};
use crate::runner::RunMode;
use crate::selector::BlockRange;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "ls-load")]
#[command(about = "Load generator and latency report for JSON-RPC targets", long_about = None)]
pub struct Config {
    /// Comma-separated targets: `name=ws://host:port` or a bare URL
    #[arg(long, env = "LS_LOAD_CONFIGS", default_value = "")]
    pub configs: String,

    /// Comma-separated concurrency levels
    #[arg(long, env = "LS_LOAD_CONCURRENCY", default_value = "5,10,20,50")]
    pub concurrency: String,

    /// Comma-separated step concurrency levels (overrides --concurrency)
    #[arg(long, env = "LS_LOAD_STEPS", default_value = "")]
    pub steps: String,

    /// Duration per step, e.g. 5m
    #[arg(
        long,
        env = "LS_LOAD_STEP_DURATION",
        default_value = "",
        value_parser = parse_optional_duration
    )]
    pub step_duration: Duration,

    /// Block range: last:N or range:FROM-TO
    #[arg(
        long,
        env = "LS_LOAD_BLOCKS",
        default_value = "last:200",
        value_parser = parse_block_range
    )]
    pub blocks: BlockRange,

    /// Draw a random block per request instead of walking the list
    #[arg(long, env = "LS_LOAD_BLOCKS_RANDOM")]
    pub blocks_random: bool,

    /// How often the head is re-fetched for last:N when blocks are random
    #[arg(
        long,
        env = "LS_LOAD_BLOCKS_REFRESH",
        default_value = "5s",
        value_parser = parse_optional_duration
    )]
    pub blocks_refresh: Duration,

    /// File with account ids, one per line
    #[arg(long, env = "LS_LOAD_ACCOUNTS")]
    pub accounts: Option<PathBuf>,

    /// Number of random account ids when --accounts is not set
    #[arg(long, env = "LS_LOAD_ACCOUNTS_COUNT", default_value = "10000")]
    pub accounts_count: usize,

    /// Shuffle the account list on load
    #[arg(long, env = "LS_LOAD_ACCOUNTS_SHUFFLE")]
    pub accounts_shuffle: bool,

    /// Output root; each run writes into a timestamped sub-directory
    #[arg(long, env = "LS_LOAD_OUT", default_value = "results")]
    pub out: PathBuf,

    /// Per-request timeout
    #[arg(
        long,
        env = "LS_LOAD_TIMEOUT",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,

    /// Duration per scenario, e.g. 30s. Empty runs every item once
    #[arg(
        long,
        env = "LS_LOAD_DURATION",
        default_value = "",
        value_parser = parse_optional_duration
    )]
    pub duration: Duration,

    /// Rebuild report.json from an existing results directory and exit
    #[arg(long, env = "LS_LOAD_REPORT_FROM")]
    pub report_from: Option<PathBuf>,

    /// Max points per series in the report (0 = keep all)
    #[arg(long, env = "LS_LOAD_REPORT_MAX_POINTS", default_value = "240")]
    pub report_max_points: usize,

    /// Per-request JSONL log: `auto`, `off` or a path
    #[arg(long, env = "LS_LOAD_REQUEST_LOG", default_value = "auto")]
    pub request_log: String,

    /// Accepted for compatibility; has no effect
    #[arg(long, env = "LS_LOAD_RETRIES", default_value = "0")]
    pub retries: u32,
}

/// Concurrency levels and run mode after `--steps` is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub levels: Vec<usize>,
    pub mode: RunMode,
}

impl Config {
    pub fn plan(&self) -> Result<Plan> {
        let mut levels = parse_int_list(&self.concurrency)?;
        let mut duration = self.duration;

        if !self.steps.trim().is_empty() {
            levels = parse_int_list(&self.steps)?;
            if self.step_duration.is_zero() && duration.is_zero() {
                return Err(Error::InvalidConfig(
                    "steps require --step-duration or --duration".to_string(),
                ));
            }
            if !self.step_duration.is_zero() {
                duration = self.step_duration;
            }
        }
        if levels.is_empty() {
            return Err(Error::InvalidConfig("empty concurrency list".to_string()));
        }

        Ok(Plan {
            levels,
            mode: RunMode::from_duration(Some(duration)),
        })
    }

    pub fn targets(&self) -> Result<Vec<TargetSpec>> {
        parse_targets(&self.configs)
    }

    /// Refresh interval for random blocks; zero falls back to 5s.
    pub fn refresh(&self) -> Duration {
        if self.blocks_refresh.is_zero() {
            Duration::from_secs(5)
        } else {
            self.blocks_refresh
        }
    }
}

// =============================================================================
// Value parsers
// =============================================================================

/// Empty, `0` and `off` mean "not set" and yield a zero duration.
pub fn parse_optional_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() || s == "0" || s.eq_ignore_ascii_case("off") {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| format!("invalid duration `{s}`: {e}"))
}

fn parse_block_range(s: &str) -> std::result::Result<BlockRange, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

/// Comma-separated positive integers; blank entries are skipped.
pub fn parse_int_list(s: &str) -> Result<Vec<usize>> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.parse::<usize>() {
            Ok(v) if v > 0 => Ok(v),
            _ => Err(Error::InvalidConfig(format!("invalid int: {p}"))),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub name: String,
    pub url: String,
}

/// `name=url` or a bare url, comma separated. Bare urls are named after their
/// host. Repeated urls are kept once.
pub fn parse_targets(s: &str) -> Result<Vec<TargetSpec>> {
    let mut out: Vec<TargetSpec> = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, url) = match part.split_once('=') {
            Some((name, url)) if !name.trim().is_empty() && !name.contains("://") => {
                (Some(name.trim().to_string()), url.trim())
            }
            _ => (None, part),
        };
        let parsed = Url::parse(url).map_err(|e| Error::InvalidTarget {
            target: url.to_string(),
            reason: e.to_string(),
        })?;
        let name = match name {
            Some(name) => name,
            None => parsed.host_str().unwrap_or(url).to_string(),
        };
        if out.iter().any(|t| t.url == url) {
            continue;
        }
        out.push(TargetSpec {
            name,
            url: url.to_string(),
        });
    }
    if out.is_empty() {
        return Err(Error::InvalidConfig(format!("no targets in `{s}`")));
    }
    Ok(out)
}

/// Resolves `--request-log` against a results directory.
/// `auto` → `dir/requests.jsonl`; empty, `off`, `none`, `false`, `0` → disabled.
pub fn resolve_request_log(spec: &str, dir: &Path) -> Option<PathBuf> {
    let spec = spec.trim();
    match spec.to_ascii_lowercase().as_str() {
        "" | "off" | "none" | "false" | "0" => None,
        "auto" => Some(dir.join("requests.jsonl")),
        _ => Some(PathBuf::from(spec)),
    }
}

/// Account ids, one per line. Blank lines and `#` comments are skipped.
pub fn load_accounts(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}
