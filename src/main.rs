use anyhow::{bail, Context, Result};
use clap::Parser;
use ls_load::artifacts::{regenerate, write_report, write_summary};
use ls_load::config::{load_accounts, resolve_request_log, Config, Plan, TargetSpec};
use ls_load::logger::{read_log, LogEntry};
use ls_load::selector::resolve_block_list;
use ls_load::target::{LatestSeqno, RpcOperation, WsTarget};
use ls_load::{
    EventLogger, Labels, LockedRng, Operation, RandomPick, ReportSynthesizer, RunResult, Scenario,
    Sequential, WindowedRandom, WorkItemSelector,
};
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{error, info, warn};

// =============================================================================
// Work items
// =============================================================================

fn fake_accounts(count: usize) -> Vec<String> {
    warn!("Generating {} random account ids", count);
    let mut rng = rand::rng();
    (0..count)
        .map(|_| format!("0:{:032x}{:032x}", rng.random::<u128>(), rng.random::<u128>()))
        .collect()
}

fn accounts(config: &Config, rng: &LockedRng) -> Result<Vec<String>> {
    let mut accounts = match &config.accounts {
        Some(path) => {
            let accounts = load_accounts(path)
                .with_context(|| format!("Failed to load accounts from {:?}", path))?;
            info!("Loaded {} accounts from {:?}", accounts.len(), path);
            accounts
        }
        None => fake_accounts(config.accounts_count),
    };
    if accounts.is_empty() {
        bail!("no accounts available for test");
    }
    if config.accounts_shuffle && accounts.len() > 1 {
        rng.shuffle(&mut accounts);
    }
    Ok(accounts)
}

// =============================================================================
// Scenarios
// =============================================================================

async fn sweep<S, O>(scenario: &Scenario<S, O>, plan: &Plan, config: &Config) -> Vec<RunResult>
where
    S: WorkItemSelector + 'static,
    O: Operation<S::Item> + 'static,
{
    let mut results = Vec::with_capacity(plan.levels.len());
    for &conc in &plan.levels {
        match scenario.run(conc, plan.mode, config.timeout).await {
            Ok(result) => results.push(result),
            Err(e) => error!("{} at concurrency {} failed: {}", scenario.labels().mode, conc, e),
        }
    }
    results
}

async fn run_target(
    spec: &TargetSpec,
    config: &Config,
    plan: &Plan,
    rng: &Arc<LockedRng>,
    accounts: &[String],
    logger: Option<Arc<EventLogger>>,
) -> Result<Vec<RunResult>> {
    let slots = plan.levels.iter().copied().max().unwrap_or(1);
    let target = Arc::new(WsTarget::new(&spec.url, slots)?);
    let labels = |mode: &str| Labels {
        config: spec.name.clone(),
        targets: spec.url.clone(),
        mode: mode.to_string(),
    };
    let mut results = Vec::new();

    let get_block = Arc::new(RpcOperation::new(Arc::clone(&target), "getBlock", |seqno: i32| {
        sonic_rs::json!({ "seqno": seqno })
    }));
    let bound = LatestSeqno::new(Arc::clone(&target), config.timeout);
    match resolve_block_list(&bound, config.blocks).await {
        Ok(seqs) if config.blocks_random => {
            info!("blocks: random over {} (refresh {:?})", config.blocks, config.refresh());
            let selector =
                WindowedRandom::new(bound, config.blocks, config.refresh(), Arc::clone(rng));
            let scenario =
                Scenario::new(labels("blocks"), Arc::new(selector), get_block, seqs.len())
                    .with_logger(logger.clone());
            results.extend(sweep(&scenario, plan, config).await);
        }
        Ok(seqs) => {
            let count = seqs.len();
            let selector = Sequential::new(seqs)?;
            let scenario = Scenario::new(labels("blocks"), Arc::new(selector), get_block, count)
                .with_logger(logger.clone());
            results.extend(sweep(&scenario, plan, config).await);
        }
        Err(e) => warn!("block range build failed: {}", e),
    }

    let get_account = Arc::new(RpcOperation::new(
        Arc::clone(&target),
        "getAccount",
        |account: String| sonic_rs::json!({ "account": account }),
    ));
    let selector = RandomPick::new(accounts.to_vec(), Arc::clone(rng))?;
    let count = accounts.len();
    let scenario = Scenario::new(labels("accounts"), Arc::new(selector), get_account, count)
        .with_logger(logger);
    results.extend(sweep(&scenario, plan, config).await);

    Ok(results)
}

// =============================================================================
// Report
// =============================================================================

/// Drains and closes the request log, then reads it back for the report.
async fn close_log(logger: Option<Arc<EventLogger>>) -> Result<Option<Vec<LogEntry>>> {
    let Some(logger) = logger else {
        return Ok(None);
    };
    let written = logger.close().await.context("Failed to close request log")?;
    info!("Request log: {} entries in {:?}", written, logger.path());
    match read_log(logger.path()) {
        Ok(entries) => Ok(Some(entries)),
        Err(e) => {
            warn!("failed to parse request log: {}", e);
            Ok(None)
        }
    }
}

fn finish(
    out_root: &Path,
    results: &[RunResult],
    entries: Option<&[LogEntry]>,
    max_points: usize,
) -> Result<()> {
    let summary = write_summary(out_root, results).context("Failed to write summary")?;
    info!("Summary written to: {:?}", summary);

    let payload = ReportSynthesizer::new(max_points).synthesize(results, entries);
    for row in &payload.comparisons {
        info!(
            "  {} conc={} {}: rps={:.2} ({:+.1}%) avg={:.1}ms ({:+.1}%)",
            row.mode,
            row.concurrency,
            row.config,
            row.rps,
            row.rps_delta_pct,
            row.avg_ms,
            row.avg_delta_pct
        );
    }
    let report = write_report(out_root, &payload).context("Failed to write report")?;
    info!("Report written to: {:?}", report);
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    if let Some(dir) = &config.report_from {
        regenerate(dir, &config.request_log, config.report_max_points)
            .with_context(|| format!("Failed to regenerate report from {:?}", dir))?;
        return Ok(());
    }

    let plan = config.plan().context("Invalid concurrency settings")?;
    let targets = config.targets().context("No targets configured")?;

    // Print banner
    info!("════════════════════════════════════════════════════════════");
    info!("                  LOAD TEST (Rust)");
    info!("════════════════════════════════════════════════════════════");
    for t in &targets {
        info!("Target: {} ({})", t.name, t.url);
    }
    info!("Concurrency: {:?}", plan.levels);
    info!("Mode: {}", plan.mode);
    info!("Timeout: {}", humantime::format_duration(config.timeout));
    info!("Blocks: {}{}", config.blocks, if config.blocks_random { " (random)" } else { "" });
    if config.retries > 0 {
        warn!("--retries={} has no effect", config.retries);
    }

    let rng = Arc::new(LockedRng::new());
    let accounts = accounts(&config, &rng)?;
    info!("Accounts: {}", accounts.len());

    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]-[hour][minute][second]"))
        .context("Failed to format run timestamp")?;
    let out_root = config.out.join(stamp);
    std::fs::create_dir_all(&out_root)
        .with_context(|| format!("Failed to create output dir {:?}", out_root))?;
    info!("Output: {:?}", out_root);

    let logger = match resolve_request_log(&config.request_log, &out_root) {
        Some(path) => {
            let logger = EventLogger::create(&path)
                .with_context(|| format!("Failed to init request log {:?}", path))?;
            info!("Per-request log: {:?}", path);
            Some(Arc::new(logger))
        }
        None => None,
    };
    info!("════════════════════════════════════════════════════════════");

    let mut results = Vec::new();
    for spec in &targets {
        info!("== Config: {} ({}) ==", spec.name, spec.url);
        match run_target(spec, &config, &plan, &rng, &accounts, logger.clone()).await {
            Ok(r) => results.extend(r),
            Err(e) => error!("{} skipped: {:#}", spec.name, e),
        }
    }

    // close before any early return so buffered entries reach the file
    let entries = close_log(logger).await?;
    if results.is_empty() {
        bail!("no results collected");
    }

    finish(&out_root, &results, entries.as_deref(), config.report_max_points)?;

    info!("════════════════════════════════════════════════════════════");
    info!("                     LOAD TEST COMPLETE");
    info!("════════════════════════════════════════════════════════════");

    Ok(())
}
