use crate::error::Result;
use crate::logger::{EventLogger, LogEntry};
use crate::metrics::RunResult;
use crate::runner::{JobRunner, OpContext, Outcome, RunMode};
use crate::selector::WorkItemSelector;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

/// The action executed against a target for one work item.
///
/// Implementations own their transport and honor `ctx.timeout` themselves.
pub trait Operation<I>: Send + Sync {
    /// Name recorded in the request log (`request` field).
    fn name(&self) -> &str;

    fn execute(&self, item: I, ctx: OpContext) -> impl Future<Output = Outcome> + Send;
}

/// Adapts an async closure into an [`Operation`].
pub struct FnOperation<F> {
    name: String,
    f: F,
}

impl<F> FnOperation<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<I, F, Fut> Operation<I> for FnOperation<F>
where
    F: Fn(I, OpContext) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, item: I, ctx: OpContext) -> impl Future<Output = Outcome> + Send {
        (self.f)(item, ctx)
    }
}

/// Labels shared by every result and log entry of one scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    pub config: String,
    pub targets: String,
    pub mode: String,
}

/// A selector, an operation and an optional request log bound to one target.
pub struct Scenario<S, O> {
    labels: Labels,
    selector: Arc<S>,
    operation: Arc<O>,
    logger: Option<Arc<EventLogger>>,
    item_count: usize,
}

impl<S, O> Scenario<S, O>
where
    S: WorkItemSelector + 'static,
    O: Operation<S::Item> + 'static,
{
    /// `item_count` is the pool size: the number of runs in fixed mode and the
    /// index modulus in timed mode.
    pub fn new(labels: Labels, selector: Arc<S>, operation: Arc<O>, item_count: usize) -> Self {
        Self {
            labels,
            selector,
            operation,
            logger: None,
            item_count,
        }
    }

    pub fn with_logger(mut self, logger: Option<Arc<EventLogger>>) -> Self {
        self.logger = logger;
        self
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Runs the scenario at one concurrency level.
    ///
    /// A run where every operation fails still yields a result with zeroed
    /// statistics; only an empty item pool is an error.
    pub async fn run(
        &self,
        concurrency: usize,
        mode: RunMode,
        timeout: Duration,
    ) -> Result<RunResult> {
        info!(
            "{}: concurrency={}, total={}, {}",
            self.labels.mode, concurrency, self.item_count, mode
        );
        let runner = JobRunner::new(concurrency, mode, timeout);

        let selector = Arc::clone(&self.selector);
        let operation = Arc::clone(&self.operation);
        let logger = self.logger.clone();
        let labels = Arc::new(self.labels.clone());

        let run = runner
            .run(self.item_count, move |idx, ctx| {
                let selector = Arc::clone(&selector);
                let operation = Arc::clone(&operation);
                let logger = logger.clone();
                let labels = Arc::clone(&labels);
                async move {
                    let started = OffsetDateTime::now_utc();
                    let outcome = match selector.pick(idx).await {
                        Ok(item) => operation.execute(item, ctx).await,
                        Err(e) => {
                            debug!("pick failed for index {}: {}", idx, e);
                            Outcome::failure(0, e)
                        }
                    };
                    if let Some(logger) = &logger {
                        logger.record(LogEntry {
                            ts: started,
                            config: labels.config.clone(),
                            targets: labels.targets.clone(),
                            mode: labels.mode.clone(),
                            concurrency,
                            request: operation.name().to_string(),
                            resp_bytes: outcome.resp_bytes,
                            ok: outcome.ok,
                            latency_ms: outcome.latency_ms,
                            error: outcome.error.clone(),
                        });
                    }
                    outcome
                }
            })
            .await?;

        let mut result = RunResult {
            config: self.labels.config.clone(),
            targets: self.labels.targets.clone(),
            mode: self.labels.mode.clone(),
            concurrency,
            total: match mode {
                RunMode::FixedCount => self.item_count as u64,
                RunMode::TimeBoxed(_) => run.success + run.errors,
            },
            success: run.success,
            errors: run.errors,
            duration: run.elapsed,
            series: run.series,
            ..Default::default()
        };
        result.apply_metrics(&run.latencies);
        info!("  {}", result);
        Ok(result)
    }
}
