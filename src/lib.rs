//! Concurrent load generation against a target service with per-request
//! logging, exact latency statistics and a deterministic report.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod selector;
pub mod target;

pub use error::{Error, Result};
pub use logger::{EventLogger, LogEntry};
pub use metrics::{LatencyStats, RunResult, SecondSeries};
pub use report::{ReportPayload, ReportSynthesizer};
pub use runner::{JobRunner, OpContext, Outcome, RunMode};
pub use scenario::{FnOperation, Labels, Operation, Scenario};
pub use selector::{BlockRange, LockedRng, RandomPick, Sequential, WindowedRandom, WorkItemSelector};
