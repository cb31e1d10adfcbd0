//! Batch orchestration for bulk research runs.
//!
//! This crate ties the research client and run storage together:
//! - [`query`]: per-entity query text and capability flags
//! - [`budget`]: monthly budget for the constrained model tier
//! - [`pipeline`]: one entity in, one result record out
//! - [`scheduler`]: sequential, cancellable window execution
//! - [`boundary`]: window checkpoints
//! - [`aggregator`]: per-model report documents
//! - [`session`]: resumable runs, advanced one window at a time

pub mod aggregator;
pub mod boundary;
pub mod budget;
pub mod pipeline;
pub mod query;
pub mod scheduler;
pub mod session;

pub use aggregator::{ResultAggregator, Tally, tally};
pub use boundary::{BoundaryStatus, DEFAULT_WINDOW_SIZE, check_boundary};
pub use budget::{BudgetGuard, LedgerBudget, TierResolution, resolve_tier};
pub use pipeline::{ProcessOutcome, RequestPipeline, RunContext};
pub use scheduler::{
    BatchProgress, BatchScheduler, SilentBatchProgress, Window, WindowOutcome, WindowStatus,
};
pub use session::{NewRun, Orchestrator, RunState, WindowReport, load_run};
