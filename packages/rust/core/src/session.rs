//! Resumable run sessions.
//!
//! A run is created once, persisted, and then advanced one window at a
//! time. Between windows the caller decides whether to continue; a stopped
//! run can be reloaded later and picks up at the first unprocessed entity.

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use bulkresearch_shared::{
    BudgetSnapshot, BulkResearchError, Entity, ModelTier, Result, ResultMap, RunSettings,
};
use bulkresearch_storage::{RunStatus, Storage, StoredRun};

use crate::aggregator::{Tally, tally};
use crate::boundary::{BoundaryStatus, check_boundary, next_window_len};
use crate::budget::{BudgetGuard, resolve_tier};
use crate::pipeline::RunContext;
use crate::scheduler::{BatchProgress, BatchScheduler, Window, WindowStatus};

/// Input for [`Orchestrator::create_run`].
#[derive(Debug, Clone)]
pub struct NewRun {
    pub name: String,
    pub entities: Vec<Entity>,
    pub settings: RunSettings,
}

/// In-memory state of a run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: String,
    pub name: String,
    pub settings: RunSettings,
    pub entities: Vec<Entity>,
    pub results: ResultMap,
    /// Entities processed so far; also the next window's start.
    pub cumulative_processed: usize,
    pub status: RunStatus,
}

impl RunState {
    pub fn total(&self) -> usize {
        self.entities.len()
    }

    pub fn remaining(&self) -> usize {
        self.total().saturating_sub(self.cumulative_processed)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// The next window to run, or `None` once every entity is processed.
    pub fn next_window(&self) -> Option<Window> {
        let count = next_window_len(
            self.cumulative_processed,
            self.total(),
            self.settings.window_size,
        );
        (count > 0).then_some(Window {
            start: self.cumulative_processed,
            count,
        })
    }

    pub fn boundary(&self) -> BoundaryStatus {
        check_boundary(
            self.cumulative_processed,
            self.total(),
            self.settings.window_size,
        )
    }

    /// Entity identifiers in list order, for report formatting.
    pub fn order(&self) -> Vec<String> {
        self.entities
            .iter()
            .map(|e| e.identifier().to_string())
            .collect()
    }
}

/// Summary of one [`Orchestrator::run_next_window`] call.
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub status: WindowStatus,
    pub processed: usize,
    pub tally: Tally,
    pub cumulative_processed: usize,
    pub total: usize,
    pub boundary: BoundaryStatus,
    pub tier: ModelTier,
    pub downgraded: bool,
    /// `None` when the budget could not be read.
    pub budget: Option<BudgetSnapshot>,
}

/// Drives runs window by window and keeps storage in step.
pub struct Orchestrator<'a, G> {
    storage: &'a Storage,
    scheduler: BatchScheduler,
    guard: G,
}

impl<'a, G: BudgetGuard> Orchestrator<'a, G> {
    pub fn new(storage: &'a Storage, scheduler: BatchScheduler, guard: G) -> Self {
        Self {
            storage,
            scheduler,
            guard,
        }
    }

    /// Validate and persist a new run.
    pub async fn create_run(&self, new: NewRun) -> Result<RunState> {
        if new.entities.is_empty() {
            return Err(BulkResearchError::validation("entity list is empty"));
        }
        if new.settings.models.is_empty() {
            return Err(BulkResearchError::validation("no models selected"));
        }
        if new.settings.window_size == 0 {
            return Err(BulkResearchError::validation("window size must be at least 1"));
        }

        let settings_json = serde_json::to_string(&new.settings)
            .map_err(|e| BulkResearchError::parse(format!("failed to encode settings: {e}")))?;
        let entities_json = serde_json::to_string(&new.entities)
            .map_err(|e| BulkResearchError::parse(format!("failed to encode entities: {e}")))?;

        let now = Utc::now();
        let run = StoredRun {
            id: uuid::Uuid::now_v7().to_string(),
            name: new.name,
            settings_json,
            entities_hash: fingerprint(&entities_json),
            entities_json,
            total_entities: new.entities.len(),
            next_window_start: 0,
            status: RunStatus::Paused,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_run(&run).await?;
        info!(run_id = %run.id, entities = run.total_entities, "run created");

        Ok(RunState {
            run_id: run.id,
            name: run.name,
            settings: new.settings,
            entities: new.entities,
            results: ResultMap::new(),
            cumulative_processed: 0,
            status: RunStatus::Paused,
        })
    }

    pub async fn load_run(&self, run_id: &str) -> Result<RunState> {
        load_run(self.storage, run_id).await
    }

    /// Current usage of the budgeted tier, if readable.
    pub async fn budget_snapshot(&self) -> Option<BudgetSnapshot> {
        match self.guard.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "could not read budget");
                None
            }
        }
    }

    /// Run the next window of `state` and persist what it produced.
    #[instrument(skip_all, fields(run_id = %state.run_id))]
    pub async fn run_next_window(
        &self,
        state: &mut RunState,
        progress: &dyn BatchProgress,
        cancel: &CancellationToken,
    ) -> Result<WindowReport> {
        let window = state.next_window().ok_or_else(|| {
            BulkResearchError::validation(format!("run {} has nothing left to process", state.run_id))
        })?;

        let requested = ModelTier::for_run(state.settings.category, state.settings.depth);
        let resolution = resolve_tier(&self.guard, requested).await;
        let ctx = RunContext::new(&state.settings, resolution.tier);

        self.storage
            .update_run_progress(&state.run_id, state.cumulative_processed, RunStatus::Running)
            .await?;

        let outcome = match self
            .scheduler
            .run_window(&state.entities, window, &ctx, progress, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.storage
                    .update_run_progress(&state.run_id, state.cumulative_processed, RunStatus::Paused)
                    .await?;
                state.status = RunStatus::Paused;
                return Err(e);
            }
        };

        for record in outcome.records.values() {
            self.storage.upsert_record(&state.run_id, record).await?;
        }
        if let Err(e) = self
            .storage
            .record_tier_usage(&state.run_id, resolution.tier.as_str(), outcome.dispatched as u64)
            .await
        {
            warn!(error = %e, "failed to record tier usage");
        }

        let window_tally = tally(outcome.records.values());
        state.results.extend(outcome.records);
        state.cumulative_processed += outcome.processed;
        state.status = if state.is_complete() {
            RunStatus::Completed
        } else {
            RunStatus::Paused
        };
        self.storage
            .update_run_progress(&state.run_id, state.cumulative_processed, state.status)
            .await?;

        let boundary = state.boundary();
        info!(
            processed = outcome.processed,
            cumulative = state.cumulative_processed,
            remaining = boundary.remaining,
            at_boundary = boundary.at_boundary,
            "window persisted"
        );

        Ok(WindowReport {
            status: outcome.status,
            processed: outcome.processed,
            tally: window_tally,
            cumulative_processed: state.cumulative_processed,
            total: state.total(),
            boundary,
            tier: resolution.tier,
            downgraded: resolution.downgraded,
            budget: self.budget_snapshot().await,
        })
    }
}

/// Reload a stored run with its records.
///
/// Fails if the stored entity list no longer matches its fingerprint.
pub async fn load_run(storage: &Storage, run_id: &str) -> Result<RunState> {
    let run = storage
        .get_run(run_id)
        .await?
        .ok_or_else(|| BulkResearchError::validation(format!("run not found: {run_id}")))?;

    if fingerprint(&run.entities_json) != run.entities_hash {
        return Err(BulkResearchError::Storage(format!(
            "entity list of run {run_id} does not match its fingerprint"
        )));
    }

    let settings: RunSettings = serde_json::from_str(&run.settings_json)
        .map_err(|e| BulkResearchError::parse(format!("corrupt settings for run {run_id}: {e}")))?;
    let entities: Vec<Entity> = serde_json::from_str(&run.entities_json)
        .map_err(|e| BulkResearchError::parse(format!("corrupt entities for run {run_id}: {e}")))?;

    let results: ResultMap = storage
        .list_records(run_id)
        .await?
        .into_iter()
        .map(|r| (r.entity_id.clone(), r))
        .collect();

    Ok(RunState {
        run_id: run.id,
        name: run.name,
        settings,
        cumulative_processed: run.next_window_start.min(entities.len()),
        entities,
        results,
        status: run.status,
    })
}

/// Hex SHA-256 of an encoded entity list.
pub fn fingerprint(entities_json: &str) -> String {
    let digest = Sha256::digest(entities_json.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
