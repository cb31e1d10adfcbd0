//! Sequential window execution.
//!
//! One request at a time, in list order, with a fixed pause between
//! requests. Cancellation is checked before every entity and interrupts
//! both the in-flight request and the pause.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use bulkresearch_shared::{BulkResearchError, Entity, Result, ResultMap, ResultRecord};

use crate::pipeline::{ProcessOutcome, RequestPipeline, RunContext};

/// A slice of the entity list to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub count: usize,
}

/// How a window ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStatus {
    Completed,
    Cancelled,
}

/// Records produced by one window.
#[derive(Debug, Clone)]
pub struct WindowOutcome {
    pub status: WindowStatus,
    pub records: ResultMap,
    /// Entities recorded in this window, duplicates included.
    pub processed: usize,
    /// Requests sent to the endpoint, including one abandoned on cancellation.
    pub dispatched: usize,
}

/// Progress callback for window execution.
pub trait BatchProgress: Send + Sync {
    /// Called once before the first entity of a window.
    fn window_started(&self, start: usize, count: usize, total: usize);
    /// Called before an entity's request is dispatched.
    fn item_started(&self, index: usize, entity: &Entity);
    /// Called after an entity's record is stored.
    fn item_completed(&self, index: usize, entity: &Entity, record: &ResultRecord);
}

/// No-op progress for headless/test usage.
pub struct SilentBatchProgress;

impl BatchProgress for SilentBatchProgress {
    fn window_started(&self, _start: usize, _count: usize, _total: usize) {}
    fn item_started(&self, _index: usize, _entity: &Entity) {}
    fn item_completed(&self, _index: usize, _entity: &Entity, _record: &ResultRecord) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Completed,
    Cancelled,
}

/// Bookkeeping for one window execution.
#[derive(Debug)]
struct BatchRunState {
    window: Window,
    processed: usize,
    dispatched: usize,
    phase: Phase,
}

impl BatchRunState {
    fn new(window: Window) -> Self {
        Self {
            window,
            processed: 0,
            dispatched: 0,
            phase: Phase::Idle,
        }
    }

    fn cancel(&mut self) {
        if self.phase == Phase::Running {
            self.phase = Phase::Cancelled;
        }
    }

    fn finish(&mut self) -> WindowStatus {
        match self.phase {
            Phase::Cancelled => WindowStatus::Cancelled,
            _ => {
                self.phase = Phase::Completed;
                WindowStatus::Completed
            }
        }
    }
}

/// Runs windows of entities through a [`RequestPipeline`].
pub struct BatchScheduler {
    pipeline: RequestPipeline,
    request_delay: Duration,
}

impl BatchScheduler {
    pub fn new(pipeline: RequestPipeline, request_delay: Duration) -> Self {
        Self {
            pipeline,
            request_delay,
        }
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Process `window` of `entities` in order.
    ///
    /// Fails only when no API key is configured; per-entity failures are
    /// records. A cancelled window keeps everything recorded before the
    /// cancellation.
    #[instrument(skip_all, fields(start = window.start, count = window.count))]
    pub async fn run_window(
        &self,
        entities: &[Entity],
        window: Window,
        ctx: &RunContext,
        progress: &dyn BatchProgress,
        cancel: &CancellationToken,
    ) -> Result<WindowOutcome> {
        if !self.pipeline.has_credentials() {
            return Err(BulkResearchError::Credentials(
                "no API key configured; set it before starting a run".into(),
            ));
        }

        let start = window.start.min(entities.len());
        let end = window.start.saturating_add(window.count).min(entities.len());
        let mut state = BatchRunState::new(window);
        let mut records = ResultMap::new();

        state.phase = Phase::Running;
        progress.window_started(start, end - start, entities.len());
        info!(start, end, tier = %ctx.tier, "window started");

        for index in start..end {
            if cancel.is_cancelled() {
                state.cancel();
                break;
            }

            let entity = &entities[index];
            progress.item_started(index, entity);

            let result = self.pipeline.process(entity, index, ctx, cancel).await;
            if result.was_dispatched() {
                state.dispatched += 1;
            }

            match result {
                ProcessOutcome::Skipped | ProcessOutcome::Aborted => {
                    state.cancel();
                    break;
                }
                ProcessOutcome::Recorded(record) => {
                    let key = record.entity_id.clone();
                    if records.insert(key.clone(), record).is_some() {
                        debug!(entity = %key, "duplicate identifier, later record wins");
                    }
                    state.processed += 1;
                    if let Some(record) = records.get(&key) {
                        progress.item_completed(index, entity, record);
                    }
                }
            }

            if index + 1 < end && !self.request_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.request_delay) => {}
                    _ = cancel.cancelled() => {
                        state.cancel();
                        break;
                    }
                }
            }
        }

        let status = state.finish();
        info!(
            processed = state.processed,
            dispatched = state.dispatched,
            requested = state.window.count,
            ?status,
            "window finished"
        );

        Ok(WindowOutcome {
            status,
            records,
            processed: state.processed,
            dispatched: state.dispatched,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bulkresearch_client::ResearchClient;
    use bulkresearch_shared::{
        AnalysisType, BatchConfig, DepthLevel, ModelSelection, ModelTier, ResearchCategory,
        ResearchOptions, RunSettings,
    };
    use url::Url;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> RunContext {
        let settings = RunSettings {
            category: ResearchCategory::MarketAnalysis,
            depth: DepthLevel::Basic,
            analysis_type: AnalysisType::Individual,
            user_intent: None,
            models: ModelSelection::from_names(["openai"]),
            options: ResearchOptions::default(),
            source_name: None,
            window_size: 20,
        };
        RunContext::new(&settings, ModelTier::Sonar)
    }

    fn scheduler(server: &MockServer, api_key: Option<&str>, delay: Duration) -> BatchScheduler {
        let config = BatchConfig {
            endpoint: Url::parse(&format!("{}/api/research", server.uri())).unwrap(),
            api_key: api_key.map(String::from),
            request_delay: delay,
            request_timeout: Duration::from_secs(5),
        };
        BatchScheduler::new(
            RequestPipeline::new(ResearchClient::new(&config).unwrap()),
            delay,
        )
    }

    fn entities(n: usize) -> Vec<Entity> {
        (0..n)
            .map(|i| Entity::new(format!("https://company{i}.com"), None).unwrap())
            .collect()
    }

    async fn ok_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "openai": "ok" })),
            )
            .mount(&server)
            .await;
        server
    }

    /// Records the order of callbacks.
    #[derive(Default)]
    struct RecordingProgress {
        completed: Mutex<Vec<usize>>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl BatchProgress for RecordingProgress {
        fn window_started(&self, _start: usize, _count: usize, _total: usize) {}
        fn item_started(&self, _index: usize, _entity: &Entity) {}
        fn item_completed(&self, index: usize, _entity: &Entity, _record: &ResultRecord) {
            let mut done = self.completed.lock().unwrap();
            done.push(index);
            if let Some((n, token)) = &self.cancel_after {
                if done.len() == *n {
                    token.cancel();
                }
            }
        }
    }

    #[tokio::test]
    async fn processes_window_in_order() {
        let server = ok_server().await;
        let list = entities(10);
        let progress = RecordingProgress::default();

        let outcome = scheduler(&server, Some("k"), Duration::ZERO)
            .run_window(
                &list,
                Window { start: 2, count: 5 },
                &ctx(),
                &progress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, WindowStatus::Completed);
        assert_eq!(outcome.processed, 5);
        assert_eq!(outcome.records.len(), 5);
        assert_eq!(*progress.completed.lock().unwrap(), vec![2, 3, 4, 5, 6]);
        assert_eq!(outcome.records["https://company4.com"].processing_index, 4);
    }

    #[tokio::test]
    async fn window_is_clamped_to_list() {
        let server = ok_server().await;
        let list = entities(3);

        let outcome = scheduler(&server, Some("k"), Duration::ZERO)
            .run_window(
                &list,
                Window { start: 1, count: 20 },
                &ctx(),
                &SilentBatchProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.processed, 2);
    }

    #[tokio::test]
    async fn cancellation_keeps_completed_records() {
        let server = ok_server().await;
        let list = entities(10);
        let cancel = CancellationToken::new();
        let progress = RecordingProgress {
            cancel_after: Some((3, cancel.clone())),
            ..Default::default()
        };

        let outcome = scheduler(&server, Some("k"), Duration::ZERO)
            .run_window(&list, Window { start: 0, count: 10 }, &ctx(), &progress, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, WindowStatus::Cancelled);
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.dispatched, 3);
        assert_eq!(outcome.records.len(), 3);
        assert!(!outcome.records.contains_key("https://company3.com"));
    }

    #[tokio::test]
    async fn missing_credentials_fails_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = scheduler(&server, None, Duration::ZERO)
            .run_window(
                &entities(3),
                Window { start: 0, count: 3 },
                &ctx(),
                &SilentBatchProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BulkResearchError::Credentials(_)));
    }

    #[tokio::test]
    async fn errors_do_not_stop_the_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let outcome = scheduler(&server, Some("k"), Duration::ZERO)
            .run_window(
                &entities(4),
                Window { start: 0, count: 4 },
                &ctx(),
                &SilentBatchProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, WindowStatus::Completed);
        assert_eq!(outcome.processed, 4);
        assert!(outcome.records.values().all(|r| !r.is_success()));
    }

    #[tokio::test]
    async fn cancel_during_delay_stops_window() {
        let server = ok_server().await;
        let list = entities(5);
        let cancel = CancellationToken::new();
        let progress = RecordingProgress {
            cancel_after: Some((1, cancel.clone())),
            ..Default::default()
        };

        let started = std::time::Instant::now();
        let outcome = scheduler(&server, Some("k"), Duration::from_secs(30))
            .run_window(&list, Window { start: 0, count: 5 }, &ctx(), &progress, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, WindowStatus::Cancelled);
        assert_eq!(outcome.processed, 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn duplicate_identifiers_collapse_to_later_record() {
        let server = ok_server().await;
        let list = vec![
            Entity::new("https://acme.io", Some("First")).unwrap(),
            Entity::new("https://acme.io", Some("Second")).unwrap(),
        ];

        let outcome = scheduler(&server, Some("k"), Duration::ZERO)
            .run_window(
                &list,
                Window { start: 0, count: 2 },
                &ctx(),
                &SilentBatchProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records["https://acme.io"].display_name, "Second");
    }

    #[tokio::test]
    async fn request_abandoned_mid_flight_counts_as_dispatched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "openai": "late" }))
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = scheduler(&server, Some("k"), Duration::ZERO)
            .run_window(
                &entities(3),
                Window { start: 0, count: 3 },
                &ctx(),
                &SilentBatchProgress,
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, WindowStatus::Cancelled);
        assert_eq!(outcome.processed, 0);
        assert_eq!(outcome.dispatched, 1);
        assert!(outcome.records.is_empty());
    }
}
