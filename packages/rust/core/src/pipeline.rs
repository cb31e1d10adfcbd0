//! Per-entity request pipeline: entity → payload → endpoint → [`ResultRecord`].
//!
//! Every outcome short of cancellation becomes a record, so a failed entity
//! never stops the batch.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use bulkresearch_client::{ResearchClient, ResearchRequest, ResearchResponse, Submission};
use bulkresearch_shared::{CapabilityFlags, Entity, ModelSelection, ModelTier, ResultRecord, RunSettings};

use crate::query::{build_capability_flags, build_query, config_summary};

/// Everything constant across the requests of one window.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub settings: RunSettings,
    pub flags: CapabilityFlags,
    pub tier: ModelTier,
    pub config_summary: String,
}

impl RunContext {
    /// Context for dispatching `settings` with the resolved `tier`.
    pub fn new(settings: &RunSettings, tier: ModelTier) -> Self {
        Self {
            settings: settings.clone(),
            flags: build_capability_flags(settings.category),
            tier,
            config_summary: config_summary(settings, tier),
        }
    }
}

/// What became of one entity.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Recorded(ResultRecord),
    /// Cancelled before the request went out; nothing is recorded.
    Skipped,
    /// Sent, then abandoned on cancellation before a response arrived.
    /// Nothing is recorded, but the request still counts as dispatched.
    Aborted,
}

impl ProcessOutcome {
    /// Whether a request reached the endpoint.
    pub fn was_dispatched(&self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

/// Turns one entity into one result record.
#[derive(Debug, Clone)]
pub struct RequestPipeline {
    client: ResearchClient,
}

impl RequestPipeline {
    pub fn new(client: ResearchClient) -> Self {
        Self { client }
    }

    pub fn has_credentials(&self) -> bool {
        self.client.has_credentials()
    }

    /// Assemble the outbound payload for `entity`.
    pub fn build_request(&self, entity: &Entity, ctx: &RunContext) -> ResearchRequest {
        let settings = &ctx.settings;
        let options = &settings.options;

        ResearchRequest {
            query: build_query(settings.category, entity, settings.user_intent.as_deref()),
            category: settings.category,
            depth: settings.depth,
            timeframe: options.timeframe.clone(),
            geographic_scope: options.geographic_scope.clone(),
            website_url: entity.identifier().to_string(),
            website_url_2: None,
            company_size: options.company_size.clone(),
            revenue_category: options.revenue_category.clone(),
            web_search_enabled: options.web_search_enabled,
            excel_data: None,
            excel_file_name: settings.source_name.clone(),
            deep_research: true,
            flags: ctx.flags,
            perplexity_model: ctx.tier,
            selected_models: settings.models.as_map().clone(),
            using_web_search: options.web_search_enabled,
            config_summary: ctx.config_summary.clone(),
            analysis_type: settings.analysis_type,
            multi_gpt_output_format: options.output_format.clone(),
        }
    }

    /// Research one entity.
    ///
    /// A response that arrives is always recorded, even if `cancel` fires
    /// in the same instant.
    #[instrument(skip_all, fields(entity = %entity.identifier(), index = index))]
    pub async fn process(
        &self,
        entity: &Entity,
        index: usize,
        ctx: &RunContext,
        cancel: &CancellationToken,
    ) -> ProcessOutcome {
        if cancel.is_cancelled() {
            return ProcessOutcome::Skipped;
        }

        let request = self.build_request(entity, ctx);

        let submission = tokio::select! {
            biased;
            result = self.client.submit(&request) => result,
            _ = cancel.cancelled() => {
                debug!("request abandoned on cancellation");
                return ProcessOutcome::Aborted;
            }
        };

        let (per_model_output, error) = match submission {
            Ok(Submission::Success(response)) => {
                (Some(normalize_outputs(&response, &ctx.settings.models)), None)
            }
            Ok(Submission::Rejected { status, body }) => {
                warn!(status, "research request rejected");
                let detail = if body.is_empty() {
                    String::new()
                } else {
                    format!(": {body}")
                };
                (
                    None,
                    Some(format!(
                        "Request for {} failed with status {status}{detail}",
                        entity.identifier()
                    )),
                )
            }
            Err(e) => {
                warn!(error = %e, "research request failed");
                (
                    None,
                    Some(format!("Request for {} failed: {e}", entity.identifier())),
                )
            }
        };

        ProcessOutcome::Recorded(ResultRecord {
            entity_id: entity.identifier().to_string(),
            display_name: entity.display_name().to_string(),
            per_model_output,
            error,
            processed_at: Utc::now(),
            processing_index: index,
        })
    }
}

/// One text slot per selected model.
///
/// Missing output becomes `Error: <message>` when the endpoint said why,
/// otherwise `No response from <model>`.
pub fn normalize_outputs(
    response: &ResearchResponse,
    models: &ModelSelection,
) -> BTreeMap<String, String> {
    models
        .selected()
        .map(|model| {
            let text = match response.output(model) {
                Some(out) => out.to_string(),
                None => match response.error_for(model) {
                    Some(message) => format!("Error: {message}"),
                    None => format!("No response from {model}"),
                },
            };
            (model.to_string(), text)
        })
        .collect()
}
