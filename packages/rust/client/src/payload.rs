//! Wire types for the research aggregation endpoint.
//!
//! The endpoint takes one camelCase JSON object per entity and answers with
//! an object keyed by model name, plus an optional `errors` map.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use bulkresearch_shared::{AnalysisType, CapabilityFlags, DepthLevel, ModelTier, ResearchCategory};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One outbound research request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchRequest {
    pub query: String,
    pub category: ResearchCategory,
    pub depth: DepthLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geographic_scope: Option<String>,
    pub website_url: String,
    #[serde(rename = "websiteUrl2", skip_serializing_if = "Option::is_none")]
    pub website_url_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue_category: Option<String>,
    pub web_search_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excel_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excel_file_name: Option<String>,
    /// Always `true` for bulk runs.
    pub deep_research: bool,
    #[serde(flatten)]
    pub flags: CapabilityFlags,
    pub perplexity_model: ModelTier,
    pub selected_models: BTreeMap<String, bool>,
    pub using_web_search: bool,
    /// Human-readable summary of the run configuration, for audit logs.
    pub config_summary: String,
    pub analysis_type: AnalysisType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multi_gpt_output_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// A successful endpoint response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResearchResponse {
    /// Per-model failures reported alongside the outputs.
    #[serde(default, deserialize_with = "non_null_errors")]
    pub errors: BTreeMap<String, ModelError>,
    /// Everything else, keyed by model name.
    #[serde(flatten)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl ResearchResponse {
    /// The model's text output, if it produced a non-empty string.
    pub fn output(&self, model: &str) -> Option<&str> {
        match self.outputs.get(model) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// The error message the endpoint carried for this model, if any.
    pub fn error_for(&self, model: &str) -> Option<String> {
        self.errors.get(model).map(ModelError::message)
    }
}

/// The `errors` map with `null` treated as absent, both for the whole map
/// and for individual entries.
fn non_null_errors<'de, D>(deserializer: D) -> Result<BTreeMap<String, ModelError>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Option<ModelError>>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(model, error)| error.map(|e| (model, e)))
        .collect())
}

/// A per-model error entry; the endpoint sends either a string or `{message}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModelError {
    Message(String),
    Detail { message: String },
    Other(serde_json::Value),
}

impl ModelError {
    pub fn message(&self) -> String {
        match self {
            Self::Message(m) | Self::Detail { message: m } => m.clone(),
            Self::Other(v) => v.to_string(),
        }
    }
}
