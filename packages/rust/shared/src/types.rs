//! Core domain types for bulk research runs.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BulkResearchError;

// ---------------------------------------------------------------------------
// ResearchCategory
// ---------------------------------------------------------------------------

/// What kind of research a batch run performs. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchCategory {
    GeneralResearch,
    MarketAnalysis,
    SalesOpportunities,
    CompetitiveAnalysis,
    CompanyProfile,
    IndustryTrends,
    InvestmentResearch,
}

impl ResearchCategory {
    /// Every category, in display order.
    pub const ALL: [ResearchCategory; 7] = [
        Self::GeneralResearch,
        Self::MarketAnalysis,
        Self::SalesOpportunities,
        Self::CompetitiveAnalysis,
        Self::CompanyProfile,
        Self::IndustryTrends,
        Self::InvestmentResearch,
    ];

    /// Wire name sent to the research endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GeneralResearch => "general_research",
            Self::MarketAnalysis => "market_analysis",
            Self::SalesOpportunities => "sales_opportunities",
            Self::CompetitiveAnalysis => "competitive_analysis",
            Self::CompanyProfile => "company_profile",
            Self::IndustryTrends => "industry_trends",
            Self::InvestmentResearch => "investment_research",
        }
    }
}

// ---------------------------------------------------------------------------
// DepthLevel / AnalysisType
// ---------------------------------------------------------------------------

/// How deep the research goes. Exactly one per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthLevel {
    Basic,
    Standard,
    Comprehensive,
}

impl DepthLevel {
    pub const ALL: [DepthLevel; 3] = [Self::Basic, Self::Standard, Self::Comprehensive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Standard => "standard",
            Self::Comprehensive => "comprehensive",
        }
    }
}

/// Whether each entity is analyzed on its own or against the rest of the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    #[default]
    Individual,
    Comparative,
}

impl AnalysisType {
    pub const ALL: [AnalysisType; 2] = [Self::Individual, Self::Comparative];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Comparative => "comparative",
        }
    }
}

// ---------------------------------------------------------------------------
// ModelTier
// ---------------------------------------------------------------------------

/// The external-model variant a run is dispatched with.
///
/// Ordered from cheapest to most expensive; [`ModelTier::downgrade`] walks
/// one step down and bottoms out at [`ModelTier::Sonar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelTier {
    #[serde(rename = "sonar")]
    Sonar,
    #[serde(rename = "sonar-pro")]
    SonarPro,
    #[serde(rename = "sonar-reasoning-pro")]
    SonarReasoningPro,
    #[serde(rename = "sonar-deep-research")]
    SonarDeepResearch,
}

impl ModelTier {
    pub const ALL: [ModelTier; 4] = [
        Self::Sonar,
        Self::SonarPro,
        Self::SonarReasoningPro,
        Self::SonarDeepResearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sonar => "sonar",
            Self::SonarPro => "sonar-pro",
            Self::SonarReasoningPro => "sonar-reasoning-pro",
            Self::SonarDeepResearch => "sonar-deep-research",
        }
    }

    /// The tier a run of this category and depth asks for.
    pub fn for_run(category: ResearchCategory, depth: DepthLevel) -> Self {
        match depth {
            DepthLevel::Basic => Self::Sonar,
            DepthLevel::Standard => Self::SonarPro,
            DepthLevel::Comprehensive => match category {
                ResearchCategory::GeneralResearch => Self::SonarReasoningPro,
                _ => Self::SonarDeepResearch,
            },
        }
    }

    /// Next cheaper tier; the minimal tier downgrades to itself.
    pub fn downgrade(&self) -> Self {
        match self {
            Self::SonarDeepResearch => Self::SonarReasoningPro,
            Self::SonarReasoningPro => Self::SonarPro,
            Self::SonarPro | Self::Sonar => Self::Sonar,
        }
    }
}

// ---------------------------------------------------------------------------
// FromStr / Display for the closed enums
// ---------------------------------------------------------------------------

macro_rules! str_enum {
    ($ty:ident, $what:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = BulkResearchError;

            /// Accepts the wire name with either `_` or `-` separators.
            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
                Self::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str().replace('_', "-") == wanted)
                    .ok_or_else(|| {
                        BulkResearchError::validation(format!(concat!("unknown ", $what, ": {}"), s))
                    })
            }
        }
    };
}

str_enum!(ResearchCategory, "research category");
str_enum!(DepthLevel, "depth level");
str_enum!(AnalysisType, "analysis type");
str_enum!(ModelTier, "model tier");

// ---------------------------------------------------------------------------
// Capability flags
// ---------------------------------------------------------------------------

/// Per-category switches sent alongside each research request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFlags {
    pub include_founders: bool,
    pub include_products: bool,
    pub include_employee_count: bool,
    pub include_revenue_data: bool,
    pub extract_company_info: bool,
    pub analyze_prospective_clients: bool,
    pub analyze_sales_opportunities: bool,
    pub focus_on_leads: bool,
}

// ---------------------------------------------------------------------------
// ModelSelection
// ---------------------------------------------------------------------------

/// Model name → included flag. Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelSelection(BTreeMap<String, bool>);

impl ModelSelection {
    /// Select exactly the given model names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(|n| (n.into(), true)).collect())
    }

    /// Names of included models, sorted.
    pub fn selected(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, included)| **included)
            .map(|(name, _)| name.as_str())
    }

    pub fn is_selected(&self, model: &str) -> bool {
        self.0.get(model).copied().unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.selected().next().is_none()
    }

    /// The raw map, as sent on the wire.
    pub fn as_map(&self) -> &BTreeMap<String, bool> {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Run settings
// ---------------------------------------------------------------------------

/// Optional qualifiers forwarded verbatim to the research endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geographic_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revenue_category: Option<String>,
    #[serde(default = "default_true")]
    pub web_search_enabled: bool,
    /// Requested multi-model output format, if the endpoint should deviate from its default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

impl Default for ResearchOptions {
    fn default() -> Self {
        Self {
            timeframe: None,
            geographic_scope: None,
            company_size: None,
            revenue_category: None,
            web_search_enabled: true,
            output_format: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Everything that is fixed for one bulk run, persisted with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSettings {
    pub category: ResearchCategory,
    pub depth: DepthLevel,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    /// Free-text intent; only shapes the query for general research.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_intent: Option<String>,
    pub models: ModelSelection,
    #[serde(default)]
    pub options: ResearchOptions,
    /// Name of the file the entity list came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    /// Entities per checkpoint window.
    pub window_size: usize,
}

// ---------------------------------------------------------------------------
// ResultRecord
// ---------------------------------------------------------------------------

/// The outcome of researching one entity. Created once, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub entity_id: String,
    pub display_name: String,
    /// One slot per selected model; absent when the request failed as a whole.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_model_output: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
    /// Position of the entity in the full entity list.
    pub processing_index: usize,
}

impl ResultRecord {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Records keyed by entity identifier.
pub type ResultMap = HashMap<String, ResultRecord>;

// ---------------------------------------------------------------------------
// BudgetSnapshot
// ---------------------------------------------------------------------------

/// Read-only view of the constrained tier's usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub used: u64,
    pub total: u64,
    pub percentage: f64,
}

impl BudgetSnapshot {
    pub fn new(used: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            100.0
        } else {
            (used as f64 / total as f64) * 100.0
        };
        Self {
            used,
            total,
            percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parses_both_separators() {
        assert_eq!(
            "sales_opportunities".parse::<ResearchCategory>().unwrap(),
            ResearchCategory::SalesOpportunities
        );
        assert_eq!(
            "market-analysis".parse::<ResearchCategory>().unwrap(),
            ResearchCategory::MarketAnalysis
        );
        assert!("astrology".parse::<ResearchCategory>().is_err());
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&ResearchCategory::GeneralResearch).unwrap();
        assert_eq!(json, r#""general_research""#);
    }

    #[test]
    fn tier_for_run() {
        assert_eq!(
            ModelTier::for_run(ResearchCategory::MarketAnalysis, DepthLevel::Basic),
            ModelTier::Sonar
        );
        assert_eq!(
            ModelTier::for_run(ResearchCategory::MarketAnalysis, DepthLevel::Comprehensive),
            ModelTier::SonarDeepResearch
        );
        assert_eq!(
            ModelTier::for_run(ResearchCategory::GeneralResearch, DepthLevel::Comprehensive),
            ModelTier::SonarReasoningPro
        );
    }

    #[test]
    fn tier_downgrade_bottoms_out() {
        let mut tier = ModelTier::SonarDeepResearch;
        for _ in 0..10 {
            tier = tier.downgrade();
        }
        assert_eq!(tier, ModelTier::Sonar);
        assert_eq!("sonar-pro".parse::<ModelTier>().unwrap(), ModelTier::SonarPro);
    }

    #[test]
    fn model_selection_filters_excluded() {
        let mut map = BTreeMap::new();
        map.insert("openai".to_string(), true);
        map.insert("claude".to_string(), false);
        map.insert("perplexity".to_string(), true);
        let selection: ModelSelection =
            serde_json::from_value(serde_json::to_value(&map).unwrap()).unwrap();

        let names: Vec<&str> = selection.selected().collect();
        assert_eq!(names, vec!["openai", "perplexity"]);
        assert!(!selection.is_selected("claude"));
        assert!(!selection.is_selected("gemini"));
    }

    #[test]
    fn capability_flags_serialize_camel_case() {
        let flags = CapabilityFlags {
            focus_on_leads: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&flags).unwrap();
        assert!(json.contains(r#""focusOnLeads":true"#));
        assert!(json.contains(r#""includeEmployeeCount":false"#));
    }

    #[test]
    fn budget_snapshot_percentage() {
        let snap = BudgetSnapshot::new(10, 40);
        assert!((snap.percentage - 25.0).abs() < f64::EPSILON);
        assert_eq!(BudgetSnapshot::new(0, 0).percentage, 100.0);
    }

    #[test]
    fn run_settings_roundtrip() {
        let settings = RunSettings {
            category: ResearchCategory::CompanyProfile,
            depth: DepthLevel::Standard,
            analysis_type: AnalysisType::Individual,
            user_intent: None,
            models: ModelSelection::from_names(["perplexity"]),
            options: ResearchOptions::default(),
            source_name: Some("leads.txt".into()),
            window_size: 20,
        };
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: RunSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }
}
