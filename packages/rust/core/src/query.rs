//! Per-entity query text and capability flags.
//!
//! Both are pure functions of the run's category (and, for general research,
//! the user's free-text intent).

use bulkresearch_shared::{CapabilityFlags, Entity, ModelTier, ResearchCategory, RunSettings};

/// Build the natural-language request for one entity.
pub fn build_query(category: ResearchCategory, entity: &Entity, user_intent: Option<&str>) -> String {
    let name = entity.display_name();
    let id = entity.identifier();

    match category {
        ResearchCategory::GeneralResearch => {
            match user_intent.map(str::trim).filter(|i| !i.is_empty()) {
                Some(intent) => format!("{intent} for {name} at {id}"),
                None => format!(
                    "Research {name} at {id} and provide a comprehensive overview of the \
                     company, its offerings, and recent developments"
                ),
            }
        }
        ResearchCategory::MarketAnalysis => format!(
            "Conduct market analysis for {name} ({id}): market position, target segments, \
             growth trends, and key competitors"
        ),
        ResearchCategory::SalesOpportunities => format!(
            "Find sales opportunities with {name} ({id}): likely buying needs, decision \
             makers, current pain points, and promising outreach angles"
        ),
        ResearchCategory::CompetitiveAnalysis => format!(
            "Analyze the competitive landscape of {name} ({id}): main competitors, \
             differentiators, and relative strengths and weaknesses"
        ),
        ResearchCategory::CompanyProfile => format!(
            "Build a company profile for {name} ({id}): founders, products, employee count, \
             revenue, and headquarters"
        ),
        ResearchCategory::IndustryTrends => format!(
            "Identify industry trends affecting {name} ({id}): emerging technologies, \
             regulation, and shifts in demand"
        ),
        ResearchCategory::InvestmentResearch => format!(
            "Evaluate {name} ({id}) as an investment: funding history, financial health, \
             growth prospects, and key risks"
        ),
    }
}

/// Capability flags for a category.
///
/// General research suppresses company-profiling side data; only sales
/// opportunities turn on lead analysis.
pub fn build_capability_flags(category: ResearchCategory) -> CapabilityFlags {
    let profiling = category != ResearchCategory::GeneralResearch;
    let sales = category == ResearchCategory::SalesOpportunities;

    CapabilityFlags {
        include_founders: profiling,
        include_products: profiling,
        include_employee_count: profiling,
        include_revenue_data: profiling,
        extract_company_info: profiling,
        analyze_prospective_clients: profiling,
        analyze_sales_opportunities: sales,
        focus_on_leads: sales,
    }
}

/// One-line description of a run's configuration, sent as `configSummary`.
pub fn config_summary(settings: &RunSettings, tier: ModelTier) -> String {
    let models = settings.models.selected().collect::<Vec<_>>().join(",");
    let web = if settings.options.web_search_enabled {
        "on"
    } else {
        "off"
    };

    let mut summary = format!(
        "category={} depth={} analysis={} tier={} models={} web_search={}",
        settings.category, settings.depth, settings.analysis_type, tier, models, web
    );
    if let Some(scope) = &settings.options.geographic_scope {
        summary.push_str(&format!(" scope={scope}"));
    }
    if let Some(timeframe) = &settings.options.timeframe {
        summary.push_str(&format!(" timeframe={timeframe}"));
    }
    summary
}
