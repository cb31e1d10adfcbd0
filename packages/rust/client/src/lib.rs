//! HTTP transport for the research aggregation endpoint.
//!
//! This crate provides:
//! - [`payload`]: request/response wire types
//! - [`ResearchClient`]: authenticated POST with a per-request timeout
//!
//! The client does not know about cancellation; callers race
//! [`ResearchClient::submit`] against their own cancellation token.

pub mod payload;

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use bulkresearch_shared::{BatchConfig, BulkResearchError, Result};

pub use payload::{ModelError, ResearchRequest, ResearchResponse};

/// User-Agent string for research requests.
const USER_AGENT: &str = concat!("bulkresearch/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept from a rejected request.
const MAX_ERROR_BODY: usize = 500;

/// Outcome of a request that reached the endpoint.
#[derive(Debug, Clone)]
pub enum Submission {
    /// 2xx with a parseable body.
    Success(ResearchResponse),
    /// Non-2xx status, with the (truncated) response text.
    Rejected { status: u16, body: String },
}

/// Client for the research endpoint.
#[derive(Debug, Clone)]
pub struct ResearchClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    timeout: Duration,
}

impl ResearchClient {
    /// Create a client from the runtime batch configuration.
    pub fn new(config: &BatchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BulkResearchError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            timeout: config.request_timeout,
        })
    }

    /// Whether an API key is available.
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// POST one research request.
    ///
    /// Transport failures (including timeouts) and unparseable bodies are
    /// `Err`; a non-2xx status is a [`Submission::Rejected`].
    #[instrument(skip_all, fields(website = %request.website_url))]
    pub async fn submit(&self, request: &ResearchRequest) -> Result<Submission> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            BulkResearchError::Credentials("no API key configured for the research endpoint".into())
        })?;

        debug!(endpoint = %self.endpoint, model = %request.perplexity_model, "dispatching research request");

        let response = self
            .client
            .post(self.endpoint.as_str())
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BulkResearchError::Network(format!(
                        "request timed out after {}s",
                        self.timeout.as_secs()
                    ))
                } else {
                    BulkResearchError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BulkResearchError::Network(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            debug!(status = status.as_u16(), "research request rejected");
            return Ok(Submission::Rejected {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let parsed: ResearchResponse = serde_json::from_str(&body)
            .map_err(|e| BulkResearchError::parse(format!("invalid research response: {e}")))?;

        Ok(Submission::Success(parsed))
    }
}

/// Keep error bodies short enough for a status line.
fn truncate_body(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkresearch_shared::{AnalysisType, CapabilityFlags, DepthLevel, ModelTier, ResearchCategory};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, api_key: Option<&str>, timeout: Duration) -> BatchConfig {
        BatchConfig {
            endpoint: Url::parse(&format!("{}/api/research", server.uri())).unwrap(),
            api_key: api_key.map(String::from),
            request_delay: Duration::ZERO,
            request_timeout: timeout,
        }
    }

    fn request() -> ResearchRequest {
        ResearchRequest {
            query: "Research Acme".into(),
            category: ResearchCategory::GeneralResearch,
            depth: DepthLevel::Basic,
            timeframe: None,
            geographic_scope: None,
            website_url: "https://acme.io".into(),
            website_url_2: None,
            company_size: None,
            revenue_category: None,
            web_search_enabled: true,
            excel_data: None,
            excel_file_name: None,
            deep_research: true,
            flags: CapabilityFlags::default(),
            perplexity_model: ModelTier::Sonar,
            selected_models: [("openai".to_string(), true)].into_iter().collect(),
            using_web_search: true,
            config_summary: "test".into(),
            analysis_type: AnalysisType::Individual,
            multi_gpt_output_format: None,
        }
    }

    #[test]
    fn truncates_long_bodies() {
        assert_eq!(truncate_body("  short  "), "short");
        let long = "x".repeat(MAX_ERROR_BODY + 10);
        let out = truncate_body(&long);
        assert!(out.ends_with("..."));
        assert_eq!(out.len(), MAX_ERROR_BODY + 3);
    }

    #[tokio::test]
    async fn submit_success_sends_bearer_and_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/research"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "deepResearch": true,
                "websiteUrl": "https://acme.io",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "openai": "Acme makes anvils." })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client =
            ResearchClient::new(&config(&server, Some("test-key"), Duration::from_secs(5))).unwrap();
        match client.submit(&request()).await.unwrap() {
            Submission::Success(resp) => {
                assert_eq!(resp.output("openai"), Some("Acme makes anvils."));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_non_success_is_rejected_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let client =
            ResearchClient::new(&config(&server, Some("k"), Duration::from_secs(5))).unwrap();
        match client.submit(&request()).await.unwrap() {
            Submission::Rejected { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_invalid_json_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let client =
            ResearchClient::new(&config(&server, Some("k"), Duration::from_secs(5))).unwrap();
        let err = client.submit(&request()).await.unwrap_err();
        assert!(matches!(err, BulkResearchError::Parse { .. }));
    }

    #[tokio::test]
    async fn submit_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "openai": "late" }))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client =
            ResearchClient::new(&config(&server, Some("k"), Duration::from_millis(200))).unwrap();
        let err = client.submit(&request()).await.unwrap_err();
        assert!(matches!(err, BulkResearchError::Network(_)));
    }

    #[tokio::test]
    async fn submit_without_key_is_credentials_error() {
        let server = MockServer::start().await;
        let client = ResearchClient::new(&config(&server, None, Duration::from_secs(5))).unwrap();
        assert!(!client.has_credentials());
        let err = client.submit(&request()).await.unwrap_err();
        assert!(matches!(err, BulkResearchError::Credentials(_)));
    }
}
