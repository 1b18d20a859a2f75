use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact;
use crate::error::TrackerError;
use crate::models::{
    InvestigationHandle, InvestigationStatus, JobRequest, RunStatus, SiteAnalysisResult,
    TrialMonitoringResult, TrialParameters, WhatIfResult, WhatIfScenario,
};
use crate::poller::StatusSource;

#[derive(Debug, Clone, Deserialize)]
struct SubmissionResponse {
    #[serde(alias = "analysis_id", alias = "monitor_id")]
    investigation_id: String,
    #[serde(default)]
    trial_id: Option<String>,
    #[serde(default = "submitted_running")]
    status: RunStatus,
}

fn submitted_running() -> RunStatus {
    RunStatus::Running
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAck {
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

pub struct InvestigationClient {
    http: reqwest::Client,
    base_url: String,
}

impl InvestigationClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, TrackerError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("trial-investigation-tracker/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn submit(&self, request: JobRequest) -> Result<InvestigationHandle, TrackerError> {
        let resp = self
            .http
            .post(self.url("investigations"))
            .json(&request)
            .send()
            .await?;
        let submitted: SubmissionResponse = read_json(resp).await?;
        tracing::info!(
            investigation_id = %submitted.investigation_id,
            kind = ?request.kind(),
            "investigation submitted"
        );
        Ok(InvestigationHandle::new(
            submitted.investigation_id,
            submitted.trial_id,
            request,
            submitted.status,
        ))
    }

    pub async fn start_site_analysis(
        &self,
        params: TrialParameters,
    ) -> Result<InvestigationHandle, TrackerError> {
        self.submit(JobRequest::SiteAnalysis(params)).await
    }

    pub async fn start_trial_monitoring(
        &self,
        trial_id: impl Into<String>,
    ) -> Result<InvestigationHandle, TrackerError> {
        self.submit(JobRequest::TrialMonitoring {
            trial_id: trial_id.into(),
        })
        .await
    }

    pub async fn status(&self, investigation_id: &str) -> Result<InvestigationStatus, TrackerError> {
        let resp = self
            .http
            .get(self.url(&format!("investigations/{investigation_id}/status")))
            .send()
            .await?;
        read_json(resp).await
    }

    async fn results_body(&self, investigation_id: &str) -> Result<String, TrackerError> {
        let resp = self
            .http
            .get(self.url(&format!("investigations/{investigation_id}/results")))
            .send()
            .await?;
        Ok(check_response(resp).await?.text().await?)
    }

    /// Fetches and validates the ranked recommendations of a completed site
    /// analysis. A body that does not match the schema is a
    /// [`TrackerError::MalformedArtifact`], never an empty result.
    pub async fn site_analysis_results(
        &self,
        investigation_id: &str,
    ) -> Result<SiteAnalysisResult, TrackerError> {
        let body = self.results_body(investigation_id).await?;
        artifact::parse_site_analysis(&body)
    }

    pub async fn monitoring_results(
        &self,
        investigation_id: &str,
    ) -> Result<TrialMonitoringResult, TrackerError> {
        let body = self.results_body(investigation_id).await?;
        artifact::parse_monitoring_result(&body)
    }

    pub async fn what_if(&self, scenario: &WhatIfScenario) -> Result<WhatIfResult, TrackerError> {
        crate::whatif::Intervention::from_scenario(scenario)?;
        let resp = self
            .http
            .post(self.url("investigations/what-if"))
            .json(scenario)
            .send()
            .await?;
        read_json(resp).await
    }

    pub async fn health(&self) -> Result<HealthStatus, TrackerError> {
        let resp = self.http.get(self.url("health")).send().await?;
        read_json(resp).await
    }

    pub async fn regenerate_data(&self) -> Result<AdminAck, TrackerError> {
        let resp = self.http.post(self.url("data/generate")).send().await?;
        read_json(resp).await
    }

    pub async fn reset(&self) -> Result<AdminAck, TrackerError> {
        let resp = self.http.post(self.url("reset")).send().await?;
        read_json(resp).await
    }
}

#[async_trait]
impl StatusSource for InvestigationClient {
    async fn fetch_status(&self, investigation_id: &str) -> Result<InvestigationStatus, TrackerError> {
        self.status(investigation_id).await
    }
}

pub async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, TrackerError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TrackerError::Api {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

/// Decodes a successful JSON body. Decoding failures are
/// [`TrackerError::MalformedResponse`], which the poller does not retry.
async fn read_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, TrackerError> {
    let body = check_response(resp).await?.text().await?;
    serde_json::from_str(&body).map_err(TrackerError::MalformedResponse)
}

/// The service reports errors as `{"error": ..., "message": ...}`; fall back
/// to the raw body for anything else.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<String>,
        message: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(error), ..
        }) => error,
        Ok(ErrorBody {
            message: Some(message),
            ..
        }) => message,
        _ => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_without_double_slashes() {
        let client = InvestigationClient::new("http://localhost:5000/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:5000/api");
        assert_eq!(
            client.url("/investigations/abc/status"),
            "http://localhost:5000/api/investigations/abc/status"
        );
    }

    #[test]
    fn error_message_prefers_error_field() {
        assert_eq!(
            error_message(r#"{"error": "Analysis not found", "analysis_id": "x"}"#),
            "Analysis not found"
        );
        assert_eq!(
            error_message(r#"{"message": "Failed to start site analysis"}"#),
            "Failed to start site analysis"
        );
        assert_eq!(error_message("  gateway timeout \n"), "gateway timeout");
    }

    #[test]
    fn submission_accepts_legacy_id_fields() {
        let parsed: SubmissionResponse = serde_json::from_str(
            r#"{"monitor_id": "m-1", "trial_id": "t-1", "status": "running", "message": "ok"}"#,
        )
        .unwrap();
        assert_eq!(parsed.investigation_id, "m-1");
        assert_eq!(parsed.trial_id.as_deref(), Some("t-1"));

        let parsed: SubmissionResponse =
            serde_json::from_str(r#"{"investigation_id": "i-1"}"#).unwrap();
        assert_eq!(parsed.status, RunStatus::Running);
    }

    fn mock_response(status: u16, body: &'static str) -> reqwest::Response {
        reqwest::Response::from(::http::Response::builder().status(status).body(body).unwrap())
    }

    #[tokio::test]
    async fn undecodable_status_body_is_not_reported_as_a_bad_artifact() {
        let err = read_json::<InvestigationStatus>(mock_response(200, "<html>gateway</html>"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::MalformedResponse(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Api);
        assert!(!err.is_transient());

        let err = read_json::<InvestigationStatus>(mock_response(503, r#"{"error": "busy"}"#))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn what_if_rejects_mismatched_scenarios_before_sending() {
        let client = InvestigationClient::new("http://127.0.0.1:9", Duration::from_millis(50)).unwrap();
        let scenario = WhatIfScenario {
            scenario_id: "s-1".to_string(),
            intervention_type: crate::models::InterventionType::ExtendTrialDuration,
            target_site_id: None,
            budget_amount: Some(10_000),
            replacement_site_id: None,
            extension_weeks: None,
            support_level: None,
        };
        let err = client.what_if(&scenario).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidScenario);
    }
}
