use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Investigation lifecycle

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[serde(alias = "PENDING")]
    Pending,
    #[serde(alias = "RUNNING")]
    Running,
    #[serde(alias = "COMPLETE")]
    Complete,
    #[serde(alias = "ERROR")]
    Error,
}

impl RunStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialParameters {
    pub phase: String,
    pub indication: String,
    pub target_enrollment: u32,
    pub duration_months: u32,
    pub target_sites: u32,
}

impl Default for TrialParameters {
    fn default() -> Self {
        Self {
            phase: "Phase III".to_string(),
            indication: "Oncology".to_string(),
            target_enrollment: 200,
            duration_months: 18,
            target_sites: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationKind {
    SiteAnalysis,
    TrialMonitoring,
}

impl InvestigationKind {
    /// Agents that make up this kind of investigation, in execution order.
    #[must_use]
    pub fn roster(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::SiteAnalysis => &[("strategist", "Site Selection Strategist")],
            Self::TrialMonitoring => &[
                ("enrollment_monitor", "Enrollment Monitor"),
                ("forecaster", "Predictive Forecaster"),
                ("advisor", "Strategic Advisor"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobRequest {
    TrialMonitoring { trial_id: String },
    SiteAnalysis(TrialParameters),
}

impl JobRequest {
    #[must_use]
    pub fn kind(&self) -> InvestigationKind {
        match self {
            Self::SiteAnalysis(_) => InvestigationKind::SiteAnalysis,
            Self::TrialMonitoring { .. } => InvestigationKind::TrialMonitoring,
        }
    }
}

/// Immutable record pairing a submitted investigation with the request that
/// started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationHandle {
    investigation_id: String,
    trial_id: Option<String>,
    kind: InvestigationKind,
    request: JobRequest,
    submitted_status: RunStatus,
}

impl InvestigationHandle {
    #[must_use]
    pub fn new(
        investigation_id: impl Into<String>,
        trial_id: Option<String>,
        request: JobRequest,
        submitted_status: RunStatus,
    ) -> Self {
        Self {
            investigation_id: investigation_id.into(),
            trial_id,
            kind: request.kind(),
            request,
            submitted_status,
        }
    }

    #[must_use]
    pub fn investigation_id(&self) -> &str {
        &self.investigation_id
    }

    #[must_use]
    pub fn trial_id(&self) -> Option<&str> {
        self.trial_id.as_deref()
    }

    #[must_use]
    pub fn kind(&self) -> InvestigationKind {
        self.kind
    }

    #[must_use]
    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    #[must_use]
    pub fn trial_parameters(&self) -> Option<&TrialParameters> {
        match &self.request {
            JobRequest::SiteAnalysis(params) => Some(params),
            JobRequest::TrialMonitoring { .. } => None,
        }
    }

    #[must_use]
    pub fn submitted_status(&self) -> RunStatus {
        self.submitted_status
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub name: String,
    #[serde(default)]
    pub output: String,
    #[serde(default, deserialize_with = "lenient_time::option")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    #[serde(alias = "name")]
    pub agent_name: String,
    pub status: RunStatus,
    #[serde(default, deserialize_with = "lenient_time::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_time::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: Vec<TaskInfo>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvestigationStatus {
    pub investigation_id: String,
    pub status: RunStatus,
    #[serde(deserialize_with = "lenient_time::required")]
    pub started_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_time::option")]
    pub completed_at: Option<DateTime<Utc>>,
    pub agents: Vec<AgentStatus>,
    #[serde(default)]
    pub final_report: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

// Site selection

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteType {
    Academic,
    Community,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub site_id: String,
    pub site_name: String,
    pub city: String,
    pub state: String,
    pub site_type: SiteType,
    pub trials_completed: u32,
    pub avg_enrollment_rate: f64,
    pub avg_screen_fail_rate: f64,
    pub avg_dropout_rate: f64,
    pub data_quality_score: f64,
    pub avg_days_to_first_patient: u32,
    pub protocol_deviations_per_trial: f64,
    pub eligible_patients_30mi: u32,
    pub competing_trials_same_indication: u32,
    pub travel_burden_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteClassification {
    HiddenGem,
    SafeChoice,
    Acceptable,
    #[serde(alias = "avoid")]
    Risky,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub performance: f64,
    pub patient_access: f64,
    pub data_quality: f64,
    pub logistics: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecommendation {
    pub rank: u32,
    pub site_id: String,
    pub site_name: String,
    pub city: String,
    pub state: String,
    pub composite_score: f64,
    pub component_scores: ComponentScores,
    pub historical_enrollment_rate: f64,
    pub eligible_patients: u32,
    pub competing_trials: u32,
    pub data_quality_score: f64,
    pub reasoning: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    pub site_classification: SiteClassification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteAnalysisResult {
    pub analysis_id: String,
    #[serde(default)]
    pub trial_id: Option<String>,
    pub top_recommendations: Vec<SiteRecommendation>,
    pub total_sites_analyzed: u32,
    pub sites_filtered_out: u32,
    #[serde(default)]
    pub filter_reasons: BTreeMap<String, u32>,
    #[serde(deserialize_with = "lenient_time::required")]
    pub analysis_timestamp: DateTime<Utc>,
    pub trial_params: TrialParameters,
}

// Trial monitoring

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyEnrollment {
    pub week: u32,
    pub week_ending_date: NaiveDate,
    pub site_id: String,
    pub patients_screened: u32,
    pub patients_enrolled: u32,
    #[serde(default)]
    pub screen_fail_reasons: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteDescriptor {
    pub site_id: String,
    pub site_name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    /// Per-site enrollment goal; defaults to an even share of the trial target.
    #[serde(default)]
    pub target_enrollment: Option<u32>,
    /// Weekly enrollment rate from previous trials, used for replacements.
    #[serde(default)]
    pub historical_weekly_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentTrend {
    Improving,
    Stable,
    Declining,
    Flatlined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteEnrollmentStatus {
    pub site_id: String,
    pub site_name: String,
    pub city: String,
    pub state: String,
    pub total_enrolled: u32,
    pub total_screened: u32,
    pub weeks_active: u32,
    pub current_enrollment_rate: f64,
    pub weekly_average: f64,
    pub trend: EnrollmentTrend,
    pub target_enrollment: u32,
    pub expected_enrollment_to_date: f64,
    pub percent_to_target: f64,
    pub projected_final_enrollment: u32,
    pub is_underperforming: bool,
    pub weeks_since_last_enrollment: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastDataPoint {
    pub week: u32,
    pub date: NaiveDate,
    #[serde(default)]
    pub actual_enrollment: Option<u32>,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentForecast {
    pub trial_id: String,
    pub forecast_date: NaiveDate,
    pub weeks_elapsed: u32,
    pub total_weeks: u32,
    pub current_total_enrolled: u32,
    pub target_total_enrollment: u32,
    pub run_rate: f64,
    pub forecast_curve: Vec<ForecastDataPoint>,
    /// Week-ending date at which the median curve reaches target, if it does.
    pub projected_completion_date: Option<NaiveDate>,
    pub probability_of_meeting_target: f64,
    pub expected_final_enrollment: u32,
    pub best_case_enrollment: u32,
    pub worst_case_enrollment: u32,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Flatlined,
    Underperforming,
    DecliningTrend,
}

impl AlertType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flatlined => "flatlined",
            Self::Underperforming => "underperforming",
            Self::DecliningTrend => "declining_trend",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteAlert {
    pub alert_id: Uuid,
    pub site_id: String,
    pub site_name: String,
    pub severity: AlertSeverity,
    pub alert_type: AlertType,
    pub message: String,
    pub details: String,
    pub weeks_since_last_enrollment: Option<u32>,
    pub current_enrollment: u32,
    pub target_enrollment: u32,
    pub shortfall_percent: f64,
    pub recommended_actions: Vec<String>,
    pub estimated_impact: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    #[serde(alias = "add_budget")]
    AddRecruitmentBudget,
    ReplaceSite,
    #[serde(alias = "extend_duration")]
    ExtendTrialDuration,
    #[serde(alias = "increase_support")]
    IncreaseSiteSupport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportLevel {
    Low,
    Medium,
    High,
}

/// What-if request as it travels on the wire: one flat record whose
/// intervention-specific fields must match `intervention_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatIfScenario {
    pub scenario_id: String,
    pub intervention_type: InterventionType,
    #[serde(default)]
    pub target_site_id: Option<String>,
    #[serde(default)]
    pub budget_amount: Option<u64>,
    #[serde(default)]
    pub replacement_site_id: Option<String>,
    #[serde(default)]
    pub extension_weeks: Option<u32>,
    #[serde(default)]
    pub support_level: Option<SupportLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiAssessment {
    Excellent,
    Good,
    Poor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatIfResult {
    pub scenario_id: String,
    pub intervention_type: InterventionType,
    pub intervention_description: String,
    pub baseline_projected_enrollment: u32,
    pub baseline_probability_meeting_target: f64,
    pub scenario_projected_enrollment: u32,
    pub scenario_probability_meeting_target: f64,
    pub enrollment_improvement: i64,
    pub probability_improvement: f64,
    pub estimated_cost: u64,
    /// `None` when the intervention is free but still changes enrollment.
    pub patients_per_dollar: Option<f64>,
    pub roi_assessment: RoiAssessment,
    #[serde(default)]
    pub scenario_forecast_curve: Vec<ForecastDataPoint>,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMonitoringResult {
    pub monitor_id: String,
    pub trial_id: String,
    pub site_statuses: Vec<SiteEnrollmentStatus>,
    pub enrollment_forecast: EnrollmentForecast,
    pub alerts: Vec<SiteAlert>,
    pub total_enrolled: u32,
    pub total_screened: u32,
    pub on_track_sites: u32,
    pub at_risk_sites: u32,
    pub critical_sites: u32,
    pub analysis_timestamp: DateTime<Utc>,
}

/// Timestamps from the analysis server may be RFC 3339 or naive ISO-8601;
/// naive values are read as UTC.
pub(crate) mod lenient_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    pub(crate) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|value| value.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    }

    pub(crate) fn required<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub(crate) fn option<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            None => Ok(None),
            Some(raw) => parse(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_accepts_naive_and_uppercase_wire_values() {
        let raw = r#"{
            "investigation_id": "inv-1",
            "status": "RUNNING",
            "started_at": "2024-07-01T09:30:00.123456",
            "completed_at": null,
            "agents": [
                {"agent_id": "strategist", "agent_name": "Site Selection Strategist",
                 "status": "running", "tasks": []}
            ]
        }"#;
        let status: InvestigationStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.status, RunStatus::Running);
        assert_eq!(
            status.started_at.date_naive(),
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
        );
        assert!(status.final_report.is_none());
        assert_eq!(status.agents[0].started_at, None);
    }

    #[test]
    fn rfc3339_timestamps_keep_their_instant() {
        let parsed = lenient_time::parse("2024-07-01T12:00:00+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 7, 1, 10, 0, 0).unwrap());
        assert!(lenient_time::parse("yesterday").is_none());
    }

    #[test]
    fn job_request_serializes_either_shape() {
        let monitoring = JobRequest::TrialMonitoring {
            trial_id: "trial-9".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&monitoring).unwrap(),
            serde_json::json!({"trial_id": "trial-9"})
        );

        let parsed: JobRequest = serde_json::from_value(serde_json::json!({
            "phase": "Phase II", "indication": "Cardiology",
            "target_enrollment": 120, "duration_months": 12, "target_sites": 6
        }))
        .unwrap();
        assert_eq!(parsed.kind(), InvestigationKind::SiteAnalysis);
    }

    #[test]
    fn intervention_aliases_match_legacy_names() {
        let parsed: InterventionType = serde_json::from_str("\"add_budget\"").unwrap();
        assert_eq!(parsed, InterventionType::AddRecruitmentBudget);
        assert_eq!(
            serde_json::to_string(&InterventionType::ExtendTrialDuration).unwrap(),
            "\"extend_trial_duration\""
        );
    }

    #[test]
    fn handle_exposes_trial_parameters_only_for_site_analysis() {
        let handle = InvestigationHandle::new(
            "inv-7",
            Some("trial-7".to_string()),
            JobRequest::SiteAnalysis(TrialParameters::default()),
            RunStatus::Running,
        );
        assert_eq!(handle.kind(), InvestigationKind::SiteAnalysis);
        assert_eq!(handle.trial_parameters().unwrap().target_enrollment, 200);
        assert_eq!(handle.trial_id(), Some("trial-7"));
    }
}
