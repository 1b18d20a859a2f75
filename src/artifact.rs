use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ForecastConfig;
use crate::error::TrackerError;
use crate::models::{
    lenient_time, InvestigationStatus, RunStatus, SiteAnalysisResult, TrialMonitoringResult,
};
use crate::monitor::{self, MonitoringArtifact};
use crate::sites;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    SiteAnalysis,
    TrialMonitoring,
    MonitoringResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactEnvelope {
    pub schema_version: u32,
    pub kind: ArtifactKind,
    pub investigation_id: String,
    #[serde(deserialize_with = "lenient_time::required")]
    pub generated_at: DateTime<Utc>,
    pub data: Value,
    #[serde(default)]
    pub narrative: Option<String>,
}

impl ArtifactEnvelope {
    pub fn new<T: Serialize>(
        kind: ArtifactKind,
        investigation_id: impl Into<String>,
        generated_at: DateTime<Utc>,
        data: &T,
    ) -> Result<Self, TrackerError> {
        Ok(Self {
            schema_version: SCHEMA_VERSION,
            kind,
            investigation_id: investigation_id.into(),
            generated_at,
            data: serde_json::to_value(data)?,
            narrative: None,
        })
    }

    #[must_use]
    pub fn with_narrative(mut self, narrative: impl Into<String>) -> Self {
        self.narrative = Some(narrative.into());
        self
    }

    fn expect_kind(&self, allowed: &[ArtifactKind]) -> Result<(), TrackerError> {
        if allowed.contains(&self.kind) {
            Ok(())
        } else {
            Err(malformed(format!(
                "expected a {:?} artifact, got {:?}",
                allowed, self.kind
            )))
        }
    }
}

fn malformed(message: impl Into<String>) -> TrackerError {
    TrackerError::MalformedArtifact(message.into())
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, TrackerError> {
    serde_json::from_value(value).map_err(|err| malformed(format!("{what}: {err}")))
}

/// Parsed artifact: either a versioned envelope or a bare payload, as the
/// results endpoint returns.
enum Parsed {
    Envelope(ArtifactEnvelope),
    Bare(Value),
}

fn parse(raw: &str) -> Result<Parsed, TrackerError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| malformed(format!("final report is not structured JSON: {err}")))?;
    if !value.is_object() {
        return Err(malformed("final report is not a JSON object"));
    }
    if value.get("schema_version").is_none() {
        return Ok(Parsed::Bare(value));
    }

    let envelope: ArtifactEnvelope = decode(value, "artifact envelope")?;
    if envelope.schema_version != SCHEMA_VERSION {
        return Err(malformed(format!(
            "unsupported schema_version {} (expected {SCHEMA_VERSION})",
            envelope.schema_version
        )));
    }
    Ok(Parsed::Envelope(envelope))
}

pub fn parse_envelope(raw: &str) -> Result<ArtifactEnvelope, TrackerError> {
    match parse(raw)? {
        Parsed::Envelope(envelope) => Ok(envelope),
        Parsed::Bare(_) => Err(malformed("artifact has no schema_version")),
    }
}

pub fn parse_site_analysis(raw: &str) -> Result<SiteAnalysisResult, TrackerError> {
    let result: SiteAnalysisResult = match parse(raw)? {
        Parsed::Envelope(envelope) => {
            envelope.expect_kind(&[ArtifactKind::SiteAnalysis])?;
            decode(envelope.data, "site analysis")?
        }
        Parsed::Bare(value) => decode(value, "site analysis")?,
    };
    validate_site_analysis(&result)?;
    Ok(result)
}

pub fn validate_site_analysis(result: &SiteAnalysisResult) -> Result<(), TrackerError> {
    sites::validate_ranking(&result.top_recommendations).map_err(malformed)?;
    if result.sites_filtered_out > result.total_sites_analyzed {
        return Err(malformed(format!(
            "{} sites filtered out of only {} analysed",
            result.sites_filtered_out, result.total_sites_analyzed
        )));
    }
    Ok(())
}

pub fn parse_monitoring_result(raw: &str) -> Result<TrialMonitoringResult, TrackerError> {
    parse_monitoring_result_with(raw, &ForecastConfig::default())
}

pub fn parse_monitoring_result_with(
    raw: &str,
    config: &ForecastConfig,
) -> Result<TrialMonitoringResult, TrackerError> {
    let result = match parse(raw)? {
        Parsed::Envelope(envelope) => {
            envelope.expect_kind(&[ArtifactKind::TrialMonitoring, ArtifactKind::MonitoringResult])?;
            match envelope.kind {
                ArtifactKind::TrialMonitoring => {
                    let inputs: MonitoringArtifact = decode(envelope.data, "trial monitoring inputs")?;
                    inputs.validate().map_err(malformed)?;
                    monitor::analyze(&inputs, &envelope.investigation_id, envelope.generated_at, config)?
                }
                _ => decode(envelope.data, "trial monitoring result")?,
            }
        }
        Parsed::Bare(value) => decode(value, "trial monitoring result")?,
    };
    monitor::validate_result(&result).map_err(malformed)?;
    Ok(result)
}

/// Raw monitoring inputs of a `trial_monitoring` artifact, for what-if runs.
pub fn parse_monitoring_inputs(raw: &str) -> Result<MonitoringArtifact, TrackerError> {
    let envelope = parse_envelope(raw)?;
    envelope.expect_kind(&[ArtifactKind::TrialMonitoring])?;
    let inputs: MonitoringArtifact = decode(envelope.data, "trial monitoring inputs")?;
    inputs.validate().map_err(malformed)?;
    Ok(inputs)
}

pub fn require_complete(status: &InvestigationStatus) -> Result<(), TrackerError> {
    if status.status != RunStatus::Complete {
        return Err(TrackerError::NotComplete {
            investigation_id: status.investigation_id.clone(),
            status: status.status,
        });
    }
    Ok(())
}

pub fn final_report(status: &InvestigationStatus) -> Result<&str, TrackerError> {
    require_complete(status)?;
    status
        .final_report
        .as_deref()
        .ok_or_else(|| malformed(format!("investigation {} completed without a final report", status.investigation_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::TrialParameters;
    use crate::monitor::tests::{now, sample_artifact};

    fn ranked() -> SiteAnalysisResult {
        let profiles: Vec<_> = ["SITE-001", "SITE-002", "SITE-003"]
            .iter()
            .map(|id| crate::models::SiteProfile {
                site_id: id.to_string(),
                site_name: format!("{id} Hospital"),
                city: "Omaha".to_string(),
                state: "NE".to_string(),
                site_type: crate::models::SiteType::Community,
                trials_completed: 10,
                avg_enrollment_rate: 0.8,
                avg_screen_fail_rate: 0.2,
                avg_dropout_rate: 0.05,
                data_quality_score: 0.9,
                avg_days_to_first_patient: 40,
                protocol_deviations_per_trial: 2.0,
                eligible_patients_30mi: 500,
                competing_trials_same_indication: 2,
                travel_burden_score: 0.3,
            })
            .collect();
        sites::rank_sites(&profiles, &TrialParameters::default(), "analysis-9", now())
    }

    fn envelope_json<T: Serialize>(kind: ArtifactKind, data: &T) -> String {
        let envelope = ArtifactEnvelope::new(kind, "inv-1", now(), data)
            .unwrap()
            .with_narrative("Three sites reviewed.");
        serde_json::to_string(&envelope).unwrap()
    }

    #[test]
    fn site_analysis_round_trips_through_an_envelope() {
        let raw = envelope_json(ArtifactKind::SiteAnalysis, &ranked());
        let parsed = parse_site_analysis(&raw).unwrap();
        assert_eq!(parsed, ranked());
        assert_eq!(parse_envelope(&raw).unwrap().narrative.as_deref(), Some("Three sites reviewed."));
    }

    #[test]
    fn bare_results_are_accepted() {
        let raw = serde_json::to_string(&ranked()).unwrap();
        assert_eq!(parse_site_analysis(&raw).unwrap().top_recommendations.len(), 3);
    }

    #[test]
    fn free_text_report_is_malformed_not_empty() {
        let err = parse_site_analysis("Top sites: Omaha (0.84), Denver (0.80)").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedArtifact);

        let err = parse_monitoring_result(r#"{"monitor_id": "m-1"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedArtifact);
    }

    #[test]
    fn broken_ranking_is_malformed() {
        let mut result = ranked();
        result.top_recommendations[2].rank = 5;
        let err = parse_site_analysis(&envelope_json(ArtifactKind::SiteAnalysis, &result)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedArtifact);
        assert!(err.to_string().contains("rank 5"));
    }

    #[test]
    fn wrong_kind_or_version_is_malformed() {
        let raw = envelope_json(ArtifactKind::TrialMonitoring, &sample_artifact());
        assert_eq!(parse_site_analysis(&raw).unwrap_err().kind(), ErrorKind::MalformedArtifact);

        let bumped = raw.replace("\"schema_version\":1", "\"schema_version\":2");
        assert!(parse_monitoring_result(&bumped).unwrap_err().to_string().contains("schema_version 2"));
    }

    #[test]
    fn monitoring_inputs_are_analysed_on_receipt() {
        let raw = envelope_json(ArtifactKind::TrialMonitoring, &sample_artifact());
        let result = parse_monitoring_result(&raw).unwrap();
        assert_eq!(result.monitor_id, "inv-1");
        assert_eq!(result.critical_sites, 1);
        assert_eq!(result.analysis_timestamp, now());

        let inputs = parse_monitoring_inputs(&raw).unwrap();
        assert_eq!(inputs, sample_artifact());
    }

    #[test]
    fn analysed_results_are_validated() {
        let analysed = monitor::analyze(&sample_artifact(), "m-2", now(), &ForecastConfig::default()).unwrap();
        let raw = envelope_json(ArtifactKind::MonitoringResult, &analysed);
        assert_eq!(parse_monitoring_result(&raw).unwrap(), analysed);

        let mut crossed = analysed.clone();
        let last = crossed.enrollment_forecast.forecast_curve.len() - 1;
        crossed.enrollment_forecast.forecast_curve[last].p10 = 1_000.0;
        let raw = envelope_json(ArtifactKind::MonitoringResult, &crossed);
        assert_eq!(parse_monitoring_result(&raw).unwrap_err().kind(), ErrorKind::MalformedArtifact);
    }

    #[test]
    fn final_report_requires_completion() {
        let mut status = InvestigationStatus::for_kind(
            "inv-3",
            crate::models::InvestigationKind::SiteAnalysis,
            now(),
        )
        .unwrap();
        let err = final_report(&status).unwrap_err();
        assert!(matches!(err, TrackerError::NotComplete { .. }));
        assert!(require_complete(&status).is_err());

        status.status = RunStatus::Complete;
        status.completed_at = Some(now());
        require_complete(&status).unwrap();
        assert_eq!(final_report(&status).unwrap_err().kind(), ErrorKind::MalformedArtifact);

        status.final_report = Some("{}".to_string());
        assert_eq!(final_report(&status).unwrap(), "{}");
    }
}
