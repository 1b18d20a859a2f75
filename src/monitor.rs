use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts;
use crate::config::ForecastConfig;
use crate::enrollment;
use crate::error::TrackerError;
use crate::forecast::{self, ForecastInput};
use crate::models::{
    AlertSeverity, SiteDescriptor, TrialMonitoringResult, WeeklyEnrollment,
};
use crate::whatif::TrialBaseline;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringArtifact {
    pub trial_id: String,
    pub target_enrollment: u32,
    pub total_weeks: u32,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub sites: Vec<SiteDescriptor>,
    /// Sites not in the trial that could replace one that is.
    #[serde(default)]
    pub candidate_sites: Vec<SiteDescriptor>,
    pub weekly_enrollment: Vec<WeeklyEnrollment>,
}

impl MonitoringArtifact {
    pub fn validate(&self) -> Result<(), String> {
        if self.trial_id.trim().is_empty() {
            return Err("trial_id is empty".to_string());
        }
        if self.target_enrollment == 0 {
            return Err("target_enrollment must be positive".to_string());
        }
        if self.total_weeks == 0 {
            return Err("total_weeks must be positive".to_string());
        }

        let mut ids = HashSet::new();
        for site in &self.sites {
            if !ids.insert(site.site_id.as_str()) {
                return Err(format!("site {} is listed twice", site.site_id));
            }
        }
        for row in &self.weekly_enrollment {
            if row.week == 0 {
                return Err(format!("site {} reports week 0; weeks start at 1", row.site_id));
            }
            if row.week > self.total_weeks {
                return Err(format!(
                    "site {} reports week {} beyond the {}-week horizon",
                    row.site_id, row.week, self.total_weeks
                ));
            }
            if row.patients_enrolled > row.patients_screened {
                return Err(format!(
                    "site {} week {} enrolled {} of {} screened",
                    row.site_id, row.week, row.patients_enrolled, row.patients_screened
                ));
            }
            if !self.sites.is_empty() && !ids.contains(row.site_id.as_str()) {
                return Err(format!("weekly row for unknown site {}", row.site_id));
            }
        }
        Ok(())
    }

    /// Week-ending date of week 1, inferred from the earliest reported week.
    pub fn first_week_ending(&self) -> Option<NaiveDate> {
        let earliest = self.weekly_enrollment.iter().min_by_key(|row| row.week)?;
        earliest
            .week_ending_date
            .checked_sub_days(Days::new(7 * u64::from(earliest.week - 1)))
    }

    pub fn latest_week_ending(&self) -> Option<NaiveDate> {
        self.weekly_enrollment
            .iter()
            .max_by_key(|row| (row.week, row.week_ending_date))
            .map(|row| row.week_ending_date)
    }

    pub fn forecast_input(&self, as_of: DateTime<Utc>) -> ForecastInput {
        let weeks = enrollment::latest_week(&self.weekly_enrollment);
        let today = as_of.date_naive();
        ForecastInput {
            trial_id: self.trial_id.clone(),
            weekly_totals: enrollment::trial_series(&self.weekly_enrollment, weeks),
            target: self.target_enrollment,
            total_weeks: self.total_weeks,
            first_week_ending: self.first_week_ending().unwrap_or(today),
            forecast_date: self.latest_week_ending().unwrap_or(today),
            seed: self.seed,
        }
    }

    /// Baseline for what-if evaluation against this trial.
    pub fn baseline(&self, as_of: DateTime<Utc>) -> TrialBaseline {
        let input = self.forecast_input(as_of);
        let weeks = input.weeks_elapsed();
        let directory = enrollment::site_directory(&self.sites, &self.weekly_enrollment);

        let site_series: BTreeMap<String, Vec<u32>> = directory
            .keys()
            .map(|id| (id.clone(), enrollment::site_series(&self.weekly_enrollment, id, weeks)))
            .collect();
        let site_names = directory
            .values()
            .chain(self.candidate_sites.iter())
            .map(|site| (site.site_id.clone(), site.site_name.clone()))
            .collect();
        let candidate_rates = self
            .candidate_sites
            .iter()
            .filter_map(|site| site.historical_weekly_rate.map(|rate| (site.site_id.clone(), rate)))
            .collect();

        TrialBaseline {
            input,
            site_series,
            site_names,
            candidate_rates,
        }
    }
}

/// Derives the full monitoring result. The analysis timestamp stamps every
/// alert, so the same artifact and timestamp always give the same result.
pub fn analyze(
    artifact: &MonitoringArtifact,
    monitor_id: &str,
    analysis_timestamp: DateTime<Utc>,
    config: &ForecastConfig,
) -> Result<TrialMonitoringResult, TrackerError> {
    artifact.validate().map_err(TrackerError::InvalidInput)?;

    let site_statuses = enrollment::summarize_sites(
        &artifact.sites,
        &artifact.weekly_enrollment,
        artifact.target_enrollment,
        artifact.total_weeks,
        config.rate_window,
    );
    let enrollment_forecast = forecast::forecast(&artifact.forecast_input(analysis_timestamp), config)?;
    let alerts = alerts::evaluate_sites(&site_statuses, analysis_timestamp);

    let critical_sites = alerts
        .iter()
        .filter(|alert| alert.severity == AlertSeverity::Critical)
        .count() as u32;
    let at_risk_sites = alerts.len() as u32 - critical_sites;
    let on_track_sites = site_statuses.len() as u32 - alerts.len() as u32;

    tracing::info!(
        trial_id = %artifact.trial_id,
        sites = site_statuses.len(),
        critical_sites,
        at_risk_sites,
        probability = enrollment_forecast.probability_of_meeting_target,
        "trial monitoring analysis complete"
    );

    Ok(TrialMonitoringResult {
        monitor_id: monitor_id.to_string(),
        trial_id: artifact.trial_id.clone(),
        total_enrolled: site_statuses.iter().map(|s| s.total_enrolled).sum(),
        total_screened: site_statuses.iter().map(|s| s.total_screened).sum(),
        site_statuses,
        enrollment_forecast,
        alerts,
        on_track_sites,
        at_risk_sites,
        critical_sites,
        analysis_timestamp,
    })
}

pub fn validate_result(result: &TrialMonitoringResult) -> Result<(), String> {
    forecast::validate_forecast(&result.enrollment_forecast)?;

    let site_ids: HashSet<&str> = result.site_statuses.iter().map(|s| s.site_id.as_str()).collect();
    if site_ids.len() != result.site_statuses.len() {
        return Err("a site appears more than once in site_statuses".to_string());
    }
    for alert in &result.alerts {
        if !site_ids.contains(alert.site_id.as_str()) {
            return Err(format!("alert {} refers to unknown site {}", alert.alert_id, alert.site_id));
        }
        if alert.shortfall_percent < 0.0 {
            return Err(format!("alert {} has a negative shortfall", alert.alert_id));
        }
    }

    let counted = result.on_track_sites + result.at_risk_sites + result.critical_sites;
    if counted as usize != result.site_statuses.len() {
        return Err(format!(
            "site counts add up to {counted} but {} sites are reported",
            result.site_statuses.len()
        ));
    }
    let enrolled: u32 = result.site_statuses.iter().map(|s| s.total_enrolled).sum();
    if enrolled != result.total_enrolled {
        return Err(format!(
            "total_enrolled {} does not match the site sum {enrolled}",
            result.total_enrolled
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::enrollment::tests::{feed, site};
    use crate::models::AlertType;
    use chrono::TimeZone;

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 8, 8, 30, 0).unwrap()
    }

    /// Three sites: one steady, one slowing then silent, one far behind.
    pub(crate) fn sample_artifact() -> MonitoringArtifact {
        let mut weekly_enrollment = feed("SITE-001", &[2, 2, 3, 2, 2, 3, 2, 2, 3, 2, 2, 3, 2]);
        weekly_enrollment.extend(feed("SITE-014", &[3, 3, 2, 3, 2, 2, 2, 1, 1, 1, 0, 0, 0]));
        weekly_enrollment.extend(feed("SITE-022", &[1, 0, 1, 0, 1, 0, 0, 1, 0, 0, 1, 0, 1]));

        let mut candidate = site("SITE-040", None);
        candidate.historical_weekly_rate = Some(2.5);

        MonitoringArtifact {
            trial_id: "TRIAL-ONC-2024-001".to_string(),
            target_enrollment: 120,
            total_weeks: 52,
            seed: 7,
            sites: vec![
                site("SITE-001", Some(40)),
                site("SITE-014", Some(40)),
                site("SITE-022", Some(40)),
            ],
            candidate_sites: vec![candidate],
            weekly_enrollment,
        }
    }

    #[test]
    fn analysis_flags_silent_and_slow_sites() {
        let result = analyze(&sample_artifact(), "monitor-1", now(), &ForecastConfig::default()).unwrap();

        assert_eq!(result.site_statuses.len(), 3);
        assert_eq!(result.total_enrolled, 30 + 20 + 6);
        assert_eq!(result.critical_sites, 1);
        assert_eq!(result.at_risk_sites, 1);
        assert_eq!(result.on_track_sites, 1);
        assert_eq!(result.alerts[0].site_id, "SITE-014");
        assert_eq!(result.alerts[0].alert_type, AlertType::Flatlined);
        assert_eq!(result.alerts[1].site_id, "SITE-022");
        assert_eq!(result.alerts[1].alert_type, AlertType::Underperforming);
        assert_eq!(result.enrollment_forecast.weeks_elapsed, 13);
        assert_eq!(
            result.enrollment_forecast.forecast_date,
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()
        );
        validate_result(&result).unwrap();
    }

    #[test]
    fn analysis_is_reproducible() {
        let config = ForecastConfig::default();
        let first = analyze(&sample_artifact(), "monitor-1", now(), &config).unwrap();
        let second = analyze(&sample_artifact(), "monitor-1", now(), &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn first_week_is_inferred_from_any_reported_week() {
        let mut artifact = sample_artifact();
        artifact.weekly_enrollment.retain(|row| row.week >= 5);
        assert_eq!(
            artifact.first_week_ending(),
            NaiveDate::from_ymd_opt(2024, 1, 7)
        );
    }

    #[test]
    fn baseline_carries_site_series_and_candidates() {
        let baseline = sample_artifact().baseline(now());
        assert_eq!(baseline.input.weekly_totals.len(), 13);
        assert_eq!(baseline.input.current_total(), 56);
        assert_eq!(baseline.site_series["SITE-014"].len(), 13);
        assert_eq!(baseline.candidate_rates.get("SITE-040"), Some(&2.5));
    }

    #[test]
    fn active_sites_are_never_replacement_candidates() {
        let mut artifact = sample_artifact();
        artifact.sites[2].historical_weekly_rate = Some(3.0);
        let baseline = artifact.baseline(now());
        assert!(!baseline.candidate_rates.contains_key("SITE-022"));

        let scenario = crate::models::WhatIfScenario {
            scenario_id: "swap".to_string(),
            intervention_type: crate::models::InterventionType::ReplaceSite,
            target_site_id: Some("SITE-014".to_string()),
            budget_amount: None,
            replacement_site_id: Some("SITE-022".to_string()),
            extension_weeks: None,
            support_level: None,
        };
        let err = crate::whatif::WhatIfEvaluator::default()
            .evaluate(&scenario, &baseline)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidScenario);
    }

    #[test]
    fn invalid_artifacts_are_rejected() {
        let mut beyond = sample_artifact();
        beyond.total_weeks = 10;
        assert!(beyond.validate().unwrap_err().contains("beyond the 10-week horizon"));

        let mut stranger = sample_artifact();
        stranger.weekly_enrollment.extend(feed("SITE-999", &[1]));
        assert!(stranger.validate().is_err());

        let mut no_target = sample_artifact();
        no_target.target_enrollment = 0;
        let err = analyze(&no_target, "m", now(), &ForecastConfig::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Input);
    }

    #[test]
    fn inconsistent_counts_fail_validation() {
        let mut result = analyze(&sample_artifact(), "monitor-1", now(), &ForecastConfig::default()).unwrap();
        result.on_track_sites += 1;
        assert!(validate_result(&result).is_err());
    }
}
