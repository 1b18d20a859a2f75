use std::collections::BTreeMap;
use std::fmt::Write;

use crate::models::{
    AlertSeverity, EnrollmentTrend, RoiAssessment, SiteAnalysisResult, SiteClassification,
    SiteEnrollmentStatus, TrialMonitoringResult, WhatIfResult,
};
use crate::whatif::format_dollars;

#[derive(Debug, Clone, PartialEq)]
pub struct TrendSummary {
    pub trend: EnrollmentTrend,
    pub sites: usize,
    pub total_enrolled: u32,
    pub avg_percent_to_target: f64,
}

pub fn summarize_by_trend(statuses: &[SiteEnrollmentStatus]) -> Vec<TrendSummary> {
    let mut map: BTreeMap<&'static str, (EnrollmentTrend, usize, u32, f64)> = BTreeMap::new();

    for status in statuses {
        let entry = map
            .entry(trend_label(status.trend))
            .or_insert((status.trend, 0, 0, 0.0));
        entry.1 += 1;
        entry.2 += status.total_enrolled;
        entry.3 += status.percent_to_target;
    }

    let mut summaries: Vec<TrendSummary> = map
        .into_values()
        .map(|(trend, sites, total_enrolled, percent_sum)| TrendSummary {
            trend,
            sites,
            total_enrolled,
            avg_percent_to_target: if sites == 0 {
                0.0
            } else {
                percent_sum / sites as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.sites.cmp(&a.sites));
    summaries
}

pub fn trend_label(trend: EnrollmentTrend) -> &'static str {
    match trend {
        EnrollmentTrend::Improving => "improving",
        EnrollmentTrend::Stable => "stable",
        EnrollmentTrend::Declining => "declining",
        EnrollmentTrend::Flatlined => "flatlined",
    }
}

fn severity_label(severity: AlertSeverity) -> &'static str {
    match severity {
        AlertSeverity::Critical => "CRITICAL",
        AlertSeverity::Warning => "WARNING",
        AlertSeverity::Info => "INFO",
    }
}

fn classification_label(classification: SiteClassification) -> &'static str {
    match classification {
        SiteClassification::HiddenGem => "hidden gem",
        SiteClassification::SafeChoice => "safe choice",
        SiteClassification::Acceptable => "acceptable",
        SiteClassification::Risky => "risky",
    }
}

fn roi_label(roi: RoiAssessment) -> &'static str {
    match roi {
        RoiAssessment::Excellent => "excellent",
        RoiAssessment::Good => "good",
        RoiAssessment::Poor => "poor",
    }
}

pub fn build_monitoring_report(result: &TrialMonitoringResult) -> String {
    let forecast = &result.enrollment_forecast;
    let summaries = summarize_by_trend(&result.site_statuses);

    let mut output = String::new();

    let _ = writeln!(output, "# Enrollment Monitoring Report: {}", result.trial_id);
    let _ = writeln!(
        output,
        "Generated {} (monitor {}, week {} of {})",
        result.analysis_timestamp.format("%Y-%m-%d %H:%M UTC"),
        result.monitor_id,
        forecast.weeks_elapsed,
        forecast.total_weeks
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Enrollment Outlook");
    let percent = if forecast.target_total_enrollment == 0 {
        100.0
    } else {
        100.0 * f64::from(result.total_enrolled) / f64::from(forecast.target_total_enrollment)
    };
    let _ = writeln!(
        output,
        "- Enrolled {} of {} target ({:.1}%), {} screened",
        result.total_enrolled, forecast.target_total_enrollment, percent, result.total_screened
    );
    let _ = writeln!(output, "- Run rate {:.2} patients per week", forecast.run_rate);
    let _ = writeln!(
        output,
        "- Projected final enrollment {} (worst {}, best {})",
        forecast.expected_final_enrollment,
        forecast.worst_case_enrollment,
        forecast.best_case_enrollment
    );
    let _ = writeln!(
        output,
        "- Probability of meeting target {:.1}%",
        forecast.probability_of_meeting_target * 100.0
    );
    match forecast.projected_completion_date {
        Some(date) => {
            let _ = writeln!(output, "- Projected completion {date}");
        }
        None => {
            let _ = writeln!(output, "- Target not reached at the current rate");
        }
    }
    let _ = writeln!(
        output,
        "- Sites: {} on track, {} at risk, {} critical",
        result.on_track_sites, result.at_risk_sites, result.critical_sites
    );

    let _ = writeln!(output);
    let _ = writeln!(output, "## Trend Mix");

    if summaries.is_empty() {
        let _ = writeln!(output, "No sites reporting.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} sites, {} enrolled (avg {:.1}% of site target)",
                trend_label(summary.trend),
                summary.sites,
                summary.total_enrolled,
                summary.avg_percent_to_target
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Alerts");

    if result.alerts.is_empty() {
        let _ = writeln!(output, "No sites need attention.");
    } else {
        for alert in result.alerts.iter() {
            let _ = writeln!(
                output,
                "- [{}] {} ({}): {}",
                severity_label(alert.severity),
                alert.site_name,
                alert.site_id,
                alert.message
            );
            let _ = writeln!(output, "  {}", alert.details);
            for action in alert.recommended_actions.iter() {
                let _ = writeln!(output, "  - {action}");
            }
            if let Some(impact) = &alert.estimated_impact {
                let _ = writeln!(output, "  Impact: {impact}");
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Site Status");
    let _ = writeln!(
        output,
        "| Site | Enrolled | Target | % of target | Rate/wk | Trend | Weeks since last |"
    );
    let _ = writeln!(output, "|---|---|---|---|---|---|---|");
    for status in result.site_statuses.iter() {
        let _ = writeln!(
            output,
            "| {} ({}) | {} | {} | {:.1} | {:.2} | {} | {} |",
            status.site_name,
            status.site_id,
            status.total_enrolled,
            status.target_enrollment,
            status.percent_to_target,
            status.current_enrollment_rate,
            trend_label(status.trend),
            status.weeks_since_last_enrollment
        );
    }

    output
}

pub fn build_site_analysis_report(result: &SiteAnalysisResult, limit: usize) -> String {
    let params = &result.trial_params;
    let mut output = String::new();

    let _ = writeln!(output, "# Site Selection Report");
    let _ = writeln!(
        output,
        "Phase {} {} trial: {} patients over {} months at {} sites",
        params.phase,
        params.indication,
        params.target_enrollment,
        params.duration_months,
        params.target_sites
    );
    let _ = writeln!(
        output,
        "Analysis {} at {}: {} sites analysed, {} filtered out",
        result.analysis_id,
        result.analysis_timestamp.format("%Y-%m-%d %H:%M UTC"),
        result.total_sites_analyzed,
        result.sites_filtered_out
    );
    for (reason, count) in result.filter_reasons.iter() {
        let _ = writeln!(output, "- {reason}: {count}");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Sites");

    if result.top_recommendations.is_empty() {
        let _ = writeln!(output, "No sites passed the data quality filter.");
    } else {
        for site in result.top_recommendations.iter().take(limit) {
            let _ = writeln!(
                output,
                "{}. {} ({}), {}, {}: score {:.3}, {}",
                site.rank,
                site.site_name,
                site.site_id,
                site.city,
                site.state,
                site.composite_score,
                classification_label(site.site_classification)
            );
            let _ = writeln!(output, "   {}", site.reasoning);
        }
    }

    output
}

pub fn build_what_if_report(results: &[WhatIfResult]) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# What-If Scenarios");

    if results.is_empty() {
        let _ = writeln!(output, "No scenarios evaluated.");
        return output;
    }

    for result in results.iter() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", result.intervention_description);
        let _ = writeln!(
            output,
            "- Enrollment {} -> {} ({:+})",
            result.baseline_projected_enrollment,
            result.scenario_projected_enrollment,
            result.enrollment_improvement
        );
        let _ = writeln!(
            output,
            "- Probability of meeting target {:.1}% -> {:.1}%",
            result.baseline_probability_meeting_target * 100.0,
            result.scenario_probability_meeting_target * 100.0
        );
        let _ = writeln!(
            output,
            "- Cost {}, ROI {}",
            format_dollars(result.estimated_cost),
            roi_label(result.roi_assessment)
        );
        let _ = writeln!(output, "- {}", result.recommendation);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForecastConfig;
    use crate::monitor::tests::{now, sample_artifact};
    use crate::monitor::analyze;

    fn status(site_id: &str, trend: EnrollmentTrend, enrolled: u32, percent: f64) -> SiteEnrollmentStatus {
        SiteEnrollmentStatus {
            site_id: site_id.to_string(),
            site_name: format!("{site_id} Medical Center"),
            city: "Denver".to_string(),
            state: "CO".to_string(),
            total_enrolled: enrolled,
            total_screened: enrolled * 2,
            weeks_active: 10,
            current_enrollment_rate: 1.0,
            weekly_average: 1.0,
            trend,
            target_enrollment: 40,
            expected_enrollment_to_date: 8.0,
            percent_to_target: percent,
            projected_final_enrollment: 40,
            is_underperforming: false,
            weeks_since_last_enrollment: 0,
        }
    }

    #[test]
    fn trends_are_grouped_and_ordered_by_site_count() {
        let statuses = vec![
            status("SITE-001", EnrollmentTrend::Stable, 10, 25.0),
            status("SITE-002", EnrollmentTrend::Declining, 4, 10.0),
            status("SITE-003", EnrollmentTrend::Stable, 14, 35.0),
        ];
        let summaries = summarize_by_trend(&statuses);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].trend, EnrollmentTrend::Stable);
        assert_eq!(summaries[0].sites, 2);
        assert_eq!(summaries[0].total_enrolled, 24);
        assert!((summaries[0].avg_percent_to_target - 30.0).abs() < 1e-9);
        assert_eq!(summaries[1].trend, EnrollmentTrend::Declining);
    }

    #[test]
    fn monitoring_report_lists_alerts_in_severity_order() {
        let result = analyze(&sample_artifact(), "monitor-1", now(), &ForecastConfig::default()).unwrap();
        let report = build_monitoring_report(&result);

        assert!(report.starts_with("# Enrollment Monitoring Report: TRIAL-ONC-2024-001"));
        assert!(report.contains("week 13 of 52"));
        assert!(report.contains("Enrolled 56 of 120 target"));
        assert!(report.contains("1 on track, 1 at risk, 1 critical"));
        assert!(report.contains("- flatlined: 1 sites"));

        let critical = report.find("[CRITICAL] SITE-014 Medical Center (SITE-014)").unwrap();
        let warning = report.find("[WARNING] SITE-022 Medical Center (SITE-022)").unwrap();
        assert!(critical < warning);
        assert_eq!(report.matches("| SITE-0").count(), 3);
    }

    #[test]
    fn empty_sections_say_so() {
        let mut result = analyze(&sample_artifact(), "monitor-1", now(), &ForecastConfig::default()).unwrap();
        result.alerts.clear();
        result.site_statuses.clear();
        let report = build_monitoring_report(&result);
        assert!(report.contains("No sites need attention."));
        assert!(report.contains("No sites reporting."));
    }

    #[test]
    fn what_if_report_shows_signed_improvement() {
        let result = WhatIfResult {
            scenario_id: "s-1".to_string(),
            intervention_type: crate::models::InterventionType::ExtendTrialDuration,
            intervention_description: "Extend the trial by 8 weeks".to_string(),
            baseline_projected_enrollment: 219,
            baseline_probability_meeting_target: 0.68,
            scenario_projected_enrollment: 237,
            scenario_probability_meeting_target: 0.79,
            enrollment_improvement: 18,
            probability_improvement: 0.11,
            estimated_cost: 40_000,
            patients_per_dollar: Some(0.00045),
            roi_assessment: RoiAssessment::Excellent,
            scenario_forecast_curve: Vec::new(),
            recommendation: "Recommended.".to_string(),
        };
        let report = build_what_if_report(&[result]);
        assert!(report.contains("## Extend the trial by 8 weeks"));
        assert!(report.contains("Enrollment 219 -> 237 (+18)"));
        assert!(report.contains("68.0% -> 79.0%"));
        assert!(report.contains("Cost $40,000, ROI excellent"));
        assert_eq!(build_what_if_report(&[]), "# What-If Scenarios\nNo scenarios evaluated.\n");
    }
}
