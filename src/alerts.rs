use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::enrollment::{shortfall_percent, FLATLINE_WEEKS, UNDERPERFORMING_SHORTFALL};
use crate::forecast::round_to;
use crate::models::{AlertSeverity, AlertType, EnrollmentTrend, SiteAlert, SiteEnrollmentStatus};

/// Shortfall (percent) at which a declining site is worth a heads-up.
pub const DECLINING_SHORTFALL: f64 = 20.0;

pub fn classify(status: &SiteEnrollmentStatus) -> Option<(AlertSeverity, AlertType)> {
    let shortfall = shortfall_percent(status.expected_enrollment_to_date, status.total_enrolled);

    if status.weeks_since_last_enrollment >= FLATLINE_WEEKS {
        Some((AlertSeverity::Critical, AlertType::Flatlined))
    } else if shortfall >= UNDERPERFORMING_SHORTFALL {
        Some((AlertSeverity::Warning, AlertType::Underperforming))
    } else if status.trend == EnrollmentTrend::Declining && shortfall >= DECLINING_SHORTFALL {
        Some((AlertSeverity::Info, AlertType::DecliningTrend))
    } else {
        None
    }
}

pub fn recommended_actions(severity: AlertSeverity, alert_type: AlertType) -> &'static [&'static str] {
    match (severity, alert_type) {
        (AlertSeverity::Critical, AlertType::Flatlined) => &[
            "Schedule an urgent call with the site principal investigator",
            "Audit the screening log for eligible patients not approached",
            "Confirm study drug, kits and IRB approvals are current",
            "Prepare a backup site in case activity does not resume within two weeks",
        ],
        (_, AlertType::Underperforming) => &[
            "Review screen failure reasons with the site coordinator",
            "Offer additional recruitment budget or coordinator hours",
            "Expand referral outreach to nearby community practices",
        ],
        (_, AlertType::DecliningTrend) => &[
            "Monitor weekly enrollment closely for the next month",
            "Check in with the site coordinator about workload and competing studies",
        ],
        (_, AlertType::Flatlined) => &[
            "Contact the site to confirm it is still actively screening",
        ],
    }
}

/// Builds the alert for one site, if any. `created_at` is supplied by the
/// caller so repeated runs over the same data produce identical alerts.
pub fn evaluate_site(status: &SiteEnrollmentStatus, created_at: DateTime<Utc>) -> Option<SiteAlert> {
    let (severity, alert_type) = classify(status)?;
    let shortfall = round_to(
        shortfall_percent(status.expected_enrollment_to_date, status.total_enrolled),
        1,
    );
    let behind = (status.expected_enrollment_to_date - f64::from(status.total_enrolled)).max(0.0);

    let (message, details) = match alert_type {
        AlertType::Flatlined => (
            format!(
                "{} has enrolled no patients in {} weeks",
                status.site_name, status.weeks_since_last_enrollment
            ),
            format!(
                "Last enrollment was {} weeks ago. {} of {} target patients enrolled after {} active weeks.",
                status.weeks_since_last_enrollment,
                status.total_enrolled,
                status.target_enrollment,
                status.weeks_active
            ),
        ),
        AlertType::Underperforming => (
            format!(
                "{} is {:.0}% behind its expected enrollment",
                status.site_name, shortfall
            ),
            format!(
                "{} enrolled against {:.1} expected by now; current rate {:.2} patients per week.",
                status.total_enrolled, status.expected_enrollment_to_date, status.current_enrollment_rate
            ),
        ),
        AlertType::DecliningTrend => (
            format!("{} enrollment is slowing", status.site_name),
            format!(
                "Recent rate {:.2} patients per week is below the prior month; {:.0}% behind expected.",
                status.current_enrollment_rate, shortfall
            ),
        ),
    };

    let estimated_impact = (behind >= 1.0).then(|| {
        format!(
            "About {} patients behind pace; projected to finish with {} of {}",
            behind.round() as u32,
            status.projected_final_enrollment,
            status.target_enrollment
        )
    });

    Some(SiteAlert {
        alert_id: alert_id(&status.site_id, alert_type, created_at),
        site_id: status.site_id.clone(),
        site_name: status.site_name.clone(),
        severity,
        alert_type,
        message,
        details,
        weeks_since_last_enrollment: (status.weeks_since_last_enrollment > 0)
            .then_some(status.weeks_since_last_enrollment),
        current_enrollment: status.total_enrolled,
        target_enrollment: status.target_enrollment,
        shortfall_percent: shortfall,
        recommended_actions: recommended_actions(severity, alert_type)
            .iter()
            .map(|action| action.to_string())
            .collect(),
        estimated_impact,
        created_at,
    })
}

pub fn evaluate_sites(statuses: &[SiteEnrollmentStatus], created_at: DateTime<Utc>) -> Vec<SiteAlert> {
    let mut alerts: Vec<SiteAlert> = statuses
        .iter()
        .filter_map(|status| evaluate_site(status, created_at))
        .collect();
    alerts.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.site_id.cmp(&b.site_id)));
    alerts
}

fn alert_id(site_id: &str, alert_type: AlertType, created_at: DateTime<Utc>) -> Uuid {
    let name = format!("{site_id}:{}:{}", alert_type.as_str(), created_at.to_rfc3339());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn status(weeks_since: u32, expected: f64, enrolled: u32, trend: EnrollmentTrend) -> SiteEnrollmentStatus {
        SiteEnrollmentStatus {
            site_id: "SITE-022".to_string(),
            site_name: "Lakeside Oncology".to_string(),
            city: "Cleveland".to_string(),
            state: "OH".to_string(),
            total_enrolled: enrolled,
            total_screened: enrolled * 3,
            weeks_active: 13,
            current_enrollment_rate: 0.5,
            weekly_average: 0.8,
            trend,
            target_enrollment: 20,
            expected_enrollment_to_date: expected,
            percent_to_target: 100.0 * f64::from(enrolled) / 20.0,
            projected_final_enrollment: enrolled + 10,
            is_underperforming: true,
            weeks_since_last_enrollment: weeks_since,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn flatline_outranks_underperformance() {
        let alert = evaluate_site(&status(4, 10.0, 5, EnrollmentTrend::Flatlined), now()).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.alert_type, AlertType::Flatlined);
        assert_eq!(alert.shortfall_percent, 50.0);
        assert_eq!(alert.weeks_since_last_enrollment, Some(4));
        assert_eq!(alert.recommended_actions.len(), 4);
    }

    #[test]
    fn large_shortfall_is_a_warning() {
        let alert = evaluate_site(&status(1, 10.0, 5, EnrollmentTrend::Stable), now()).unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert_eq!(alert.alert_type, AlertType::Underperforming);
        assert_eq!(alert.message, "Lakeside Oncology is 50% behind its expected enrollment");
        assert!(alert.estimated_impact.unwrap().starts_with("About 5 patients behind pace"));
    }

    #[test]
    fn declining_needs_a_real_shortfall() {
        let mild = status(0, 10.0, 7, EnrollmentTrend::Declining);
        assert_eq!(classify(&mild), Some((AlertSeverity::Info, AlertType::DecliningTrend)));

        let fine = status(0, 10.0, 9, EnrollmentTrend::Declining);
        assert_eq!(classify(&fine), None);

        let stable = status(0, 10.0, 7, EnrollmentTrend::Stable);
        assert_eq!(classify(&stable), None);
    }

    #[test]
    fn ahead_of_pace_has_no_alert() {
        assert!(evaluate_site(&status(0, 10.0, 14, EnrollmentTrend::Improving), now()).is_none());
    }

    #[test]
    fn alerts_are_deterministic_and_sorted() {
        let mut warning = status(0, 10.0, 4, EnrollmentTrend::Stable);
        warning.site_id = "SITE-001".to_string();
        let critical = status(5, 10.0, 8, EnrollmentTrend::Flatlined);
        let statuses = vec![warning, critical];

        let first = evaluate_sites(&statuses, now());
        let second = evaluate_sites(&statuses, now());
        assert_eq!(first, second);
        assert_eq!(first[0].severity, AlertSeverity::Critical);
        assert_eq!(first[1].site_id, "SITE-001");
        assert_ne!(first[0].alert_id, first[1].alert_id);
    }

    proptest! {
        #[test]
        fn three_silent_weeks_are_always_critical(
            weeks_since in 3u32..20,
            expected in 0.0f64..50.0,
            enrolled in 0u32..60,
        ) {
            let alert = evaluate_site(&status(weeks_since, expected, enrolled, EnrollmentTrend::Flatlined), now());
            prop_assert_eq!(alert.map(|a| a.severity), Some(AlertSeverity::Critical));
        }

        #[test]
        fn any_declining_alert_reflects_a_real_shortfall(expected in 0.0f64..50.0, enrolled in 0u32..60) {
            if let Some(alert) = evaluate_site(&status(0, expected, enrolled, EnrollmentTrend::Declining), now()) {
                prop_assert!(alert.shortfall_percent >= 20.0);
            }
        }
    }
}
