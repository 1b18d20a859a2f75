use std::collections::BTreeMap;

use crate::forecast::{mean, round_to};
use crate::models::{EnrollmentTrend, SiteDescriptor, SiteEnrollmentStatus, WeeklyEnrollment};

/// Consecutive zero-enrollment weeks after which a site counts as flatlined.
pub const FLATLINE_WEEKS: u32 = 3;
/// Shortfall against expected-to-date (percent) that marks a site as underperforming.
pub const UNDERPERFORMING_SHORTFALL: f64 = 40.0;
/// Relative change between consecutive windows that counts as a trend.
pub const TREND_BAND: f64 = 0.15;

pub fn latest_week(rows: &[WeeklyEnrollment]) -> u32 {
    rows.iter().map(|row| row.week).max().unwrap_or(0)
}

/// Trial-wide enrollment for weeks `1..=through_week`; weeks nobody
/// reported count as zero.
pub fn trial_series(rows: &[WeeklyEnrollment], through_week: u32) -> Vec<u32> {
    let mut series = vec![0u32; through_week as usize];
    for row in rows {
        if (1..=through_week).contains(&row.week) {
            series[(row.week - 1) as usize] += row.patients_enrolled;
        }
    }
    series
}

/// One site's enrollment from its first reported week through
/// `through_week`, zero-filled. Duplicate rows for a week are summed.
pub fn site_series(rows: &[WeeklyEnrollment], site_id: &str, through_week: u32) -> Vec<u32> {
    let weeks = site_weeks(rows, site_id);
    let first = weeks.keys().next().copied().unwrap_or(1).max(1);
    (first..=through_week)
        .map(|week| weeks.get(&week).map(|(_, enrolled)| *enrolled).unwrap_or(0))
        .collect()
}

fn site_weeks(rows: &[WeeklyEnrollment], site_id: &str) -> BTreeMap<u32, (u32, u32)> {
    let mut weeks: BTreeMap<u32, (u32, u32)> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.site_id == site_id) {
        let entry = weeks.entry(row.week).or_insert((0, 0));
        entry.0 += row.patients_screened;
        entry.1 += row.patients_enrolled;
    }
    weeks
}

/// `100 * (expected - actual) / expected`, never negative.
pub fn shortfall_percent(expected: f64, actual: u32) -> f64 {
    if expected <= 0.0 {
        return 0.0;
    }
    (100.0 * (expected - f64::from(actual)) / expected).max(0.0)
}

pub fn trailing_zero_weeks(series: &[u32]) -> u32 {
    series.iter().rev().take_while(|&&count| count == 0).count() as u32
}

pub fn classify_trend(series: &[u32], window: usize) -> EnrollmentTrend {
    if trailing_zero_weeks(series) >= FLATLINE_WEEKS {
        return EnrollmentTrend::Flatlined;
    }
    let window = window.max(1);
    if series.len() <= window {
        return EnrollmentTrend::Stable;
    }

    let (earlier, recent) = series.split_at(series.len() - window);
    let prior = &earlier[earlier.len().saturating_sub(window)..];
    let recent_rate = mean(recent);
    let prior_rate = mean(prior);

    if prior_rate == 0.0 {
        return if recent_rate > 0.0 {
            EnrollmentTrend::Improving
        } else {
            EnrollmentTrend::Stable
        };
    }
    match recent_rate / prior_rate {
        ratio if ratio > 1.0 + TREND_BAND => EnrollmentTrend::Improving,
        ratio if ratio < 1.0 - TREND_BAND => EnrollmentTrend::Declining,
        _ => EnrollmentTrend::Stable,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SitePlan {
    pub default_target: u32,
    pub total_weeks: u32,
    pub latest_week: u32,
    pub rate_window: usize,
}

pub fn summarize_site(
    site: &SiteDescriptor,
    rows: &[WeeklyEnrollment],
    plan: &SitePlan,
) -> SiteEnrollmentStatus {
    let weeks = site_weeks(rows, &site.site_id);
    let series = site_series(rows, &site.site_id, plan.latest_week);
    let weeks_active = series.len() as u32;
    let total_enrolled: u32 = series.iter().sum();
    let total_screened: u32 = weeks.values().map(|(screened, _)| screened).sum();

    let window = plan.rate_window.max(1);
    let recent = &series[series.len().saturating_sub(window)..];
    let current_rate = mean(recent);
    let weekly_average = if weeks_active == 0 {
        0.0
    } else {
        f64::from(total_enrolled) / f64::from(weeks_active)
    };

    let target = site.target_enrollment.unwrap_or(plan.default_target);
    let expected = if plan.total_weeks == 0 {
        f64::from(target)
    } else {
        f64::from(target) * f64::from(weeks_active.min(plan.total_weeks)) / f64::from(plan.total_weeks)
    };
    let percent_to_target = if target == 0 {
        100.0
    } else {
        100.0 * f64::from(total_enrolled) / f64::from(target)
    };
    let remaining_weeks = plan.total_weeks.saturating_sub(plan.latest_week);
    let projected = f64::from(total_enrolled) + current_rate * f64::from(remaining_weeks);
    let weeks_since_last_enrollment = trailing_zero_weeks(&series);
    let shortfall = shortfall_percent(expected, total_enrolled);

    SiteEnrollmentStatus {
        site_id: site.site_id.clone(),
        site_name: site.site_name.clone(),
        city: site.city.clone(),
        state: site.state.clone(),
        total_enrolled,
        total_screened,
        weeks_active,
        current_enrollment_rate: round_to(current_rate, 2),
        weekly_average: round_to(weekly_average, 2),
        trend: classify_trend(&series, window),
        target_enrollment: target,
        expected_enrollment_to_date: round_to(expected, 2),
        percent_to_target: round_to(percent_to_target, 1),
        projected_final_enrollment: projected.floor() as u32,
        is_underperforming: shortfall >= UNDERPERFORMING_SHORTFALL
            || weeks_since_last_enrollment >= FLATLINE_WEEKS,
        weeks_since_last_enrollment,
    }
}

/// Statuses for every site, ordered by site id. Sites missing from
/// `sites` but present in the feed are included under their id.
pub fn summarize_sites(
    sites: &[SiteDescriptor],
    rows: &[WeeklyEnrollment],
    trial_target: u32,
    total_weeks: u32,
    rate_window: usize,
) -> Vec<SiteEnrollmentStatus> {
    let directory = site_directory(sites, rows);
    let default_target = if directory.is_empty() {
        0
    } else {
        (f64::from(trial_target) / directory.len() as f64).round() as u32
    };
    let plan = SitePlan {
        default_target,
        total_weeks,
        latest_week: latest_week(rows),
        rate_window,
    };

    directory
        .values()
        .map(|site| summarize_site(site, rows, &plan))
        .collect()
}

pub fn site_directory(
    sites: &[SiteDescriptor],
    rows: &[WeeklyEnrollment],
) -> BTreeMap<String, SiteDescriptor> {
    let mut directory: BTreeMap<String, SiteDescriptor> = sites
        .iter()
        .map(|site| (site.site_id.clone(), site.clone()))
        .collect();
    for row in rows {
        directory
            .entry(row.site_id.clone())
            .or_insert_with(|| SiteDescriptor {
                site_id: row.site_id.clone(),
                site_name: row.site_id.clone(),
                city: String::new(),
                state: String::new(),
                target_enrollment: None,
                historical_weekly_rate: None,
            });
    }
    directory
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Days, NaiveDate};

    pub(crate) fn feed(site_id: &str, counts: &[u32]) -> Vec<WeeklyEnrollment> {
        feed_from(site_id, 1, counts)
    }

    pub(crate) fn feed_from(site_id: &str, first_week: u32, counts: &[u32]) -> Vec<WeeklyEnrollment> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        (first_week..)
            .zip(counts.iter())
            .map(|(week, &enrolled)| WeeklyEnrollment {
                week,
                week_ending_date: start
                    .checked_add_days(Days::new(7 * u64::from(week - 1)))
                    .unwrap(),
                site_id: site_id.to_string(),
                patients_screened: enrolled * 2 + 1,
                patients_enrolled: enrolled,
                screen_fail_reasons: String::new(),
            })
            .collect()
    }

    pub(crate) fn site(site_id: &str, target: Option<u32>) -> SiteDescriptor {
        SiteDescriptor {
            site_id: site_id.to_string(),
            site_name: format!("{site_id} Medical Center"),
            city: "Denver".to_string(),
            state: "CO".to_string(),
            target_enrollment: target,
            historical_weekly_rate: None,
        }
    }

    fn plan(latest_week: u32) -> SitePlan {
        SitePlan {
            default_target: 20,
            total_weeks: 52,
            latest_week,
            rate_window: 4,
        }
    }

    #[test]
    fn steady_site_is_on_track() {
        let rows = feed("SITE-001", &[2; 8]);
        let status = summarize_site(&site("SITE-001", None), &rows, &plan(8));

        assert_eq!(status.total_enrolled, 16);
        assert_eq!(status.total_screened, 40);
        assert_eq!(status.weeks_active, 8);
        assert_eq!(status.current_enrollment_rate, 2.0);
        assert_eq!(status.trend, EnrollmentTrend::Stable);
        assert_eq!(status.expected_enrollment_to_date, 3.08);
        assert_eq!(status.percent_to_target, 80.0);
        assert_eq!(status.projected_final_enrollment, 16 + 2 * 44);
        assert_eq!(status.weeks_since_last_enrollment, 0);
        assert!(!status.is_underperforming);
    }

    #[test]
    fn three_empty_weeks_flatline_a_site() {
        let rows = feed("SITE-014", &[3, 2, 3, 1, 0, 0, 0]);
        let status = summarize_site(&site("SITE-014", Some(30)), &rows, &plan(7));

        assert_eq!(status.weeks_since_last_enrollment, 3);
        assert_eq!(status.trend, EnrollmentTrend::Flatlined);
        assert!(status.is_underperforming);
        assert_eq!(status.target_enrollment, 30);
    }

    #[test]
    fn trend_compares_consecutive_windows() {
        assert_eq!(classify_trend(&[4, 4, 4, 4, 2, 2, 1, 1], 4), EnrollmentTrend::Declining);
        assert_eq!(classify_trend(&[1, 1, 1, 1, 2, 2, 1, 2], 4), EnrollmentTrend::Improving);
        assert_eq!(classify_trend(&[3, 3, 3, 3, 3, 3, 3, 2], 4), EnrollmentTrend::Stable);
        assert_eq!(classify_trend(&[0, 0, 0, 0, 1, 0, 1, 0], 4), EnrollmentTrend::Improving);
        assert_eq!(classify_trend(&[5, 5], 4), EnrollmentTrend::Stable);
    }

    #[test]
    fn site_that_never_enrolled_counts_every_week() {
        let rows = feed("SITE-030", &[0, 0, 0, 0, 0]);
        let status = summarize_site(&site("SITE-030", None), &rows, &plan(5));
        assert_eq!(status.weeks_since_last_enrollment, 5);
        assert_eq!(status.total_enrolled, 0);
        assert_eq!(status.projected_final_enrollment, 0);
    }

    #[test]
    fn late_joiner_is_measured_from_its_first_week() {
        let mut rows = feed("SITE-001", &[2; 10]);
        rows.extend(feed_from("SITE-009", 7, &[1, 2, 1, 2]));
        let status = summarize_site(&site("SITE-009", None), &rows, &plan(latest_week(&rows)));
        assert_eq!(status.weeks_active, 4);
        assert_eq!(status.total_enrolled, 6);
    }

    #[test]
    fn silent_trailing_weeks_count_as_zero() {
        let mut rows = feed("SITE-001", &[2; 10]);
        rows.extend(feed("SITE-002", &[3, 3, 3, 3, 3, 3]));
        assert_eq!(site_series(&rows, "SITE-002", 10), vec![3, 3, 3, 3, 3, 3, 0, 0, 0, 0]);
        assert_eq!(trial_series(&rows, 10)[0], 5);
        assert_eq!(trial_series(&rows, 10)[9], 2);
    }

    #[test]
    fn duplicate_rows_are_summed() {
        let mut rows = feed("SITE-001", &[2, 2]);
        rows.extend(feed("SITE-001", &[1]));
        assert_eq!(site_series(&rows, "SITE-001", 2), vec![3, 2]);
    }

    #[test]
    fn sites_only_in_feed_share_the_trial_target() {
        let mut rows = feed("SITE-002", &[1, 1]);
        rows.extend(feed("SITE-001", &[1, 1]));
        let statuses = summarize_sites(&[], &rows, 200, 52, 4);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].site_id, "SITE-001");
        assert_eq!(statuses[0].site_name, "SITE-001");
        assert_eq!(statuses[1].target_enrollment, 100);
    }

    #[test]
    fn shortfall_is_clamped_at_zero() {
        assert_eq!(shortfall_percent(10.0, 5), 50.0);
        assert_eq!(shortfall_percent(10.0, 12), 0.0);
        assert_eq!(shortfall_percent(0.0, 0), 0.0);
    }
}
