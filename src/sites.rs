use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::forecast::round_to;
use crate::models::{
    ComponentScores, SiteAnalysisResult, SiteClassification, SiteProfile, SiteRecommendation,
    SiteType, TrialParameters,
};

/// Sites below this data quality score are not considered at all.
pub const MIN_DATA_QUALITY: f64 = 0.65;

const PERFORMANCE_WEIGHT: f64 = 0.40;
const ACCESS_WEIGHT: f64 = 0.30;
const QUALITY_WEIGHT: f64 = 0.20;
const LOGISTICS_WEIGHT: f64 = 0.10;

pub fn component_scores(profile: &SiteProfile) -> ComponentScores {
    let performance = 0.6 * profile.avg_enrollment_rate + 0.4 * (1.0 - profile.avg_screen_fail_rate);
    let patient_access = 0.6 * (f64::from(profile.eligible_patients_30mi) / 1000.0).min(1.0)
        + 0.4 * (1.0 - (f64::from(profile.competing_trials_same_indication) / 10.0).min(1.0));
    let logistics = 0.6 * (1.0 - (f64::from(profile.avg_days_to_first_patient) / 90.0).min(1.0))
        + 0.4 * (1.0 - (profile.protocol_deviations_per_trial / 10.0).min(1.0));

    ComponentScores {
        performance: round_to(performance.clamp(0.0, 1.0), 3),
        patient_access: round_to(patient_access.clamp(0.0, 1.0), 3),
        data_quality: round_to(profile.data_quality_score.clamp(0.0, 1.0), 3),
        logistics: round_to(logistics.clamp(0.0, 1.0), 3),
    }
}

pub fn composite_score(scores: &ComponentScores) -> f64 {
    let composite = PERFORMANCE_WEIGHT * scores.performance
        + ACCESS_WEIGHT * scores.patient_access
        + QUALITY_WEIGHT * scores.data_quality
        + LOGISTICS_WEIGHT * scores.logistics;
    round_to(composite.clamp(0.0, 1.0), 3)
}

pub fn strengths_and_concerns(profile: &SiteProfile) -> (Vec<String>, Vec<String>) {
    let mut strengths = Vec::new();
    let mut concerns = Vec::new();

    if profile.avg_enrollment_rate >= 0.85 {
        strengths.push(format!(
            "Strong enrollment history ({:.0}% of target across {} trials)",
            profile.avg_enrollment_rate * 100.0,
            profile.trials_completed
        ));
    }
    if profile.eligible_patients_30mi >= 600 {
        strengths.push(format!(
            "Large eligible population ({} patients within 30 miles)",
            profile.eligible_patients_30mi
        ));
    }
    if profile.competing_trials_same_indication <= 1 {
        strengths.push("Little competition for the same patients".to_string());
    }
    if profile.data_quality_score >= 0.9 {
        strengths.push(format!(
            "Excellent data quality ({:.2})",
            profile.data_quality_score
        ));
    }
    if profile.avg_days_to_first_patient <= 30 {
        strengths.push(format!(
            "Fast start-up ({} days to first patient)",
            profile.avg_days_to_first_patient
        ));
    }

    if profile.competing_trials_same_indication >= 6 {
        concerns.push(format!(
            "Heavy competition ({} trials in the same indication)",
            profile.competing_trials_same_indication
        ));
    }
    if profile.avg_screen_fail_rate >= 0.25 {
        concerns.push(format!(
            "High screen failure rate ({:.0}%)",
            profile.avg_screen_fail_rate * 100.0
        ));
    }
    if profile.avg_dropout_rate >= 0.15 {
        concerns.push(format!(
            "High dropout rate ({:.0}%)",
            profile.avg_dropout_rate * 100.0
        ));
    }
    if profile.protocol_deviations_per_trial >= 5.0 {
        concerns.push(format!(
            "Frequent protocol deviations ({:.1} per trial)",
            profile.protocol_deviations_per_trial
        ));
    }
    if profile.avg_days_to_first_patient >= 60 {
        concerns.push(format!(
            "Slow start-up ({} days to first patient)",
            profile.avg_days_to_first_patient
        ));
    }
    if profile.data_quality_score < 0.75 {
        concerns.push(format!(
            "Marginal data quality ({:.2})",
            profile.data_quality_score
        ));
    }

    (strengths, concerns)
}

pub fn classify(profile: &SiteProfile, composite: f64, concerns: usize) -> SiteClassification {
    match composite {
        _ if concerns >= 2 => SiteClassification::Risky,
        c if c >= 0.75
            && (profile.site_type == SiteType::Community
                || profile.competing_trials_same_indication <= 1) =>
        {
            SiteClassification::HiddenGem
        }
        c if c >= 0.70 => SiteClassification::SafeChoice,
        c if c >= 0.60 => SiteClassification::Acceptable,
        _ => SiteClassification::Risky,
    }
}

pub fn recommend(profile: &SiteProfile) -> SiteRecommendation {
    let scores = component_scores(profile);
    let composite = composite_score(&scores);
    let (strengths, concerns) = strengths_and_concerns(profile);
    let classification = classify(profile, composite, concerns.len());

    let mut reasoning = format!(
        "{} ({}, {}) scores {:.3}: performance {:.2}, patient access {:.2}, data quality {:.2}, logistics {:.2}.",
        profile.site_name,
        profile.city,
        profile.state,
        composite,
        scores.performance,
        scores.patient_access,
        scores.data_quality,
        scores.logistics
    );
    if let Some(best) = strengths.first() {
        reasoning.push_str(&format!(" Key strength: {}.", lowercase_first(best)));
    }
    if let Some(worst) = concerns.first() {
        reasoning.push_str(&format!(" Main concern: {}.", lowercase_first(worst)));
    }

    SiteRecommendation {
        rank: 0,
        site_id: profile.site_id.clone(),
        site_name: profile.site_name.clone(),
        city: profile.city.clone(),
        state: profile.state.clone(),
        composite_score: composite,
        component_scores: scores,
        historical_enrollment_rate: profile.avg_enrollment_rate,
        eligible_patients: profile.eligible_patients_30mi,
        competing_trials: profile.competing_trials_same_indication,
        data_quality_score: profile.data_quality_score,
        reasoning,
        strengths,
        concerns,
        site_classification: classification,
    }
}

fn lowercase_first(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Ranking order: composite score descending, then historical enrollment
/// rate descending, then site id ascending.
pub fn ranking_order(a: &SiteRecommendation, b: &SiteRecommendation) -> Ordering {
    b.composite_score
        .total_cmp(&a.composite_score)
        .then_with(|| b.historical_enrollment_rate.total_cmp(&a.historical_enrollment_rate))
        .then_with(|| a.site_id.cmp(&b.site_id))
}

pub fn assign_ranks(recommendations: &mut [SiteRecommendation]) {
    recommendations.sort_by(ranking_order);
    for (rank, recommendation) in (1..).zip(recommendations.iter_mut()) {
        recommendation.rank = rank;
    }
}

/// Checks that ranks are exactly `1..=N`, site ids are unique, scores are in
/// range and the order matches [`ranking_order`].
pub fn validate_ranking(recommendations: &[SiteRecommendation]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for (expected, rec) in (1u32..).zip(recommendations.iter()) {
        if rec.rank != expected {
            return Err(format!(
                "rank {} found where rank {expected} was expected ({})",
                rec.rank, rec.site_id
            ));
        }
        if !seen.insert(rec.site_id.as_str()) {
            return Err(format!("site {} is ranked twice", rec.site_id));
        }
        if !(0.0..=1.0).contains(&rec.composite_score) {
            return Err(format!(
                "site {} has composite score {} outside [0, 1]",
                rec.site_id, rec.composite_score
            ));
        }
    }
    for pair in recommendations.windows(2) {
        if ranking_order(&pair[0], &pair[1]) == Ordering::Greater {
            return Err(format!(
                "{} (rank {}) should not rank above {} (rank {})",
                pair[0].site_id, pair[0].rank, pair[1].site_id, pair[1].rank
            ));
        }
    }
    Ok(())
}

/// Scores every profile, drops sites below the data quality bar and keeps
/// the best `params.target_sites`.
pub fn rank_sites(
    profiles: &[SiteProfile],
    params: &TrialParameters,
    analysis_id: &str,
    analysis_timestamp: DateTime<Utc>,
) -> SiteAnalysisResult {
    let mut filter_reasons: BTreeMap<String, u32> = BTreeMap::new();
    let mut recommendations: Vec<SiteRecommendation> = Vec::new();

    for profile in profiles {
        if profile.data_quality_score < MIN_DATA_QUALITY {
            *filter_reasons
                .entry(format!("data_quality_below_{MIN_DATA_QUALITY}"))
                .or_insert(0) += 1;
            continue;
        }
        recommendations.push(recommend(profile));
    }

    assign_ranks(&mut recommendations);
    recommendations.truncate(params.target_sites as usize);

    let sites_filtered_out: u32 = filter_reasons.values().sum();
    tracing::info!(
        analysis_id,
        analyzed = profiles.len(),
        filtered = sites_filtered_out,
        kept = recommendations.len(),
        "site ranking complete"
    );

    SiteAnalysisResult {
        analysis_id: analysis_id.to_string(),
        trial_id: None,
        top_recommendations: recommendations,
        total_sites_analyzed: profiles.len() as u32,
        sites_filtered_out,
        filter_reasons,
        analysis_timestamp,
        trial_params: params.clone(),
    }
}
