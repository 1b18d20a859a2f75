use std::collections::BTreeMap;

use crate::config::{ForecastConfig, WhatIfConfig};
use crate::error::TrackerError;
use crate::forecast::{self, mean, ForecastInput, RateEstimate};
use crate::models::{
    InterventionType, RoiAssessment, SupportLevel, WhatIfResult, WhatIfScenario,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intervention {
    AddRecruitmentBudget {
        /// `None` spreads the budget across the whole trial.
        site_id: Option<String>,
        budget: u64,
    },
    ReplaceSite {
        site_id: String,
        replacement_site_id: String,
    },
    ExtendTrialDuration {
        extension_weeks: u32,
    },
    IncreaseSiteSupport {
        site_id: String,
        level: SupportLevel,
    },
}

impl Intervention {
    /// Rejects scenarios whose populated fields do not match their
    /// intervention type, before any computation happens.
    pub fn from_scenario(scenario: &WhatIfScenario) -> Result<Self, TrackerError> {
        let invalid = |reason: String| {
            Err(TrackerError::InvalidScenario(format!(
                "scenario {}: {reason}",
                scenario.scenario_id
            )))
        };

        let mut stray = Vec::new();
        let kind = scenario.intervention_type;
        if scenario.budget_amount.is_some() && kind != InterventionType::AddRecruitmentBudget {
            stray.push("budget_amount");
        }
        if scenario.replacement_site_id.is_some() && kind != InterventionType::ReplaceSite {
            stray.push("replacement_site_id");
        }
        if scenario.extension_weeks.is_some() && kind != InterventionType::ExtendTrialDuration {
            stray.push("extension_weeks");
        }
        if scenario.support_level.is_some() && kind != InterventionType::IncreaseSiteSupport {
            stray.push("support_level");
        }
        if !stray.is_empty() {
            return invalid(format!(
                "{} not allowed for {}",
                stray.join(", "),
                type_name(kind)
            ));
        }

        let site_id = scenario
            .target_site_id
            .as_ref()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        match kind {
            InterventionType::AddRecruitmentBudget => match scenario.budget_amount {
                Some(budget) if budget > 0 => Ok(Self::AddRecruitmentBudget { site_id, budget }),
                Some(_) => invalid("budget_amount must be positive".to_string()),
                None => invalid("budget_amount is required".to_string()),
            },
            InterventionType::ReplaceSite => {
                let Some(site_id) = site_id else {
                    return invalid("target_site_id is required to replace a site".to_string());
                };
                let replacement = scenario
                    .replacement_site_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty());
                match replacement {
                    None => invalid("replacement_site_id is required".to_string()),
                    Some(replacement) if replacement == site_id => {
                        invalid(format!("{site_id} cannot replace itself"))
                    }
                    Some(replacement) => Ok(Self::ReplaceSite {
                        site_id,
                        replacement_site_id: replacement.to_string(),
                    }),
                }
            }
            InterventionType::ExtendTrialDuration => match scenario.extension_weeks {
                Some(weeks) if weeks > 0 => Ok(Self::ExtendTrialDuration {
                    extension_weeks: weeks,
                }),
                Some(_) => invalid("extension_weeks must be positive".to_string()),
                None => invalid("extension_weeks is required".to_string()),
            },
            InterventionType::IncreaseSiteSupport => match (site_id, scenario.support_level) {
                (Some(site_id), Some(level)) => Ok(Self::IncreaseSiteSupport { site_id, level }),
                (None, _) => invalid("target_site_id is required to increase support".to_string()),
                (_, None) => invalid("support_level is required".to_string()),
            },
        }
    }

    #[must_use]
    pub fn intervention_type(&self) -> InterventionType {
        match self {
            Self::AddRecruitmentBudget { .. } => InterventionType::AddRecruitmentBudget,
            Self::ReplaceSite { .. } => InterventionType::ReplaceSite,
            Self::ExtendTrialDuration { .. } => InterventionType::ExtendTrialDuration,
            Self::IncreaseSiteSupport { .. } => InterventionType::IncreaseSiteSupport,
        }
    }

    fn target_site(&self) -> Option<&str> {
        match self {
            Self::AddRecruitmentBudget { site_id, .. } => site_id.as_deref(),
            Self::ReplaceSite { site_id, .. } | Self::IncreaseSiteSupport { site_id, .. } => {
                Some(site_id.as_str())
            }
            Self::ExtendTrialDuration { .. } => None,
        }
    }
}

fn type_name(kind: InterventionType) -> &'static str {
    match kind {
        InterventionType::AddRecruitmentBudget => "add_recruitment_budget",
        InterventionType::ReplaceSite => "replace_site",
        InterventionType::ExtendTrialDuration => "extend_trial_duration",
        InterventionType::IncreaseSiteSupport => "increase_site_support",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialBaseline {
    pub input: ForecastInput,
    /// Weekly enrollment per active site, ending at the last observed week.
    pub site_series: BTreeMap<String, Vec<u32>>,
    pub site_names: BTreeMap<String, String>,
    /// Historical weekly enrollment rate of sites that could be brought in.
    pub candidate_rates: BTreeMap<String, f64>,
}

impl TrialBaseline {
    fn site_name<'a>(&'a self, site_id: &'a str) -> &'a str {
        self.site_names.get(site_id).map(String::as_str).unwrap_or(site_id)
    }

    fn site_rate(&self, site_id: &str, window: usize) -> Option<f64> {
        self.site_series.get(site_id).map(|series| {
            let window = window.max(1);
            mean(&series[series.len().saturating_sub(window)..])
        })
    }

    fn peer_rate(&self, excluded: &str, window: usize) -> f64 {
        let rates: Vec<f64> = self
            .site_series
            .keys()
            .filter(|id| id.as_str() != excluded)
            .filter_map(|id| self.site_rate(id, window))
            .collect();
        if rates.is_empty() {
            0.0
        } else {
            rates.iter().sum::<f64>() / rates.len() as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WhatIfEvaluator {
    forecast: ForecastConfig,
    config: WhatIfConfig,
}

impl WhatIfEvaluator {
    #[must_use]
    pub fn new(forecast: ForecastConfig, config: WhatIfConfig) -> Self {
        Self { forecast, config }
    }

    /// Fractional rate uplift bought by `budget` dollars, with diminishing
    /// returns toward `budget_max_uplift`.
    #[must_use]
    pub fn budget_uplift(&self, budget: u64) -> f64 {
        if self.config.budget_scale <= 0.0 {
            return 0.0;
        }
        self.config.budget_max_uplift * (1.0 - (-(budget as f64) / self.config.budget_scale).exp())
    }

    #[must_use]
    pub fn support_uplift(&self, level: SupportLevel) -> (f64, u64) {
        let idx = match level {
            SupportLevel::Low => 0,
            SupportLevel::Medium => 1,
            SupportLevel::High => 2,
        };
        (self.config.support_uplift[idx], self.config.support_cost[idx])
    }

    pub fn evaluate(
        &self,
        scenario: &WhatIfScenario,
        baseline: &TrialBaseline,
    ) -> Result<WhatIfResult, TrackerError> {
        let intervention = Intervention::from_scenario(scenario)?;
        if let Some(site_id) = intervention.target_site() {
            if !baseline.site_series.contains_key(site_id) {
                return Err(TrackerError::InvalidScenario(format!(
                    "scenario {}: {site_id} is not an active site in trial {}",
                    scenario.scenario_id, baseline.input.trial_id
                )));
            }
        }
        if let Intervention::ReplaceSite {
            replacement_site_id,
            ..
        } = &intervention
        {
            if baseline.site_series.contains_key(replacement_site_id) {
                return Err(TrackerError::InvalidScenario(format!(
                    "scenario {}: {replacement_site_id} is already active in trial {}",
                    scenario.scenario_id, baseline.input.trial_id
                )));
            }
        }
        baseline.input.validate()?;

        let estimate = RateEstimate::fit(&baseline.input.weekly_totals, &self.forecast);
        let base = forecast::project(&baseline.input, &estimate);

        let window = self.forecast.rate_window;
        let remaining_weeks = baseline
            .input
            .total_weeks
            .saturating_sub(baseline.input.weeks_elapsed());
        let mut input = baseline.input.clone();
        let (rate, cost, description) = match &intervention {
            Intervention::AddRecruitmentBudget { site_id, budget } => {
                let uplift = self.budget_uplift(*budget);
                match site_id {
                    Some(site_id) => {
                        let site_rate = baseline.site_rate(site_id, window).unwrap_or(0.0);
                        (
                            estimate.rate + site_rate * uplift,
                            *budget,
                            format!(
                                "Add {} recruitment budget at {} ({site_id})",
                                format_dollars(*budget),
                                baseline.site_name(site_id)
                            ),
                        )
                    }
                    None => (
                        estimate.rate * (1.0 + uplift),
                        *budget,
                        format!("Add {} recruitment budget across all sites", format_dollars(*budget)),
                    ),
                }
            }
            Intervention::ReplaceSite {
                site_id,
                replacement_site_id,
            } => {
                let removed = baseline.site_rate(site_id, window).unwrap_or(0.0);
                let (added, source) = match baseline.candidate_rates.get(replacement_site_id) {
                    Some(rate) => (*rate, "historical rate"),
                    None => (baseline.peer_rate(site_id, window), "peer average rate"),
                };
                let ramp = if remaining_weeks == 0 {
                    0.0
                } else {
                    f64::from(remaining_weeks.saturating_sub(self.config.replacement_ramp_weeks))
                        / f64::from(remaining_weeks)
                };
                (
                    estimate.rate - removed + added * ramp,
                    self.config.replacement_cost,
                    format!(
                        "Replace {} ({site_id}) with {replacement_site_id} at its {source} of {added:.2} per week",
                        baseline.site_name(site_id)
                    ),
                )
            }
            Intervention::ExtendTrialDuration { extension_weeks } => {
                input.total_weeks = input.total_weeks.saturating_add(*extension_weeks);
                (
                    estimate.rate,
                    self.config
                        .extension_cost_per_week
                        .saturating_mul(u64::from(*extension_weeks)),
                    format!("Extend the trial by {extension_weeks} weeks"),
                )
            }
            Intervention::IncreaseSiteSupport { site_id, level } => {
                let (uplift, cost) = self.support_uplift(*level);
                let site_rate = baseline.site_rate(site_id, window).unwrap_or(0.0);
                (
                    estimate.rate + site_rate * uplift,
                    cost,
                    format!(
                        "Increase support at {} ({site_id}) to {} level",
                        baseline.site_name(site_id),
                        support_name(*level)
                    ),
                )
            }
        };

        let scenario_estimate = estimate.with_rate(rate, &self.forecast);
        let projected = forecast::project(&input, &scenario_estimate);

        let enrollment_improvement =
            i64::from(projected.expected_final_enrollment) - i64::from(base.expected_final_enrollment);
        let probability_improvement = forecast::round_to(
            projected.probability_of_meeting_target - base.probability_of_meeting_target,
            3,
        );
        let per_dollar = patients_per_dollar(enrollment_improvement, cost);
        let roi_assessment = self.assess(per_dollar, enrollment_improvement);
        let recommendation = recommendation(
            &description,
            roi_assessment,
            enrollment_improvement,
            cost,
            base.probability_of_meeting_target,
            projected.probability_of_meeting_target,
        );

        tracing::debug!(
            scenario_id = %scenario.scenario_id,
            improvement = enrollment_improvement,
            cost,
            roi = ?roi_assessment,
            "what-if evaluated"
        );

        Ok(WhatIfResult {
            scenario_id: scenario.scenario_id.clone(),
            intervention_type: intervention.intervention_type(),
            intervention_description: description,
            baseline_projected_enrollment: base.expected_final_enrollment,
            baseline_probability_meeting_target: base.probability_of_meeting_target,
            scenario_projected_enrollment: projected.expected_final_enrollment,
            scenario_probability_meeting_target: projected.probability_of_meeting_target,
            enrollment_improvement,
            probability_improvement,
            estimated_cost: cost,
            patients_per_dollar: per_dollar,
            roi_assessment,
            scenario_forecast_curve: projected.forecast_curve,
            recommendation,
        })
    }

    fn assess(&self, patients_per_dollar: Option<f64>, improvement: i64) -> RoiAssessment {
        match patients_per_dollar {
            // Free and still helpful.
            None if improvement > 0 => RoiAssessment::Excellent,
            None => RoiAssessment::Poor,
            Some(value) if value >= self.config.excellent_patients_per_dollar => RoiAssessment::Excellent,
            Some(value) if value >= self.config.good_patients_per_dollar => RoiAssessment::Good,
            Some(_) => RoiAssessment::Poor,
        }
    }
}

/// Improvement per dollar. Zero cost is only meaningful when nothing changed.
pub fn patients_per_dollar(improvement: i64, cost: u64) -> Option<f64> {
    match (improvement, cost) {
        (0, 0) => Some(0.0),
        (_, 0) => None,
        (improvement, cost) => Some(improvement as f64 / cost as f64),
    }
}

fn support_name(level: SupportLevel) -> &'static str {
    match level {
        SupportLevel::Low => "low",
        SupportLevel::Medium => "medium",
        SupportLevel::High => "high",
    }
}

fn recommendation(
    description: &str,
    roi: RoiAssessment,
    improvement: i64,
    cost: u64,
    baseline_probability: f64,
    scenario_probability: f64,
) -> String {
    let odds = format!(
        "{:.0}% to {:.0}%",
        baseline_probability * 100.0,
        scenario_probability * 100.0
    );
    if improvement <= 0 {
        return format!(
            "Not recommended. {description} does not raise projected enrollment (chance of meeting target {odds})."
        );
    }
    let per_patient = if cost > 0 {
        format!(", about {} per additional patient", format_dollars(cost / improvement as u64))
    } else {
        String::new()
    };
    let verdict = match roi {
        RoiAssessment::Excellent => "Recommended.",
        RoiAssessment::Good => "Worth considering.",
        RoiAssessment::Poor => "Not recommended on cost.",
    };
    format!(
        "{verdict} {description} adds about {improvement} patients for {}{per_patient}; chance of meeting target moves from {odds}.",
        format_dollars(cost)
    )
}

pub fn format_dollars(amount: u64) -> String {
    let digits = amount.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("${grouped}")
}
