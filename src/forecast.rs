use chrono::{Days, NaiveDate};

use crate::config::ForecastConfig;
use crate::error::TrackerError;
use crate::models::{EnrollmentForecast, ForecastDataPoint};

/// z-score of the 90th percentile of a standard normal.
pub const Z_P90: f64 = 1.281_551_565_545;

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastInput {
    pub trial_id: String,
    pub weekly_totals: Vec<u32>,
    pub target: u32,
    pub total_weeks: u32,
    pub first_week_ending: NaiveDate,
    pub forecast_date: NaiveDate,
    pub seed: u64,
}

impl ForecastInput {
    #[must_use]
    pub fn weeks_elapsed(&self) -> u32 {
        self.weekly_totals.len() as u32
    }

    #[must_use]
    pub fn current_total(&self) -> u32 {
        self.weekly_totals.iter().sum()
    }

    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.total_weeks == 0 {
            return Err(TrackerError::InvalidInput(
                "trial horizon must be at least one week".to_string(),
            ));
        }
        if self.weeks_elapsed() > self.total_weeks {
            return Err(TrackerError::InvalidInput(format!(
                "{} weeks observed but the trial horizon is {} weeks",
                self.weeks_elapsed(),
                self.total_weeks
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEstimate {
    pub rate: f64,
    pub variance: f64,
    pub window: usize,
}

impl RateEstimate {
    pub fn fit(weekly_totals: &[u32], config: &ForecastConfig) -> Self {
        let take = config.rate_window.max(1).min(weekly_totals.len());
        let recent = &weekly_totals[weekly_totals.len() - take..];
        let rate = mean(recent);
        let sample_variance = if recent.len() > 1 {
            recent
                .iter()
                .map(|&count| (f64::from(count) - rate).powi(2))
                .sum::<f64>()
                / (recent.len() - 1) as f64
        } else {
            0.0
        };

        Self {
            rate,
            variance: sample_variance.max(rate).max(config.variance_floor),
            window: take.max(1),
        }
    }

    /// Same walk with a different drift. Variance scales with the rate so a
    /// faster site is also a noisier one.
    #[must_use]
    pub fn with_rate(&self, rate: f64, config: &ForecastConfig) -> Self {
        let rate = rate.max(0.0);
        let variance = if self.rate > 0.0 {
            self.variance * rate / self.rate
        } else {
            self.variance
        };
        Self {
            rate,
            variance: variance.max(rate).max(config.variance_floor),
            window: self.window,
        }
    }

    /// Standard deviation of cumulative enrollment `horizon` weeks ahead.
    #[must_use]
    pub fn sigma(&self, horizon: u32) -> f64 {
        let h = f64::from(horizon);
        (self.variance * h * (1.0 + h / self.window as f64)).sqrt()
    }
}

pub fn forecast(
    input: &ForecastInput,
    config: &ForecastConfig,
) -> Result<EnrollmentForecast, TrackerError> {
    input.validate()?;
    let estimate = RateEstimate::fit(&input.weekly_totals, config);
    Ok(project(input, &estimate))
}

/// Replays the observed weeks and projects the rest of the horizon with
/// `estimate`. Callers are expected to have validated `input`.
pub fn project(input: &ForecastInput, estimate: &RateEstimate) -> EnrollmentForecast {
    let weeks_elapsed = input.weeks_elapsed();
    let total_weeks = input.total_weeks.max(weeks_elapsed);
    let current_total = input.current_total();
    let current = f64::from(current_total);

    let mut curve = Vec::with_capacity(total_weeks as usize);
    let mut cumulative = 0u32;
    for (week, count) in (1..).zip(input.weekly_totals.iter()) {
        cumulative += count;
        let value = f64::from(cumulative);
        curve.push(ForecastDataPoint {
            week,
            date: week_ending(input.first_week_ending, week),
            actual_enrollment: Some(cumulative),
            p10: value,
            p50: value,
            p90: value,
        });
    }

    let mut floor = current;
    let mut at_horizon = (current, current, current);
    for week in weeks_elapsed + 1..=total_weeks {
        let horizon = week - weeks_elapsed;
        let median = current + estimate.rate * f64::from(horizon);
        let spread = Z_P90 * estimate.sigma(horizon);
        // Enrollment never goes down, so the pessimistic curve cannot either.
        floor = floor.max(median - spread);
        let upper = median + spread;
        at_horizon = (floor, median, upper);

        curve.push(ForecastDataPoint {
            week,
            date: week_ending(input.first_week_ending, week),
            actual_enrollment: None,
            p10: round_to(floor, 2),
            p50: round_to(median, 2),
            p90: round_to(upper, 2),
        });
    }

    let (p10_final, p50_final, p90_final) = at_horizon;
    let target = f64::from(input.target);
    let probability = if current_total >= input.target {
        1.0
    } else if total_weeks == weeks_elapsed {
        0.0
    } else {
        let sigma = estimate.sigma(total_weeks - weeks_elapsed);
        let mut p = normal_cdf((p50_final - target) / sigma);
        // Clamp against the reported (rounded) band so the two always agree.
        if target <= round_to(p10_final, 2) {
            p = p.max(0.9);
        }
        if target >= round_to(p90_final, 2) {
            p = p.min(0.1);
        }
        p
    };

    EnrollmentForecast {
        trial_id: input.trial_id.clone(),
        forecast_date: input.forecast_date,
        weeks_elapsed,
        total_weeks,
        current_total_enrolled: current_total,
        target_total_enrollment: input.target,
        run_rate: round_to(estimate.rate, 2),
        projected_completion_date: completion_week(input, estimate)
            .and_then(|week| checked_week_ending(input.first_week_ending, week)),
        forecast_curve: curve,
        probability_of_meeting_target: round_to(probability.clamp(0.0, 1.0), 3),
        expected_final_enrollment: p50_final.floor() as u32,
        best_case_enrollment: p90_final.floor() as u32,
        worst_case_enrollment: p10_final.floor() as u32,
        seed: input.seed,
    }
}

/// First week at which the median reaches target, possibly past the
/// horizon. `None` when the trial is stalled below target.
fn completion_week(input: &ForecastInput, estimate: &RateEstimate) -> Option<u32> {
    let mut cumulative = 0u32;
    for (week, count) in (1..).zip(input.weekly_totals.iter()) {
        cumulative += count;
        if cumulative >= input.target {
            return Some(week);
        }
    }
    if estimate.rate <= 0.0 {
        return None;
    }
    let remaining = f64::from(input.target.saturating_sub(cumulative));
    let horizon = (remaining / estimate.rate).ceil().max(1.0) as u32;
    Some(input.weeks_elapsed().saturating_add(horizon))
}

/// Checks the invariants any forecast must satisfy, whoever produced it.
pub fn validate_forecast(forecast: &EnrollmentForecast) -> Result<(), String> {
    if !(0.0..=1.0).contains(&forecast.probability_of_meeting_target) {
        return Err(format!(
            "probability_of_meeting_target {} is outside [0, 1]",
            forecast.probability_of_meeting_target
        ));
    }
    if forecast.weeks_elapsed > forecast.total_weeks {
        return Err(format!(
            "weeks_elapsed {} exceeds total_weeks {}",
            forecast.weeks_elapsed, forecast.total_weeks
        ));
    }

    let mut previous: Option<&ForecastDataPoint> = None;
    for (expected_week, point) in (1..).zip(forecast.forecast_curve.iter()) {
        if point.week != expected_week {
            return Err(format!(
                "forecast curve skips from week {} to week {}",
                expected_week - 1,
                point.week
            ));
        }
        if point.week <= forecast.weeks_elapsed {
            let Some(actual) = point.actual_enrollment else {
                return Err(format!("observed week {} has no actual enrollment", point.week));
            };
            let actual = f64::from(actual);
            if [point.p10, point.p50, point.p90]
                .iter()
                .any(|value| (value - actual).abs() > 1e-6)
            {
                return Err(format!(
                    "observed week {} has quantiles that differ from the actual",
                    point.week
                ));
            }
        } else {
            if point.actual_enrollment.is_some() {
                return Err(format!("future week {} carries an actual enrollment", point.week));
            }
            if !(point.p10 <= point.p50 && point.p50 <= point.p90) {
                return Err(format!("week {} quantiles are out of order", point.week));
            }
            if let Some(prev) = previous.filter(|prev| prev.week > forecast.weeks_elapsed) {
                if point.p90 - point.p10 < prev.p90 - prev.p10 - 1e-9 {
                    return Err(format!("spread narrows at week {}", point.week));
                }
            }
        }
        if let Some(prev) = previous {
            if point.p10 < prev.p10 || point.p50 < prev.p50 || point.p90 < prev.p90 {
                return Err(format!("quantiles decrease at week {}", point.week));
            }
        }
        previous = Some(point);
    }

    if forecast.forecast_curve.len() != forecast.total_weeks as usize {
        return Err(format!(
            "forecast curve covers {} weeks, horizon is {}",
            forecast.forecast_curve.len(),
            forecast.total_weeks
        ));
    }
    Ok(())
}

/// Standard normal CDF via the Abramowitz-Stegun 7.1.26 erf approximation
/// (absolute error below 1.5e-7).
#[must_use]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

fn erf(x: f64) -> f64 {
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    ];

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

pub(crate) fn mean(values: &[u32]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| f64::from(v)).sum::<f64>() / values.len() as f64
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn week_ending(first_week_ending: NaiveDate, week: u32) -> NaiveDate {
    checked_week_ending(first_week_ending, week).unwrap_or(NaiveDate::MAX)
}

fn checked_week_ending(first_week_ending: NaiveDate, week: u32) -> Option<NaiveDate> {
    first_week_ending.checked_add_days(Days::new(7 * u64::from(week.saturating_sub(1))))
}
