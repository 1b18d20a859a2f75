use std::time::Duration;

use crate::error::TrackerError;

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub max_backoff: Duration,
    pub max_consecutive_failures: u32,
    pub max_total_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            fetch_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(30),
            max_consecutive_failures: 8,
            max_total_wait: Duration::from_secs(30 * 60),
        }
    }
}

impl PollPolicy {
    /// Delay before the next fetch after `consecutive_failures` failed fetches
    /// in a row: the interval doubled per failure, capped at `max_backoff`.
    #[must_use]
    pub fn retry_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.interval;
        }
        let exponent = (consecutive_failures - 1).min(16);
        self.interval
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff.max(self.interval))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastConfig {
    pub rate_window: usize,
    /// Lower bound on per-week variance so the spread never collapses.
    pub variance_floor: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            rate_window: 4,
            variance_floor: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhatIfConfig {
    /// Largest fractional rate uplift any recruitment budget can buy.
    pub budget_max_uplift: f64,
    /// Budget (dollars) at which ~63% of the maximum uplift is reached.
    pub budget_scale: f64,
    pub replacement_cost: u64,
    pub replacement_ramp_weeks: u32,
    pub extension_cost_per_week: u64,
    pub support_uplift: [f64; 3],
    pub support_cost: [u64; 3],
    pub excellent_patients_per_dollar: f64,
    pub good_patients_per_dollar: f64,
}

impl Default for WhatIfConfig {
    fn default() -> Self {
        Self {
            budget_max_uplift: 0.5,
            budget_scale: 100_000.0,
            replacement_cost: 100_000,
            replacement_ramp_weeks: 4,
            extension_cost_per_week: 5_000,
            support_uplift: [0.10, 0.20, 0.30],
            support_cost: [10_000, 25_000, 50_000],
            excellent_patients_per_dollar: 0.0004,
            good_patients_per_dollar: 0.0002,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub api_url: String,
    pub poll: PollPolicy,
    pub forecast: ForecastConfig,
    pub what_if: WhatIfConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            poll: PollPolicy::default(),
            forecast: ForecastConfig::default(),
            what_if: WhatIfConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Reads `TRIAL_API_URL`, `TRIAL_POLL_INTERVAL_MS` and
    /// `TRIAL_FETCH_TIMEOUT_SECS`, keeping defaults for anything unset.
    pub fn from_env() -> Result<Self, TrackerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, TrackerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("TRIAL_API_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(TrackerError::Config(format!(
                    "TRIAL_API_URL must be an http(s) URL, got {url:?}"
                )));
            }
            config.api_url = url;
        }
        if let Some(raw) = lookup("TRIAL_POLL_INTERVAL_MS") {
            config.poll.interval = Duration::from_millis(parse_positive("TRIAL_POLL_INTERVAL_MS", &raw)?);
        }
        if let Some(raw) = lookup("TRIAL_FETCH_TIMEOUT_SECS") {
            config.poll.fetch_timeout = Duration::from_secs(parse_positive("TRIAL_FETCH_TIMEOUT_SECS", &raw)?);
        }

        Ok(config)
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, TrackerError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(TrackerError::Config(format!(
            "{key} must be a positive integer, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = TrackerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_url, DEFAULT_API_URL);
        assert_eq!(config.poll.interval, Duration::from_millis(2000));
    }

    #[test]
    fn env_values_override_defaults() {
        let config = TrackerConfig::from_lookup(lookup(&[
            ("TRIAL_API_URL", "https://trials.example.org/api/"),
            ("TRIAL_POLL_INTERVAL_MS", "500"),
            ("TRIAL_FETCH_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.api_url, "https://trials.example.org/api");
        assert_eq!(config.poll.interval, Duration::from_millis(500));
        assert_eq!(config.poll.fetch_timeout, Duration::from_secs(3));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        assert!(TrackerConfig::from_lookup(lookup(&[("TRIAL_POLL_INTERVAL_MS", "0")])).is_err());
        assert!(TrackerConfig::from_lookup(lookup(&[("TRIAL_API_URL", "localhost")])).is_err());
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = PollPolicy::default();
        assert_eq!(policy.retry_delay(0), Duration::from_secs(2));
        assert_eq!(policy.retry_delay(1), Duration::from_secs(2));
        assert_eq!(policy.retry_delay(2), Duration::from_secs(4));
        assert_eq!(policy.retry_delay(4), Duration::from_secs(16));
        assert_eq!(policy.retry_delay(5), Duration::from_secs(30));
        assert_eq!(policy.retry_delay(40), Duration::from_secs(30));
    }
}
