use std::io::{Read, Write};
use std::path::Path;

use chrono::NaiveDate;

use crate::error::TrackerError;
use crate::models::{SiteDescriptor, SiteEnrollmentStatus, SiteProfile, WeeklyEnrollment};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteDirectory {
    pub active: Vec<SiteDescriptor>,
    pub candidates: Vec<SiteDescriptor>,
}

pub fn load_weekly_feed(path: &Path) -> Result<Vec<WeeklyEnrollment>, TrackerError> {
    let file = std::fs::File::open(path)?;
    read_weekly_feed(file)
}

/// Reads `week, week_ending_date, site_id, patients_screened,
/// patients_enrolled[, screen_fail_reasons]` rows.
pub fn read_weekly_feed<R: Read>(reader: R) -> Result<Vec<WeeklyEnrollment>, TrackerError> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        week: u32,
        week_ending_date: NaiveDate,
        site_id: String,
        patients_screened: u32,
        patients_enrolled: u32,
        #[serde(default)]
        screen_fail_reasons: Option<String>,
    }

    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        if row.week == 0 {
            return Err(TrackerError::InvalidInput(format!(
                "site {} has a row for week 0; weeks start at 1",
                row.site_id
            )));
        }
        rows.push(WeeklyEnrollment {
            week: row.week,
            week_ending_date: row.week_ending_date,
            site_id: row.site_id,
            patients_screened: row.patients_screened,
            patients_enrolled: row.patients_enrolled,
            screen_fail_reasons: row.screen_fail_reasons.unwrap_or_default(),
        });
    }

    tracing::debug!(rows = rows.len(), "weekly enrollment feed loaded");
    Ok(rows)
}

pub fn load_site_profiles(path: &Path) -> Result<Vec<SiteProfile>, TrackerError> {
    let file = std::fs::File::open(path)?;
    read_site_profiles(file)
}

/// Reads merged site profile rows; column names match [`SiteProfile`].
pub fn read_site_profiles<R: Read>(reader: R) -> Result<Vec<SiteProfile>, TrackerError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut profiles = Vec::new();
    for result in reader.deserialize::<SiteProfile>() {
        profiles.push(result?);
    }
    Ok(profiles)
}

pub fn load_site_directory(path: &Path) -> Result<SiteDirectory, TrackerError> {
    let file = std::fs::File::open(path)?;
    read_site_directory(file)
}

/// Reads `site_id, site_name, city, state, target_enrollment,
/// historical_weekly_rate, role` rows. `role` is `active` (the default) or
/// `candidate`.
pub fn read_site_directory<R: Read>(reader: R) -> Result<SiteDirectory, TrackerError> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        site_id: String,
        site_name: String,
        #[serde(default)]
        city: String,
        #[serde(default)]
        state: String,
        #[serde(default)]
        target_enrollment: Option<u32>,
        #[serde(default)]
        historical_weekly_rate: Option<f64>,
        #[serde(default)]
        role: Option<String>,
    }

    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut directory = SiteDirectory::default();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let role = row.role.unwrap_or_default().to_lowercase();
        let site = SiteDescriptor {
            site_id: row.site_id,
            site_name: row.site_name,
            city: row.city,
            state: row.state,
            target_enrollment: row.target_enrollment,
            historical_weekly_rate: row.historical_weekly_rate,
        };
        match role.as_str() {
            "" | "active" => directory.active.push(site),
            "candidate" => directory.candidates.push(site),
            other => {
                return Err(TrackerError::InvalidInput(format!(
                    "site {} has unknown role {other:?} (expected active or candidate)",
                    site.site_id
                )))
            }
        }
    }

    Ok(directory)
}

pub fn write_site_statuses<W: Write>(
    writer: W,
    statuses: &[SiteEnrollmentStatus],
) -> Result<(), TrackerError> {
    let mut writer = csv::Writer::from_writer(writer);
    for status in statuses {
        writer.serialize(status)?;
    }
    writer.flush()?;
    Ok(())
}
