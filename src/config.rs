//! Engine settings: defaults, an optional TOML file, then environment overrides.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use uuid::Uuid;

use crate::criteria::ValidationCriteria;
use crate::error::{Error, Result};

/// Validator identity recorded for system-driven decisions.
pub const SYSTEM_VALIDATOR_ID: Uuid = Uuid::from_u128(0x5e3e_57e4_0000_4000_8000_0000_0000_0001);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub batch_chunk_size: usize,
    pub batch_pause_ms: u64,
    pub validation_window_days: i64,
    pub cohort_capacity: u32,
    pub current_academic_year: Option<String>,
    pub default_criteria: ValidationCriteria,
    pub at_risk_progress: f64,
    pub at_risk_attendance: f64,
    pub system_validator_id: Uuid,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            batch_chunk_size: 5,
            batch_pause_ms: 100,
            validation_window_days: 30,
            cohort_capacity: 60,
            current_academic_year: None,
            default_criteria: ValidationCriteria::default(),
            at_risk_progress: 40.0,
            at_risk_attendance: 60.0,
            system_validator_id: SYSTEM_VALIDATOR_ID,
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Applies `KEY=value` overrides resolved through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(year) = lookup("CURRENT_ACADEMIC_YEAR") {
            parse_academic_year(&year)?;
            self.current_academic_year = Some(year);
        }
        override_parsed(&lookup, "DB_MAX_CONNECTIONS", &mut self.max_connections)?;
        override_parsed(&lookup, "BATCH_CHUNK_SIZE", &mut self.batch_chunk_size)?;
        override_parsed(&lookup, "BATCH_PAUSE_MS", &mut self.batch_pause_ms)?;
        override_parsed(&lookup, "VALIDATION_WINDOW_DAYS", &mut self.validation_window_days)?;
        override_parsed(&lookup, "COHORT_CAPACITY", &mut self.cohort_capacity)?;
        override_parsed(&lookup, "MIN_GRADE", &mut self.default_criteria.min_grade)?;
        override_parsed(&lookup, "MIN_ATTENDANCE", &mut self.default_criteria.min_attendance)?;
        override_parsed(&lookup, "COURSES_REQUIRED", &mut self.default_criteria.courses_required)?;
        override_parsed(&lookup, "AUTO_VALIDATION", &mut self.default_criteria.auto_validation)?;
        override_parsed(&lookup, "AT_RISK_PROGRESS", &mut self.at_risk_progress)?;
        override_parsed(&lookup, "AT_RISK_ATTENDANCE", &mut self.at_risk_attendance)?;
        override_parsed(&lookup, "SYSTEM_VALIDATOR_ID", &mut self.system_validator_id)?;

        if self.batch_chunk_size == 0 {
            return Err(Error::Config("BATCH_CHUNK_SIZE must be at least 1".into()));
        }
        self.default_criteria
            .validate()
            .map_err(|e| Error::Config(e.to_string()))
    }

    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    /// Configured academic year, or the one containing `today`.
    pub fn academic_year_for(&self, today: NaiveDate) -> String {
        self.current_academic_year
            .clone()
            .unwrap_or_else(|| academic_year_containing(today))
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw}: {e}")))?;
    }
    Ok(())
}

/// Academic years start in September and are labelled `YYYY-YYYY`.
pub fn academic_year_containing(date: NaiveDate) -> String {
    let start = if date.month() >= 9 {
        date.year()
    } else {
        date.year() - 1
    };
    format!("{}-{}", start, start + 1)
}

/// Returns the starting calendar year of a `YYYY-YYYY` label.
pub fn parse_academic_year(label: &str) -> Result<i32> {
    let invalid = || Error::InvalidInput(format!("academic year '{label}' is not YYYY-YYYY"));
    let (start, end) = label.split_once('-').ok_or_else(invalid)?;
    let start: i32 = start.parse().map_err(|_| invalid())?;
    let end: i32 = end.parse().map_err(|_| invalid())?;
    if end != start + 1 {
        return Err(invalid());
    }
    Ok(start)
}
