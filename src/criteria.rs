//! Validation thresholds and their field-level overrides.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMetric {
    AverageGrade,
    AttendanceRate,
    CoursesCompleted,
    OverallProgress,
}

/// An advisory threshold evaluated next to the three standard checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRule {
    pub name: String,
    pub metric: RuleMetric,
    pub min: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCriteria {
    pub min_grade: f64,
    pub min_attendance: f64,
    pub courses_required: u32,
    pub auto_validation: bool,
    #[serde(default)]
    pub custom_rules: Vec<CustomRule>,
}

impl Default for ValidationCriteria {
    fn default() -> Self {
        Self {
            min_grade: 60.0,
            min_attendance: 70.0,
            courses_required: 1,
            auto_validation: false,
            custom_rules: Vec::new(),
        }
    }
}

impl ValidationCriteria {
    pub fn validate(&self) -> Result<()> {
        check_percentage("min_grade", self.min_grade)?;
        check_percentage("min_attendance", self.min_attendance)?;
        for rule in &self.custom_rules {
            if rule.name.trim().is_empty() {
                return Err(Error::InvalidCriteria("custom rule without a name".into()));
            }
            if !rule.min.is_finite() || rule.min < 0.0 {
                return Err(Error::InvalidCriteria(format!(
                    "custom rule '{}' has invalid minimum {}",
                    rule.name, rule.min
                )));
            }
        }
        Ok(())
    }

    /// Applies `overrides` on top of these criteria; only fields present in
    /// the override change. The result is validated.
    pub fn merged(&self, overrides: &CriteriaOverride) -> Result<ValidationCriteria> {
        let merged = ValidationCriteria {
            min_grade: overrides.min_grade.unwrap_or(self.min_grade),
            min_attendance: overrides.min_attendance.unwrap_or(self.min_attendance),
            courses_required: overrides.courses_required.unwrap_or(self.courses_required),
            auto_validation: overrides.auto_validation.unwrap_or(self.auto_validation),
            custom_rules: overrides
                .custom_rules
                .clone()
                .unwrap_or_else(|| self.custom_rules.clone()),
        };
        merged.validate()?;
        Ok(merged)
    }
}

fn check_percentage(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return Err(Error::InvalidCriteria(format!(
            "{field} must be between 0 and 100, got {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriteriaOverride {
    pub min_grade: Option<f64>,
    pub min_attendance: Option<f64>,
    pub courses_required: Option<u32>,
    pub auto_validation: Option<bool>,
    pub custom_rules: Option<Vec<CustomRule>>,
}

impl CriteriaOverride {
    /// Checks the fields that are present.
    pub fn validate(&self) -> Result<()> {
        ValidationCriteria::default().merged(self).map(|_| ())
    }

    pub fn is_empty(&self) -> bool {
        self.min_grade.is_none()
            && self.min_attendance.is_none()
            && self.courses_required.is_none()
            && self.auto_validation.is_none()
            && self.custom_rules.is_none()
    }
}
