use serde::Serialize;
use uuid::Uuid;

use crate::config::Settings;
use crate::models::{ProgressRecord, ValidationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskReason {
    LowProgress,
    LowAttendance,
}

impl RiskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowProgress => "low progress",
            Self::LowAttendance => "low attendance",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskThresholds {
    pub progress: f64,
    pub attendance: f64,
}

impl RiskThresholds {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            progress: settings.at_risk_progress,
            attendance: settings.at_risk_attendance,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AtRiskStudent {
    pub student_id: Uuid,
    pub cohort_id: Uuid,
    pub current_semester: u8,
    pub overall_progress: f64,
    pub attendance_rate: f64,
    pub average_grade: f64,
    pub validation_status: ValidationStatus,
    pub severity: f64,
    pub reasons: Vec<RiskReason>,
}

/// Active records under either threshold, worst first.
pub fn find_at_risk(records: &[ProgressRecord], thresholds: RiskThresholds) -> Vec<AtRiskStudent> {
    let mut flagged: Vec<AtRiskStudent> = records
        .iter()
        .filter(|record| record.is_active())
        .filter_map(|record| {
            let mut reasons = Vec::new();
            if record.overall_progress < thresholds.progress {
                reasons.push(RiskReason::LowProgress);
            }
            if record.attendance_rate < thresholds.attendance {
                reasons.push(RiskReason::LowAttendance);
            }
            if reasons.is_empty() {
                return None;
            }

            let shortfall = shortfall(record.overall_progress, thresholds.progress)
                + shortfall(record.attendance_rate, thresholds.attendance);
            Some(AtRiskStudent {
                student_id: record.student_id,
                cohort_id: record.cohort_id,
                current_semester: record.current_semester,
                overall_progress: record.overall_progress,
                attendance_rate: record.attendance_rate,
                average_grade: record.average_grade,
                validation_status: record.validation_status,
                severity: shortfall * status_weight(record.validation_status),
                reasons,
            })
        })
        .collect();

    flagged.sort_by(|a, b| b.severity.partial_cmp(&a.severity).unwrap_or(std::cmp::Ordering::Equal));
    flagged
}

/// Fraction of `threshold` still missing, 0 when met.
fn shortfall(actual: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 0.0;
    }
    ((threshold - actual) / threshold).clamp(0.0, 1.0)
}

pub fn status_weight(status: ValidationStatus) -> f64 {
    match status {
        ValidationStatus::Failed => 1.5,
        ValidationStatus::Conditional => 1.2,
        ValidationStatus::PendingValidation => 1.1,
        ValidationStatus::NotStarted | ValidationStatus::Validated => 1.0,
    }
}
