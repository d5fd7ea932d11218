use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{Student, ValidationStatus};
use crate::registry::RegistryStatistics;
use crate::risk::AtRiskStudent;
use crate::validation::ValidationInsights;

const AT_RISK_LIMIT: usize = 10;

fn student_label(students: &HashMap<Uuid, Student>, id: Uuid) -> String {
    match students.get(&id) {
        Some(student) => format!("{} ({})", student.full_name, student.email),
        None => id.to_string(),
    }
}

pub fn build_report(
    generated_on: NaiveDate,
    statistics: &RegistryStatistics,
    insights: &ValidationInsights,
    at_risk: &[AtRiskStudent],
    students: &HashMap<Uuid, Student>,
) -> String {
    let mut output = String::new();
    let year_label = statistics.academic_year.as_deref().unwrap_or("all academic years");

    let _ = writeln!(output, "# Semester Progression Report");
    let _ = writeln!(output, "Generated on {} for {}", generated_on, year_label);
    let _ = writeln!(
        output,
        "{} cohorts, {} enrolled students, average utilization {:.1}%",
        statistics.total_cohorts, statistics.total_students, statistics.average_utilization
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Semesters");

    if statistics.semesters.is_empty() {
        let _ = writeln!(output, "No cohorts found.");
    } else {
        for semester in statistics.semesters.iter() {
            let pending = semester
                .status_breakdown
                .get(&ValidationStatus::PendingValidation)
                .copied()
                .unwrap_or(0);
            let _ = writeln!(
                output,
                "- {}: {}/{} students ({:.1}% full), {} pending validation, {} recent progressions",
                semester.name,
                semester.roster_size,
                semester.capacity,
                semester.utilization,
                pending,
                semester.recent_progressions
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Validation Status Mix");
    let total: usize = statistics.status_breakdown.values().sum();
    if total == 0 {
        let _ = writeln!(output, "No enrolled students.");
    } else {
        for (status, count) in statistics.status_breakdown.iter() {
            let _ = writeln!(
                output,
                "- {}: {} ({:.1}%)",
                status,
                count,
                *count as f64 / total as f64 * 100.0
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Decision Trend");
    for month in insights.trend.iter() {
        let _ = writeln!(
            output,
            "- {}: {} approved, {} conditional, {} rejected",
            month.month.format("%Y-%m"),
            month.approved,
            month.conditional,
            month.rejected
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Students at Risk");
    if at_risk.is_empty() {
        let _ = writeln!(output, "No students below the risk thresholds.");
    } else {
        for student in at_risk.iter().take(AT_RISK_LIMIT) {
            let reasons: Vec<&str> = student.reasons.iter().map(|r| r.as_str()).collect();
            let _ = writeln!(
                output,
                "- {} S{} severity {:.2}: progress {:.1}%, attendance {:.1}%, {} ({})",
                student_label(students, student.student_id),
                student.current_semester,
                student.severity,
                student.overall_progress,
                student.attendance_rate,
                student.validation_status,
                reasons.join(", ")
            );
        }
        if at_risk.len() > AT_RISK_LIMIT {
            let _ = writeln!(output, "- and {} more", at_risk.len() - AT_RISK_LIMIT);
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::models::UserRole;
    use crate::registry::SemesterSummary;
    use crate::risk::RiskReason;
    use crate::validation::MonthlyTrend;

    fn statistics() -> RegistryStatistics {
        let breakdown: BTreeMap<ValidationStatus, usize> = [
            (ValidationStatus::NotStarted, 3),
            (ValidationStatus::PendingValidation, 1),
        ]
        .into_iter()
        .collect();
        RegistryStatistics {
            academic_year: Some("2026-2027".into()),
            total_cohorts: 1,
            total_students: 4,
            average_utilization: 40.0,
            status_breakdown: breakdown.clone(),
            semesters: vec![SemesterSummary {
                cohort_id: Uuid::new_v4(),
                semester: 1,
                name: "S1 Autumn 2026-2027".into(),
                academic_year: "2026-2027".into(),
                status: crate::models::CohortStatus::Active,
                roster_size: 4,
                capacity: 10,
                utilization: 40.0,
                status_breakdown: breakdown,
                recent_progressions: 0,
            }],
        }
    }

    fn insights() -> ValidationInsights {
        ValidationInsights {
            cohort_id: None,
            status_counts: BTreeMap::new(),
            semesters: Vec::new(),
            trend: vec![MonthlyTrend {
                month: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
                approved: 2,
                rejected: 1,
                conditional: 0,
            }],
        }
    }

    #[test]
    fn report_lists_semesters_trend_and_risk() {
        let student_id = Uuid::new_v4();
        let students: HashMap<Uuid, Student> = [(
            student_id,
            Student {
                id: student_id,
                full_name: "Kiara Patel".into(),
                email: "kiara.patel@groupscholar.com".into(),
                role: UserRole::Student,
            },
        )]
        .into_iter()
        .collect();
        let at_risk = vec![AtRiskStudent {
            student_id,
            cohort_id: Uuid::new_v4(),
            current_semester: 1,
            overall_progress: 12.0,
            attendance_rate: 50.0,
            average_grade: 40.0,
            validation_status: ValidationStatus::NotStarted,
            severity: 0.9,
            reasons: vec![RiskReason::LowProgress, RiskReason::LowAttendance],
        }];

        let report = build_report(
            NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            &statistics(),
            &insights(),
            &at_risk,
            &students,
        );

        assert!(report.starts_with("# Semester Progression Report"));
        assert!(report.contains("- S1 Autumn 2026-2027: 4/10 students (40.0% full), 1 pending validation"));
        assert!(report.contains("- pending_validation: 1 (25.0%)"));
        assert!(report.contains("- 2026-10: 2 approved, 0 conditional, 1 rejected"));
        assert!(report.contains("Kiara Patel (kiara.patel@groupscholar.com) S1"));
        assert!(report.contains("low progress, low attendance"));
    }

    #[test]
    fn empty_sections_have_placeholders() {
        let statistics = RegistryStatistics {
            academic_year: None,
            total_cohorts: 0,
            total_students: 0,
            average_utilization: 0.0,
            status_breakdown: BTreeMap::new(),
            semesters: Vec::new(),
        };
        let report = build_report(
            NaiveDate::from_ymd_opt(2026, 10, 18).unwrap(),
            &statistics,
            &insights(),
            &[],
            &HashMap::new(),
        );
        assert!(report.contains("all academic years"));
        assert!(report.contains("No cohorts found."));
        assert!(report.contains("No students below the risk thresholds."));
    }
}
