//! Validation criteria engine.
//!
//! [`evaluate_record`] is the pure evaluator: three checks, a weighted 0-100
//! score and a deterministic recommendation. [`ValidationEngine`] loads
//! records for it, runs it over batches and applies decisions back onto
//! progress records.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::criteria::{CriteriaOverride, RuleMetric, ValidationCriteria};
use crate::error::{BatchFailure, Error, Result};
use crate::models::{
    CallerContext, ProgressRecord, ValidationDecision, ValidationHistoryEntry, ValidationStatus,
    FINAL_SEMESTER,
};
use crate::store::{ProgressFilter, Store};

const GRADE_WEIGHT: f64 = 40.0;
const ATTENDANCE_WEIGHT: f64 = 30.0;
const COMPLETION_WEIGHT: f64 = 30.0;
const TREND_MONTHS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Grade,
    Attendance,
    Completion,
}

impl Criterion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grade => "grade",
            Self::Attendance => "attendance",
            Self::Completion => "completion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    Conditional,
    Retake,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CriterionCheck {
    pub passed: bool,
    pub actual: f64,
    pub required: f64,
    /// `actual - required`; negative when short.
    pub difference: f64,
}

impl CriterionCheck {
    fn new(actual: f64, required: f64) -> Self {
        Self {
            passed: actual >= required,
            actual,
            required,
            difference: actual - required,
        }
    }

    fn unavailable() -> Self {
        Self {
            passed: false,
            actual: 0.0,
            required: 0.0,
            difference: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomCheck {
    pub name: String,
    pub metric: RuleMetric,
    pub passed: bool,
    pub actual: f64,
    pub required: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub student_id: Uuid,
    pub record_id: Option<Uuid>,
    pub cohort_id: Option<Uuid>,
    pub current_semester: Option<u8>,
    pub grade_check: CriterionCheck,
    pub attendance_check: CriterionCheck,
    pub completion_check: CriterionCheck,
    pub custom_checks: Vec<CustomCheck>,
    pub can_progress: bool,
    pub overall_score: u32,
    pub recommendation: Recommendation,
    pub reason: String,
    pub failed_criteria: Vec<Criterion>,
    /// Set when the student could not be evaluated at all.
    pub error: Option<String>,
}

impl ValidationResult {
    /// Stand-in for a student whose evaluation failed inside a batch.
    pub fn degraded(student_id: Uuid, error: &Error) -> Self {
        Self {
            student_id,
            record_id: None,
            cohort_id: None,
            current_semester: None,
            grade_check: CriterionCheck::unavailable(),
            attendance_check: CriterionCheck::unavailable(),
            completion_check: CriterionCheck::unavailable(),
            custom_checks: Vec::new(),
            can_progress: false,
            overall_score: 0,
            recommendation: Recommendation::Reject,
            reason: error.to_string(),
            failed_criteria: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

fn capped_share(actual: f64, required: f64, weight: f64) -> f64 {
    if required <= 0.0 {
        return weight;
    }
    (actual / required * weight).clamp(0.0, weight)
}

/// Weighted 0-100 composite. Grade and attendance contribute proportionally
/// up to their caps; completion is all or nothing.
pub fn overall_score(
    average_grade: f64,
    attendance_rate: f64,
    completion_passed: bool,
    criteria: &ValidationCriteria,
) -> u32 {
    let completion = if completion_passed { COMPLETION_WEIGHT } else { 0.0 };
    let score = capped_share(average_grade, criteria.min_grade, GRADE_WEIGHT)
        + capped_share(attendance_rate, criteria.min_attendance, ATTENDANCE_WEIGHT)
        + completion;
    score.round() as u32
}

fn list_criteria(failed: &[Criterion]) -> String {
    failed.iter().map(Criterion::as_str).collect::<Vec<_>>().join(", ")
}

/// Maps the outcome to a recommendation, first matching rule wins.
pub fn recommend(can_progress: bool, score: u32, failed: &[Criterion]) -> (Recommendation, String) {
    match (can_progress, score) {
        (true, 85..) => (Recommendation::Approve, "Excellent performance".into()),
        (true, 70..) => (Recommendation::Approve, "Good performance".into()),
        (true, _) => (
            Recommendation::Conditional,
            "Meets minimum criteria, monitor progress".into(),
        ),
        (false, 60..) => (
            Recommendation::Conditional,
            format!("Close to meeting criteria; failed: {}", list_criteria(failed)),
        ),
        (false, _) => (
            Recommendation::Retake,
            format!("Criteria not met: {}", list_criteria(failed)),
        ),
    }
}

fn metric_value(record: &ProgressRecord, metric: RuleMetric) -> f64 {
    match metric {
        RuleMetric::AverageGrade => record.average_grade,
        RuleMetric::AttendanceRate => record.attendance_rate,
        RuleMetric::CoursesCompleted => record.courses_completed.len() as f64,
        RuleMetric::OverallProgress => record.overall_progress,
    }
}

/// Evaluates a progress record against `criteria`.
pub fn evaluate_record(record: &ProgressRecord, criteria: &ValidationCriteria) -> ValidationResult {
    let grade_check = CriterionCheck::new(record.average_grade, criteria.min_grade);
    let attendance_check = CriterionCheck::new(record.attendance_rate, criteria.min_attendance);
    let completion_check = CriterionCheck::new(
        record.courses_completed.len() as f64,
        criteria.courses_required as f64,
    );

    let failed_criteria: Vec<Criterion> = [
        (Criterion::Grade, grade_check.passed),
        (Criterion::Attendance, attendance_check.passed),
        (Criterion::Completion, completion_check.passed),
    ]
    .into_iter()
    .filter(|(_, passed)| !passed)
    .map(|(criterion, _)| criterion)
    .collect();
    let can_progress = failed_criteria.is_empty();

    let overall_score = overall_score(
        record.average_grade,
        record.attendance_rate,
        completion_check.passed,
        criteria,
    );
    let (recommendation, reason) = recommend(can_progress, overall_score, &failed_criteria);

    let custom_checks = criteria
        .custom_rules
        .iter()
        .map(|rule| {
            let actual = metric_value(record, rule.metric);
            CustomCheck {
                name: rule.name.clone(),
                metric: rule.metric,
                passed: actual >= rule.min,
                actual,
                required: rule.min,
            }
        })
        .collect();

    ValidationResult {
        student_id: record.student_id,
        record_id: Some(record.id),
        cohort_id: Some(record.cohort_id),
        current_semester: Some(record.current_semester),
        grade_check,
        attendance_check,
        completion_check,
        custom_checks,
        can_progress,
        overall_score,
        recommendation,
        reason,
        failed_criteria,
        error: None,
    }
}

/// Semester to move to after a positive decision; none past the last one.
pub fn next_semester(current: u8) -> Option<u8> {
    (current < FINAL_SEMESTER).then(|| current + 1)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkSummary {
    pub approved: usize,
    pub rejected: usize,
    pub conditional: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
pub struct BulkValidationResult {
    pub evaluations: Vec<ValidationResult>,
    pub successful: Vec<Uuid>,
    pub failed: Vec<BatchFailure>,
    pub summary: BulkSummary,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SemesterInsight {
    pub semester: u8,
    pub total: usize,
    pub pending: usize,
    pub validated: usize,
    pub conditional: usize,
    pub failed: usize,
    pub average_grade: f64,
    pub average_attendance: f64,
    /// Share of records validated, as a percentage.
    pub validation_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyTrend {
    pub month: NaiveDate,
    pub approved: usize,
    pub rejected: usize,
    pub conditional: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationInsights {
    pub cohort_id: Option<Uuid>,
    pub status_counts: BTreeMap<ValidationStatus, usize>,
    pub semesters: Vec<SemesterInsight>,
    pub trend: Vec<MonthlyTrend>,
}

#[derive(Clone)]
pub struct ValidationEngine {
    store: Arc<dyn Store>,
    settings: Arc<Settings>,
}

impl ValidationEngine {
    pub fn new(store: Arc<dyn Store>, settings: Arc<Settings>) -> Self {
        Self { store, settings }
    }

    async fn current_record(&self, student_id: Uuid) -> Result<ProgressRecord> {
        self.store
            .current_progress(student_id)
            .await?
            .ok_or_else(|| Error::not_found("progress record", student_id))
    }

    /// Evaluates the student's current record, with `overrides` applied on
    /// top of the record's effective criteria.
    pub async fn evaluate(
        &self,
        student_id: Uuid,
        overrides: Option<&CriteriaOverride>,
    ) -> Result<ValidationResult> {
        let record = self.current_record(student_id).await?;
        let criteria = match overrides {
            Some(overrides) => record.validation_criteria.merged(overrides)?,
            None => record.validation_criteria.clone(),
        };
        Ok(evaluate_record(&record, &criteria))
    }

    /// Evaluates students in fixed-size chunks with a pause between chunks.
    /// A failed evaluation becomes a degraded result instead of an error.
    #[instrument(skip(self, student_ids, overrides), fields(count = student_ids.len()))]
    pub async fn evaluate_batch(
        &self,
        student_ids: &[Uuid],
        overrides: Option<&CriteriaOverride>,
    ) -> Vec<ValidationResult> {
        let mut results = Vec::with_capacity(student_ids.len());
        let chunk_size = self.settings.batch_chunk_size.max(1);

        for (index, chunk) in student_ids.chunks(chunk_size).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.batch_pause()).await;
            }
            let evaluations = chunk.iter().map(|student_id| async move {
                match self.evaluate(*student_id, overrides).await {
                    Ok(result) => result,
                    Err(error) => {
                        warn!(%student_id, %error, "evaluation failed");
                        ValidationResult::degraded(*student_id, &error)
                    }
                }
            });
            results.extend(join_all(evaluations).await);
        }
        results
    }

    /// Records one decision on the student's current record.
    pub async fn apply_decision(
        &self,
        caller: &CallerContext,
        student_id: Uuid,
        decision: ValidationDecision,
        reason: Option<String>,
        notes: Option<String>,
    ) -> Result<ProgressRecord> {
        let record = self.current_record(student_id).await?;
        let status = decision.resulting_status();
        if !record.validation_status.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: record.validation_status,
                to: status,
            });
        }
        let target_semester = match decision {
            ValidationDecision::Approve | ValidationDecision::Conditional => {
                next_semester(record.current_semester)
            }
            ValidationDecision::Reject => None,
        };
        let entry = ValidationHistoryEntry {
            validator_id: caller.caller_id,
            decision,
            reason,
            notes,
            decided_at: Utc::now(),
            target_semester,
        };
        self.store
            .apply_validation(record.id, &entry, status, target_semester)
            .await
    }

    /// Evaluates the batch, then applies `decision` to every student.
    ///
    /// Every student is attempted; apply failures are collected in `failed`
    /// next to the evaluations and counted in `summary.errors`.
    #[instrument(
        skip(self, caller, student_ids, decision, reason, notes, overrides),
        fields(count = student_ids.len(), decision = decision.as_str())
    )]
    pub async fn perform_bulk_validation(
        &self,
        caller: &CallerContext,
        student_ids: &[Uuid],
        decision: ValidationDecision,
        reason: Option<String>,
        notes: Option<String>,
        overrides: Option<&CriteriaOverride>,
    ) -> Result<BulkValidationResult> {
        if let Some(overrides) = overrides {
            overrides.validate()?;
        }
        let mut result = BulkValidationResult {
            evaluations: self.evaluate_batch(student_ids, overrides).await,
            ..Default::default()
        };

        for chunk in student_ids.chunks(self.settings.batch_chunk_size.max(1)) {
            let applies = chunk.iter().map(|student_id| {
                let reason = reason.clone();
                let notes = notes.clone();
                async move {
                    let outcome = self
                        .apply_decision(caller, *student_id, decision, reason, notes)
                        .await;
                    (*student_id, outcome)
                }
            });
            for (student_id, outcome) in join_all(applies).await {
                match outcome {
                    Ok(_) => {
                        result.successful.push(student_id);
                        match decision {
                            ValidationDecision::Approve => result.summary.approved += 1,
                            ValidationDecision::Reject => result.summary.rejected += 1,
                            ValidationDecision::Conditional => result.summary.conditional += 1,
                        }
                    }
                    Err(error) => {
                        warn!(%student_id, %error, "validation apply failed");
                        result.failed.push(BatchFailure::new(
                            student_id,
                            Error::ValidationApplyFailure {
                                student_id,
                                source: Box::new(error),
                            },
                        ));
                    }
                }
            }
        }
        result.summary.errors = result.failed.len();

        info!(
            approved = result.summary.approved,
            rejected = result.summary.rejected,
            conditional = result.summary.conditional,
            errors = result.summary.errors,
            "bulk validation finished"
        );
        Ok(result)
    }

    /// Pending students whose cohort allows auto-validation and whose own
    /// evaluation recommends approval. Both conditions are required.
    pub async fn get_auto_validation_candidates(&self) -> Result<Vec<ValidationResult>> {
        let pending = self
            .store
            .list_progress(&ProgressFilter::with_status(ValidationStatus::PendingValidation))
            .await?;
        let mut auto_enabled: HashMap<Uuid, bool> = HashMap::new();
        let mut candidates = Vec::new();

        for record in pending {
            let enabled = match auto_enabled.get(&record.cohort_id) {
                Some(enabled) => *enabled,
                None => {
                    let enabled = self
                        .store
                        .get_cohort(record.cohort_id)
                        .await?
                        .map_or(false, |cohort| cohort.criteria.auto_validation);
                    auto_enabled.insert(record.cohort_id, enabled);
                    enabled
                }
            };
            if !enabled {
                continue;
            }
            let result = evaluate_record(&record, &record.validation_criteria);
            if result.recommendation == Recommendation::Approve {
                candidates.push(result);
            }
        }
        Ok(candidates)
    }

    /// Approves exactly the auto-validation candidates as the system validator.
    #[instrument(skip(self))]
    pub async fn process_auto_validations(&self) -> Result<BulkValidationResult> {
        let candidates: Vec<Uuid> = self
            .get_auto_validation_candidates()
            .await?
            .into_iter()
            .map(|result| result.student_id)
            .collect();
        if candidates.is_empty() {
            info!("no auto-validation candidates");
            return Ok(BulkValidationResult::default());
        }
        let system = CallerContext::system(self.settings.system_validator_id);
        self.perform_bulk_validation(
            &system,
            &candidates,
            ValidationDecision::Approve,
            Some("Automatic validation: criteria met".into()),
            None,
            None,
        )
        .await
    }

    /// Status counts, per-semester breakdown and a monthly decision trend.
    pub async fn get_validation_insights(&self, cohort_id: Option<Uuid>) -> Result<ValidationInsights> {
        let mut filter = ProgressFilter {
            include_superseded: true,
            ..Default::default()
        };
        if let Some(cohort_id) = cohort_id {
            filter = filter.in_cohorts(vec![cohort_id]);
        }
        let records = self.store.list_progress(&filter).await?;
        let today = Utc::now().date_naive();
        Ok(build_insights(cohort_id, &records, today))
    }
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Aggregates insights over `records`; superseded records only contribute
/// their decision history.
pub fn build_insights(
    cohort_id: Option<Uuid>,
    records: &[ProgressRecord],
    today: NaiveDate,
) -> ValidationInsights {
    let mut status_counts: BTreeMap<ValidationStatus, usize> = BTreeMap::new();
    let mut by_semester: BTreeMap<u8, Vec<&ProgressRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.is_active()) {
        *status_counts.entry(record.validation_status).or_insert(0) += 1;
        by_semester.entry(record.current_semester).or_default().push(record);
    }

    let semesters = by_semester
        .into_iter()
        .map(|(semester, group)| {
            let count = |status| group.iter().filter(|r| r.validation_status == status).count();
            let total = group.len();
            let validated = count(ValidationStatus::Validated);
            SemesterInsight {
                semester,
                total,
                pending: count(ValidationStatus::PendingValidation),
                validated,
                conditional: count(ValidationStatus::Conditional),
                failed: count(ValidationStatus::Failed),
                average_grade: group.iter().map(|r| r.average_grade).sum::<f64>() / total as f64,
                average_attendance: group.iter().map(|r| r.attendance_rate).sum::<f64>()
                    / total as f64,
                validation_rate: validated as f64 / total as f64 * 100.0,
            }
        })
        .collect();

    let current_month = month_start(today);
    let mut trend: Vec<MonthlyTrend> = (0..TREND_MONTHS)
        .rev()
        .filter_map(|back| current_month.checked_sub_months(Months::new(back)))
        .map(|month| MonthlyTrend {
            month,
            approved: 0,
            rejected: 0,
            conditional: 0,
        })
        .collect();
    for entry in records.iter().flat_map(|r| &r.validation_history) {
        let month = month_start(entry.decided_at.date_naive());
        if let Some(bucket) = trend.iter_mut().find(|t| t.month == month) {
            match entry.decision {
                ValidationDecision::Approve => bucket.approved += 1,
                ValidationDecision::Reject => bucket.rejected += 1,
                ValidationDecision::Conditional => bucket.conditional += 1,
            }
        }
    }

    ValidationInsights {
        cohort_id,
        status_counts,
        semesters,
        trend,
    }
}
