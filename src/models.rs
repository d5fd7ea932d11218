use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::criteria::ValidationCriteria;
use crate::error::Error;

pub const FIRST_SEMESTER: u8 = 1;
pub const FINAL_SEMESTER: u8 = 10;

pub fn is_valid_semester(semester: u8) -> bool {
    (FIRST_SEMESTER..=FINAL_SEMESTER).contains(&semester)
}

/// Odd semesters open in autumn, even ones in spring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeSeason {
    Autumn,
    Spring,
}

impl IntakeSeason {
    pub fn for_semester(semester: u8) -> Self {
        if semester % 2 == 1 {
            Self::Autumn
        } else {
            Self::Spring
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Autumn => "autumn",
            Self::Spring => "spring",
        }
    }
}

impl FromStr for IntakeSeason {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "autumn" => Ok(Self::Autumn),
            "spring" => Ok(Self::Spring),
            other => Err(Error::InvalidInput(format!("unknown intake season '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortStatus {
    Draft,
    Active,
    Archived,
}

impl CohortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for CohortStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(Error::InvalidInput(format!("unknown cohort status '{other}'"))),
        }
    }
}

/// A permanent semester-numbered group of students for one academic year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemesterCohort {
    pub id: Uuid,
    pub semester: u8,
    pub intake: IntakeSeason,
    pub academic_year: String,
    pub name: String,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub status: CohortStatus,
    pub roster: BTreeSet<Uuid>,
    pub event_ids: BTreeSet<Uuid>,
    pub criteria: ValidationCriteria,
    pub capacity: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SemesterCohort {
    pub fn is_archived(&self) -> bool {
        self.status == CohortStatus::Archived
    }

    /// Roster size as a percentage of capacity.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.roster.len() as f64 / self.capacity as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct NewCohort {
    pub semester: u8,
    pub academic_year: String,
    pub name: Option<String>,
    pub starts_on: NaiveDate,
    pub ends_on: NaiveDate,
    pub status: CohortStatus,
    pub criteria: ValidationCriteria,
    pub capacity: u32,
}

/// Field-level cohort update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct CohortUpdate {
    pub name: Option<String>,
    pub starts_on: Option<NaiveDate>,
    pub ends_on: Option<NaiveDate>,
    pub status: Option<CohortStatus>,
    pub criteria: Option<ValidationCriteria>,
    pub capacity: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    NotStarted,
    PendingValidation,
    Validated,
    Conditional,
    Failed,
}

impl ValidationStatus {
    pub const ALL: [ValidationStatus; 5] = [
        Self::NotStarted,
        Self::PendingValidation,
        Self::Validated,
        Self::Conditional,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::PendingValidation => "pending_validation",
            Self::Validated => "validated",
            Self::Conditional => "conditional",
            Self::Failed => "failed",
        }
    }

    /// Whether a record in this state may move to `next`.
    ///
    /// Decisions require a prior review: a record never jumps from
    /// `not_started` straight to a decision. `failed` only reopens through a
    /// new review. Re-deciding a `validated` or `conditional` record is
    /// allowed so the latest decision wins.
    pub fn can_transition_to(&self, next: ValidationStatus) -> bool {
        use ValidationStatus::*;
        match (self, next) {
            (NotStarted, PendingValidation) | (Failed, PendingValidation) => true,
            (NotStarted, _) | (Failed, _) => false,
            (_, Validated) | (_, Conditional) | (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValidationStatus {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| Error::InvalidInput(format!("unknown validation status '{value}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationDecision {
    Approve,
    Reject,
    Conditional,
}

impl ValidationDecision {
    pub fn resulting_status(&self) -> ValidationStatus {
        match self {
            Self::Approve => ValidationStatus::Validated,
            Self::Reject => ValidationStatus::Failed,
            Self::Conditional => ValidationStatus::Conditional,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Conditional => "conditional",
        }
    }
}

impl FromStr for ValidationDecision {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "conditional" => Ok(Self::Conditional),
            other => Err(Error::InvalidInput(format!("unknown decision '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationHistoryEntry {
    pub validator_id: Uuid,
    pub decision: ValidationDecision,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
    pub target_semester: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseProgress {
    pub chapters_completed: u32,
    pub exercises_completed: u32,
    pub percent: f64,
}

/// Per (student, cohort) academic standing.
///
/// `average_grade`, `attendance_rate` and `overall_progress` are caches over
/// `grades`, the attendance ledger and course data; see [`crate::progress`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub cohort_id: Uuid,
    pub current_semester: u8,
    pub target_semester: Option<u8>,
    pub grades: BTreeMap<Uuid, f64>,
    pub average_grade: f64,
    pub attendance_rate: f64,
    pub overall_progress: f64,
    pub courses_completed: BTreeSet<Uuid>,
    pub courses_in_progress: BTreeMap<Uuid, CourseProgress>,
    pub validation_status: ValidationStatus,
    pub next_validation_date: Option<DateTime<Utc>>,
    pub validation_criteria: ValidationCriteria,
    pub validation_history: Vec<ValidationHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    pub fn new(student_id: Uuid, cohort: &SemesterCohort, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            cohort_id: cohort.id,
            current_semester: cohort.semester,
            target_semester: None,
            grades: BTreeMap::new(),
            average_grade: 0.0,
            attendance_rate: 100.0,
            overall_progress: 0.0,
            courses_completed: BTreeSet::new(),
            courses_in_progress: BTreeMap::new(),
            validation_status: ValidationStatus::NotStarted,
            next_validation_date: None,
            validation_criteria: cohort.criteria.clone(),
            validation_history: Vec::new(),
            created_at: now,
            updated_at: now,
            superseded_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.superseded_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub event_id: Uuid,
    pub student_id: Uuid,
    pub cohort_id: Uuid,
    pub attended: bool,
    pub marked_by: Uuid,
    pub marked_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// One line of a bulk attendance submission.
#[derive(Debug, Clone, Deserialize)]
pub struct AttendanceMark {
    pub student_id: Uuid,
    pub attended: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentReason {
    Initial,
    Added,
    Progression,
}

impl EnrollmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Added => "added",
            Self::Progression => "progression",
        }
    }
}

impl FromStr for EnrollmentReason {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "initial" => Ok(Self::Initial),
            "added" => Ok(Self::Added),
            "progression" => Ok(Self::Progression),
            other => Err(Error::InvalidInput(format!("unknown enrollment reason '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentHistoryEntry {
    pub id: Uuid,
    pub student_id: Uuid,
    pub cohort_id: Uuid,
    pub semester: u8,
    pub reason: EnrollmentReason,
    pub enrolled_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

impl EnrollmentHistoryEntry {
    pub fn open(
        student_id: Uuid,
        cohort: &SemesterCohort,
        reason: EnrollmentReason,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            student_id,
            cohort_id: cohort.id,
            semester: cohort.semester,
            reason,
            enrolled_at: at,
            left_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Student,
    Instructor,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub cohort_id: Option<Uuid>,
    pub starts_at: DateTime<Utc>,
    pub participants: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub total_chapters: u32,
    pub total_exercises: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRole {
    Admin,
    Staff,
    System,
}

/// An already-authorized caller. The engine only records `caller_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerContext {
    pub caller_id: Uuid,
    pub role: CallerRole,
}

impl CallerContext {
    pub fn new(caller_id: Uuid, role: CallerRole) -> Self {
        Self { caller_id, role }
    }

    pub fn system(caller_id: Uuid) -> Self {
        Self {
            caller_id,
            role: CallerRole::System,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_alternates_with_semester_parity() {
        assert_eq!(IntakeSeason::for_semester(1), IntakeSeason::Autumn);
        assert_eq!(IntakeSeason::for_semester(2), IntakeSeason::Spring);
        assert_eq!(IntakeSeason::for_semester(9), IntakeSeason::Autumn);
        assert_eq!(IntakeSeason::for_semester(10), IntakeSeason::Spring);
    }

    #[test]
    fn not_started_must_pass_through_review() {
        use ValidationStatus::*;
        assert!(!NotStarted.can_transition_to(Validated));
        assert!(!NotStarted.can_transition_to(Conditional));
        assert!(NotStarted.can_transition_to(PendingValidation));
        assert!(PendingValidation.can_transition_to(Validated));
        assert!(Failed.can_transition_to(PendingValidation));
        assert!(!Failed.can_transition_to(Validated));
        assert!(!Failed.can_transition_to(Conditional));
        assert!(!Validated.can_transition_to(PendingValidation));
        assert!(Conditional.can_transition_to(Failed));
    }

    #[test]
    fn status_round_trips_through_its_label() {
        for status in ValidationStatus::ALL {
            assert_eq!(status.as_str().parse::<ValidationStatus>().unwrap(), status);
        }
    }
}
