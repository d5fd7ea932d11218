//! Semester management: the sweeps that move students through S1-S10.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{parse_academic_year, Settings};
use crate::error::{BatchFailure, Error, Result};
use crate::models::{
    CohortStatus, EnrollmentHistoryEntry, EnrollmentReason, ProgressRecord, SemesterCohort,
    ValidationStatus, FINAL_SEMESTER, FIRST_SEMESTER,
};
use crate::progress::ProgressTracker;
use crate::store::{Directory, Migration, ProgressFilter, Store};

#[derive(Debug, Default)]
pub struct FlagReport {
    pub flagged: usize,
    /// Students whose record is already under review or decided.
    pub skipped: usize,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Progression {
    pub student_id: Uuid,
    pub from_semester: u8,
    pub to_semester: u8,
    pub source_cohort_id: Uuid,
    pub destination_cohort_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedProgression {
    pub student_id: Uuid,
    pub current_semester: u8,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ProgressionReport {
    pub progressed: Vec<Progression>,
    pub skipped: Vec<SkippedProgression>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug)]
pub struct AssignmentReport {
    pub cohort_id: Uuid,
    pub assigned: Vec<Uuid>,
    pub already_enrolled: Vec<Uuid>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub academic_year: String,
    pub missing_semesters: Vec<u8>,
    pub total_enrolled: usize,
    pub pending_validation: usize,
    pub ready_to_progress: usize,
    pub healthy: bool,
}

/// Why a validated record is not eligible for the progression sweep.
fn progression_block(record: &ProgressRecord) -> Option<String> {
    let current = record.current_semester;
    match record.target_semester {
        _ if current >= FINAL_SEMESTER => Some(format!("semester {current} is the final semester")),
        None => Some("no target semester".into()),
        Some(target) if target > FINAL_SEMESTER => {
            Some(format!("target semester {target} is beyond S{FINAL_SEMESTER}"))
        }
        Some(target) if target != current + 1 => {
            Some(format!("target semester {target} does not follow S{current}"))
        }
        Some(_) => None,
    }
}

#[derive(Clone)]
pub struct SemesterService {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    settings: Arc<Settings>,
    tracker: ProgressTracker,
}

impl SemesterService {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>, settings: Arc<Settings>) -> Self {
        let tracker = ProgressTracker::new(store.clone(), directory.clone());
        Self {
            store,
            directory,
            settings,
            tracker,
        }
    }

    async fn target_cohorts(&self, cohort_ids: Option<&[Uuid]>) -> Result<Vec<SemesterCohort>> {
        match cohort_ids {
            Some(ids) => {
                let mut cohorts = Vec::with_capacity(ids.len());
                for id in ids {
                    let cohort = self
                        .store
                        .get_cohort(*id)
                        .await?
                        .ok_or_else(|| Error::not_found("cohort", id))?;
                    cohorts.push(cohort);
                }
                Ok(cohorts)
            }
            None => Ok(self
                .store
                .list_cohorts(None)
                .await?
                .into_iter()
                .filter(|c| !c.is_archived())
                .collect()),
        }
    }

    /// Puts every roster student of the targeted cohorts (all non-archived
    /// cohorts when `None`) up for review. Records that were never reviewed
    /// or that failed are moved to `pending_validation` with a deadline
    /// `validation_window_days` out; missing records are created first.
    #[instrument(skip(self, cohort_ids))]
    pub async fn flag_students_for_validation(&self, cohort_ids: Option<&[Uuid]>) -> Result<FlagReport> {
        let cohorts = self.target_cohorts(cohort_ids).await?;
        let deadline = Utc::now() + Duration::days(self.settings.validation_window_days);
        let mut report = FlagReport::default();

        for cohort in &cohorts {
            for student_id in &cohort.roster {
                match self.flag_one(*student_id, cohort.id, deadline).await {
                    Ok(true) => report.flagged += 1,
                    Ok(false) => report.skipped += 1,
                    Err(error) => {
                        warn!(%student_id, cohort_id = %cohort.id, %error, "flagging failed");
                        report.failed.push(BatchFailure::new(*student_id, error));
                    }
                }
            }
        }

        info!(
            cohorts = cohorts.len(),
            flagged = report.flagged,
            skipped = report.skipped,
            failed = report.failed.len(),
            "students flagged for validation"
        );
        Ok(report)
    }

    async fn flag_one(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let record = self.tracker.ensure_record(student_id, cohort_id).await?;
        match record.validation_status {
            ValidationStatus::NotStarted | ValidationStatus::Failed => {
                self.store.mark_pending(record.id, deadline).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Moves every validated student with a target semester into the cohort
    /// for that semester. The final semester is terminal: those records are
    /// reported as skipped and no cohort past S10 is ever looked up.
    #[instrument(skip(self))]
    pub async fn progress_validated_students(&self) -> Result<ProgressionReport> {
        let records = self
            .store
            .list_progress(&ProgressFilter::with_status(ValidationStatus::Validated))
            .await?;
        let mut report = ProgressionReport::default();

        for record in records {
            if let Some(reason) = progression_block(&record) {
                report.skipped.push(SkippedProgression {
                    student_id: record.student_id,
                    current_semester: record.current_semester,
                    reason,
                });
                continue;
            }
            match self.progress_one(&record).await {
                Ok(progression) => report.progressed.push(progression),
                Err(error) => {
                    warn!(student_id = %record.student_id, %error, "progression failed");
                    report.failed.push(BatchFailure::new(record.student_id, error));
                }
            }
        }

        info!(
            progressed = report.progressed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "progression sweep finished"
        );
        Ok(report)
    }

    async fn progress_one(&self, record: &ProgressRecord) -> Result<Progression> {
        let target = record
            .target_semester
            .ok_or_else(|| Error::InvalidInput("record has no target semester".into()))?;
        let source = self
            .store
            .get_cohort(record.cohort_id)
            .await?
            .ok_or_else(|| Error::not_found("cohort", record.cohort_id))?;
        if !source.roster.contains(&record.student_id) {
            return Err(Error::not_found(
                "roster entry",
                format!("{} in cohort {}", record.student_id, source.id),
            ));
        }
        let destination = self.destination_cohort(target, &source.academic_year).await?;

        let now = Utc::now();
        let migration = Migration {
            student_id: record.student_id,
            source_cohort_id: source.id,
            destination_cohort_id: destination.id,
            superseded_record_id: record.id,
            new_record: ProgressRecord::new(record.student_id, &destination, now),
            enrollment: EnrollmentHistoryEntry::open(
                record.student_id,
                &destination,
                EnrollmentReason::Progression,
                now,
            ),
            at: now,
        };
        self.store.migrate_student(&migration).await?;

        info!(
            student_id = %record.student_id,
            from = record.current_semester,
            to = target,
            "student progressed"
        );
        Ok(Progression {
            student_id: record.student_id,
            from_semester: record.current_semester,
            to_semester: target,
            source_cohort_id: source.id,
            destination_cohort_id: destination.id,
        })
    }

    /// The active cohort for `semester`, preferring the source's academic year.
    async fn destination_cohort(&self, semester: u8, academic_year: &str) -> Result<SemesterCohort> {
        if let Some(cohort) = self.store.find_cohort(semester, academic_year).await? {
            if cohort.status == CohortStatus::Active {
                return Ok(cohort);
            }
        }
        self.store
            .list_cohorts(None)
            .await?
            .into_iter()
            .filter(|c| c.semester == semester && c.status == CohortStatus::Active)
            .max_by(|a, b| a.academic_year.cmp(&b.academic_year))
            .ok_or_else(|| Error::not_found("cohort", format!("S{semester} {academic_year}")))
    }

    /// Enrolls new students in the S1 cohort of `academic_year`.
    ///
    /// A missing S1 cohort fails the whole call; anything wrong with a single
    /// student is reported in `failed` and the rest are still assigned.
    #[instrument(skip(self, student_ids), fields(count = student_ids.len()))]
    pub async fn assign_new_students_to_s1(
        &self,
        student_ids: &[Uuid],
        academic_year: &str,
    ) -> Result<AssignmentReport> {
        parse_academic_year(academic_year)?;
        let cohort = self
            .store
            .find_cohort(FIRST_SEMESTER, academic_year)
            .await?
            .filter(|c| !c.is_archived())
            .ok_or_else(|| Error::not_found("cohort", format!("S1 {academic_year}")))?;

        let mut report = AssignmentReport {
            cohort_id: cohort.id,
            assigned: Vec::new(),
            already_enrolled: Vec::new(),
            failed: Vec::new(),
        };
        for student_id in student_ids {
            match self.assign_one(*student_id, &cohort).await {
                Ok(true) => report.assigned.push(*student_id),
                Ok(false) => report.already_enrolled.push(*student_id),
                Err(error) => {
                    warn!(%student_id, %error, "S1 assignment failed");
                    report.failed.push(BatchFailure::new(*student_id, error));
                }
            }
        }

        if !report.assigned.is_empty() {
            for event_id in &cohort.event_ids {
                self.directory
                    .add_event_participants(*event_id, &report.assigned)
                    .await?;
            }
        }
        let roster_size = cohort.roster.len() + report.assigned.len();
        if roster_size > cohort.capacity as usize {
            warn!(cohort_id = %cohort.id, roster_size, capacity = cohort.capacity, "S1 cohort over capacity");
        }
        info!(
            cohort_id = %cohort.id,
            assigned = report.assigned.len(),
            failed = report.failed.len(),
            "new students assigned to S1"
        );
        Ok(report)
    }

    async fn assign_one(&self, student_id: Uuid, cohort: &SemesterCohort) -> Result<bool> {
        if self.directory.get_student(student_id).await?.is_none() {
            return Err(Error::not_found("student", student_id));
        }
        let elsewhere = self
            .store
            .cohorts_for_student(student_id)
            .await?
            .into_iter()
            .any(|c| c.id != cohort.id);
        if elsewhere {
            return Err(Error::ConflictingEnrollment {
                cohort_id: cohort.id,
                students: vec![student_id],
            });
        }

        let entry = EnrollmentHistoryEntry::open(student_id, cohort, EnrollmentReason::Initial, Utc::now());
        let added = self.store.enroll_student(&entry).await?;
        self.tracker.ensure_record(student_id, cohort.id).await?;
        Ok(added)
    }

    /// Checks the catalog of the current academic year.
    pub async fn perform_health_check(&self) -> Result<HealthReport> {
        let academic_year = self.settings.academic_year_for(Utc::now().date_naive());
        let cohorts: Vec<SemesterCohort> = self
            .store
            .list_cohorts(Some(&academic_year))
            .await?
            .into_iter()
            .filter(|c| !c.is_archived())
            .collect();

        let missing_semesters: Vec<u8> = (FIRST_SEMESTER..=FINAL_SEMESTER)
            .filter(|semester| !cohorts.iter().any(|c| c.semester == *semester))
            .collect();
        let total_enrolled = cohorts.iter().map(|c| c.roster.len()).sum();

        let cohort_ids: Vec<Uuid> = cohorts.iter().map(|c| c.id).collect();
        let records = self
            .store
            .list_progress(&ProgressFilter::active().in_cohorts(cohort_ids))
            .await?;
        let pending_validation = records
            .iter()
            .filter(|r| r.validation_status == ValidationStatus::PendingValidation)
            .count();
        let ready_to_progress = records
            .iter()
            .filter(|r| {
                r.validation_status == ValidationStatus::Validated && progression_block(r).is_none()
            })
            .count();

        if !missing_semesters.is_empty() {
            warn!(%academic_year, missing = ?missing_semesters, "semester catalog incomplete");
        }
        Ok(HealthReport {
            healthy: missing_semesters.is_empty(),
            academic_year,
            missing_semesters,
            total_enrolled,
            pending_validation,
            ready_to_progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::models::{
        CallerContext, CallerRole, NewCohort, Student, UserRole, ValidationDecision,
        ValidationHistoryEntry,
    };
    use crate::registry::{canonical_dates, CohortRegistry};
    use crate::store::{InMemoryDirectory, InMemoryStore};
    use crate::validation::ValidationEngine;

    const YEAR: &str = "2026-2027";

    struct Fixture {
        service: SemesterService,
        registry: CohortRegistry,
        engine: ValidationEngine,
        store: Arc<InMemoryStore>,
        directory: Arc<InMemoryDirectory>,
        caller: CallerContext,
    }

    fn fixture_with(settings: Settings) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let settings = Arc::new(settings);
        Fixture {
            service: SemesterService::new(store.clone(), directory.clone(), settings.clone()),
            registry: CohortRegistry::new(store.clone(), directory.clone(), settings.clone()),
            engine: ValidationEngine::new(store.clone(), settings),
            store,
            directory,
            caller: CallerContext::new(Uuid::new_v4(), CallerRole::Admin),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Settings {
            current_academic_year: Some(YEAR.into()),
            batch_pause_ms: 1,
            ..Settings::default()
        })
    }

    fn students(directory: &InMemoryDirectory, count: usize) -> Vec<Uuid> {
        (0..count)
            .map(|i| {
                let id = Uuid::new_v4();
                directory
                    .insert_student(Student {
                        id,
                        full_name: format!("Scholar {i}"),
                        email: format!("{id}@groupscholar.com"),
                        role: UserRole::Student,
                    })
                    .unwrap();
                id
            })
            .collect()
    }

    async fn approve(f: &Fixture, student_id: Uuid) {
        f.engine
            .apply_decision(&f.caller, student_id, ValidationDecision::Approve, None, None)
            .await
            .unwrap();
    }

    /// No student may sit on two non-archived rosters.
    async fn assert_single_enrollment(store: &InMemoryStore) {
        let mut seen: HashMap<Uuid, usize> = HashMap::new();
        for cohort in store.list_cohorts(None).await.unwrap() {
            if cohort.is_archived() {
                continue;
            }
            for student_id in cohort.roster {
                *seen.entry(student_id).or_insert(0) += 1;
            }
        }
        assert!(seen.values().all(|count| *count == 1), "{seen:?}");
    }

    #[tokio::test]
    async fn assignment_creates_records_and_initial_history() {
        let f = fixture();
        f.registry.initialize_semesters(YEAR).await.unwrap();
        let ids = students(&f.directory, 2);
        let unknown = Uuid::new_v4();

        let report = f
            .service
            .assign_new_students_to_s1(&[ids[0], ids[1], unknown], YEAR)
            .await
            .unwrap();
        assert_eq!(report.assigned, ids);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.is_not_found());

        let record = f.store.current_progress(ids[0]).await.unwrap().unwrap();
        assert_eq!(record.current_semester, 1);
        assert_eq!(record.validation_status, ValidationStatus::NotStarted);
        let history = f.store.enrollment_history(ids[0]).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, EnrollmentReason::Initial);

        let again = f.service.assign_new_students_to_s1(&ids, YEAR).await.unwrap();
        assert_eq!(again.already_enrolled, ids);
        assert_eq!(f.store.enrollment_history(ids[0]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn assignment_refuses_students_enrolled_elsewhere() {
        let f = fixture();
        f.registry.initialize_semesters(YEAR).await.unwrap();
        let ids = students(&f.directory, 1);
        let s3 = f.store.find_cohort(3, YEAR).await.unwrap().unwrap();
        f.registry.add_students(s3.id, &ids).await.unwrap();

        let report = f.service.assign_new_students_to_s1(&ids, YEAR).await.unwrap();
        assert!(report.assigned.is_empty());
        assert!(matches!(
            report.failed[0].error,
            Error::ConflictingEnrollment { .. }
        ));
        assert_single_enrollment(&f.store).await;
    }

    #[tokio::test]
    async fn assignment_without_history_leaves_roster_untouched() {
        let f = fixture();
        f.registry.initialize_semesters(YEAR).await.unwrap();
        let ids = students(&f.directory, 1);
        f.store.fail_enrollment_writes();

        let report = f.service.assign_new_students_to_s1(&ids, YEAR).await.unwrap();
        assert!(report.assigned.is_empty());
        assert_eq!(report.failed.len(), 1);
        let s1 = f.store.find_cohort(1, YEAR).await.unwrap().unwrap();
        assert!(s1.roster.is_empty());
        assert!(f.store.current_progress(ids[0]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn assignment_requires_an_s1_cohort() {
        let f = fixture();
        let ids = students(&f.directory, 1);
        let err = f
            .service
            .assign_new_students_to_s1(&ids, YEAR)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn flagging_queues_unreviewed_and_failed_records() {
        let f = fixture();
        f.registry.initialize_semesters(YEAR).await.unwrap();
        let ids = students(&f.directory, 3);
        f.service.assign_new_students_to_s1(&ids, YEAR).await.unwrap();

        let first = f.service.flag_students_for_validation(None).await.unwrap();
        assert_eq!(first.flagged, 3);
        let record = f.store.current_progress(ids[0]).await.unwrap().unwrap();
        assert_eq!(record.validation_status, ValidationStatus::PendingValidation);
        let days = (record.next_validation_date.unwrap() - Utc::now()).num_days();
        assert!((29..=30).contains(&days));

        f.engine
            .apply_decision(&f.caller, ids[0], ValidationDecision::Reject, None, None)
            .await
            .unwrap();
        approve(&f, ids[1]).await;

        let s1 = f.store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let second = f
            .service
            .flag_students_for_validation(Some(&[s1.id]))
            .await
            .unwrap();
        assert_eq!(second.flagged, 1);
        assert_eq!(second.skipped, 2);
        let retake = f.store.current_progress(ids[0]).await.unwrap().unwrap();
        assert_eq!(retake.validation_status, ValidationStatus::PendingValidation);
        assert_eq!(retake.validation_history.len(), 1);
    }

    #[tokio::test]
    async fn validated_students_move_to_the_next_cohort() {
        let f = fixture();
        f.registry.initialize_semesters(YEAR).await.unwrap();
        let ids = students(&f.directory, 2);
        f.service.assign_new_students_to_s1(&ids, YEAR).await.unwrap();
        f.service.flag_students_for_validation(None).await.unwrap();
        approve(&f, ids[0]).await;

        let health = f.service.perform_health_check().await.unwrap();
        assert_eq!(health.ready_to_progress, 1);
        assert_eq!(health.pending_validation, 1);

        let report = f.service.progress_validated_students().await.unwrap();
        assert_eq!(report.progressed.len(), 1);
        assert!(report.failed.is_empty());
        let moved = &report.progressed[0];
        assert_eq!((moved.from_semester, moved.to_semester), (1, 2));

        let s1 = f.store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let s2 = f.store.find_cohort(2, YEAR).await.unwrap().unwrap();
        assert!(!s1.roster.contains(&ids[0]));
        assert!(s2.roster.contains(&ids[0]));
        assert!(s1.roster.contains(&ids[1]));

        let current = f.store.current_progress(ids[0]).await.unwrap().unwrap();
        assert_eq!(current.cohort_id, s2.id);
        assert_eq!(current.validation_status, ValidationStatus::NotStarted);
        let history = f.store.enrollment_history(ids[0]).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|e| e.cohort_id == s1.id && e.left_at.is_some()));
        assert!(history
            .iter()
            .any(|e| e.cohort_id == s2.id && e.reason == EnrollmentReason::Progression));
        assert_single_enrollment(&f.store).await;

        let rerun = f.service.progress_validated_students().await.unwrap();
        assert!(rerun.progressed.is_empty());
    }

    #[tokio::test]
    async fn removed_students_do_not_progress_from_their_old_cohort() {
        let f = fixture();
        f.registry.initialize_semesters(YEAR).await.unwrap();
        let s2 = f.store.find_cohort(2, YEAR).await.unwrap().unwrap();
        let s3 = f.store.find_cohort(3, YEAR).await.unwrap().unwrap();
        let ids = students(&f.directory, 1);
        f.registry.add_students(s3.id, &ids).await.unwrap();
        f.service.flag_students_for_validation(Some(&[s3.id])).await.unwrap();
        approve(&f, ids[0]).await;

        f.registry.remove_student(s3.id, ids[0]).await.unwrap();
        f.registry.add_students(s2.id, &ids).await.unwrap();

        let report = f.service.progress_validated_students().await.unwrap();
        assert!(report.progressed.is_empty());
        assert!(report.failed.is_empty());
        assert_single_enrollment(&f.store).await;
        let s2 = f.store.get_cohort(s2.id).await.unwrap().unwrap();
        assert!(s2.roster.contains(&ids[0]));
        let s4 = f.store.find_cohort(4, YEAR).await.unwrap().unwrap();
        assert!(!s4.roster.contains(&ids[0]));
    }

    #[tokio::test]
    async fn progression_requires_the_student_on_the_source_roster() {
        let f = fixture();
        f.registry.initialize_semesters(YEAR).await.unwrap();
        let s1 = f.store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let ids = students(&f.directory, 1);
        f.service.assign_new_students_to_s1(&ids, YEAR).await.unwrap();
        f.service.flag_students_for_validation(None).await.unwrap();
        approve(&f, ids[0]).await;
        // Roster changed underneath the validated record.
        f.store.remove_from_roster(s1.id, ids[0]).await.unwrap();

        let report = f.service.progress_validated_students().await.unwrap();
        assert!(report.progressed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.is_not_found());
        let s2 = f.store.find_cohort(2, YEAR).await.unwrap().unwrap();
        assert!(s2.roster.is_empty());
    }

    #[tokio::test]
    async fn final_semester_is_terminal() {
        let f = fixture();
        f.registry.initialize_semesters(YEAR).await.unwrap();
        let s10 = f.store.find_cohort(10, YEAR).await.unwrap().unwrap();
        let ids = students(&f.directory, 2);
        f.registry.add_students(s10.id, &ids).await.unwrap();
        f.service.flag_students_for_validation(Some(&[s10.id])).await.unwrap();
        approve(&f, ids[0]).await;

        // A record carrying a target past the pipeline must never execute.
        let record = f.store.current_progress(ids[1]).await.unwrap().unwrap();
        let forged = ValidationHistoryEntry {
            validator_id: f.caller.caller_id,
            decision: ValidationDecision::Approve,
            reason: None,
            notes: None,
            decided_at: Utc::now(),
            target_semester: Some(11),
        };
        f.store
            .apply_validation(record.id, &forged, ValidationStatus::Validated, Some(11))
            .await
            .unwrap();

        let report = f.service.progress_validated_students().await.unwrap();
        assert!(report.progressed.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(f.store.list_cohorts(None).await.unwrap().len(), 10);
        let s10 = f.store.get_cohort(s10.id).await.unwrap().unwrap();
        assert_eq!(s10.roster.len(), 2);
    }

    #[tokio::test]
    async fn missing_destination_is_a_per_student_error() {
        let f = fixture();
        let (starts_on, ends_on) = canonical_dates(1, 2026).unwrap();
        f.registry
            .create_cohort(NewCohort {
                semester: 1,
                academic_year: YEAR.into(),
                name: None,
                starts_on,
                ends_on,
                status: CohortStatus::Active,
                criteria: Default::default(),
                capacity: 10,
            })
            .await
            .unwrap();
        let ids = students(&f.directory, 1);
        f.service.assign_new_students_to_s1(&ids, YEAR).await.unwrap();
        f.service.flag_students_for_validation(None).await.unwrap();
        approve(&f, ids[0]).await;

        let report = f.service.progress_validated_students().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].error.is_not_found());
        assert_eq!(f.store.list_cohorts(None).await.unwrap().len(), 1);
        let s1 = f.store.find_cohort(1, YEAR).await.unwrap().unwrap();
        assert!(s1.roster.contains(&ids[0]));
    }

    #[tokio::test]
    async fn health_check_lists_missing_semesters() {
        let f = fixture();
        let health = f.service.perform_health_check().await.unwrap();
        assert!(!health.healthy);
        assert_eq!(health.missing_semesters, (1..=10).collect::<Vec<u8>>());

        f.registry.initialize_semesters(YEAR).await.unwrap();
        let ids = students(&f.directory, 3);
        f.service.assign_new_students_to_s1(&ids, YEAR).await.unwrap();
        let health = f.service.perform_health_check().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.academic_year, YEAR);
        assert_eq!(health.total_enrolled, 3);
        assert_eq!(health.pending_validation, 0);
    }
}
