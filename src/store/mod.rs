//! Persistence seams for the progression engine.
//!
//! [`Store`] owns cohorts, rosters, progress records, attendance and
//! enrollment history. [`Directory`] is the read-mostly view onto the
//! collaborating user, event and course services.
//!
//! In-memory implementations back tests and dry runs; the Postgres ones back
//! the CLI.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    AttendanceRecord, Course, EnrollmentHistoryEntry, Event, ProgressRecord, SemesterCohort,
    Student, ValidationHistoryEntry, ValidationStatus,
};

pub use memory::{InMemoryDirectory, InMemoryStore};
pub use postgres::{PgDirectory, PgStore};

/// Selects progress records.
#[derive(Debug, Clone, Default)]
pub struct ProgressFilter {
    pub cohort_ids: Option<Vec<Uuid>>,
    pub statuses: Option<Vec<ValidationStatus>>,
    pub include_superseded: bool,
}

impl ProgressFilter {
    pub fn active() -> Self {
        Self::default()
    }

    pub fn with_status(status: ValidationStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Self::default()
        }
    }

    pub fn in_cohorts(mut self, cohort_ids: Vec<Uuid>) -> Self {
        self.cohort_ids = Some(cohort_ids);
        self
    }

    pub fn matches(&self, record: &ProgressRecord) -> bool {
        if !self.include_superseded && !record.is_active() {
            return false;
        }
        if let Some(ids) = &self.cohort_ids {
            if !ids.contains(&record.cohort_id) {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&record.validation_status) {
                return false;
            }
        }
        true
    }
}

/// Everything that changes when a student moves to the next cohort.
#[derive(Debug, Clone)]
pub struct Migration {
    pub student_id: Uuid,
    pub source_cohort_id: Uuid,
    pub destination_cohort_id: Uuid,
    pub superseded_record_id: Uuid,
    pub new_record: ProgressRecord,
    pub enrollment: EnrollmentHistoryEntry,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- Cohorts ---

    async fn insert_cohort(&self, cohort: &SemesterCohort) -> Result<()>;

    /// Replaces cohort metadata. The roster is left untouched; use the
    /// roster operations to change it.
    async fn update_cohort(&self, cohort: &SemesterCohort) -> Result<()>;

    async fn get_cohort(&self, id: Uuid) -> Result<Option<SemesterCohort>>;

    async fn find_cohort(&self, semester: u8, academic_year: &str)
        -> Result<Option<SemesterCohort>>;

    async fn list_cohorts(&self, academic_year: Option<&str>) -> Result<Vec<SemesterCohort>>;

    async fn delete_cohort(&self, id: Uuid) -> Result<bool>;

    /// Non-archived cohorts whose roster contains `student_id`.
    async fn cohorts_for_student(&self, student_id: Uuid) -> Result<Vec<SemesterCohort>>;

    // --- Rosters ---

    /// Returns false when the student was already on the roster.
    async fn add_to_roster(&self, cohort_id: Uuid, student_id: Uuid) -> Result<bool>;

    /// Returns false when the student was not on the roster.
    async fn remove_from_roster(&self, cohort_id: Uuid, student_id: Uuid) -> Result<bool>;

    // --- Progress records ---

    async fn insert_progress(&self, record: &ProgressRecord) -> Result<()>;

    /// Persists grades, course data, criteria and the derived caches.
    ///
    /// Status, target semester, history and supersession are left alone:
    /// they only change through [`Store::apply_validation`],
    /// [`Store::mark_pending`] and [`Store::supersede_progress`].
    async fn save_progress(&self, record: &ProgressRecord) -> Result<()>;

    async fn get_progress(&self, id: Uuid) -> Result<Option<ProgressRecord>>;

    /// The active record of a student in a cohort.
    async fn find_progress(&self, student_id: Uuid, cohort_id: Uuid)
        -> Result<Option<ProgressRecord>>;

    /// The student's active record with the highest semester.
    async fn current_progress(&self, student_id: Uuid) -> Result<Option<ProgressRecord>>;

    async fn list_progress(&self, filter: &ProgressFilter) -> Result<Vec<ProgressRecord>>;

    /// Appends `entry` to the history and sets status and target in one step.
    async fn apply_validation(
        &self,
        record_id: Uuid,
        entry: &ValidationHistoryEntry,
        status: ValidationStatus,
        target_semester: Option<u8>,
    ) -> Result<ProgressRecord>;

    /// Moves a record into `pending_validation` with a review deadline.
    async fn mark_pending(
        &self,
        record_id: Uuid,
        next_validation_date: DateTime<Utc>,
    ) -> Result<ProgressRecord>;

    async fn supersede_progress(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    // --- Attendance ---

    async fn upsert_attendance(&self, record: &AttendanceRecord) -> Result<()>;

    async fn attendance_for(&self, student_id: Uuid, cohort_id: Uuid)
        -> Result<Vec<AttendanceRecord>>;

    // --- Enrollment history ---

    async fn open_enrollment(&self, entry: &EnrollmentHistoryEntry) -> Result<()>;

    /// Stamps `left_at` on the student's open entry for `cohort_id`.
    async fn close_enrollment(&self, student_id: Uuid, cohort_id: Uuid, at: DateTime<Utc>)
        -> Result<bool>;

    async fn enrollment_history(&self, student_id: Uuid) -> Result<Vec<EnrollmentHistoryEntry>>;

    async fn cohort_enrollments(&self, cohort_id: Uuid) -> Result<Vec<EnrollmentHistoryEntry>>;

    /// Puts `entry.student_id` on the roster of `entry.cohort_id` together
    /// with its enrollment entry. Returns false, writing nothing, when the
    /// student is already on the roster.
    ///
    /// This default undoes the roster add when the history write fails and
    /// reports `MigrationInconsistency` when that removal fails too.
    async fn enroll_student(&self, entry: &EnrollmentHistoryEntry) -> Result<bool> {
        let student_id = entry.student_id;
        let cohort_id = entry.cohort_id;

        if !self.add_to_roster(cohort_id, student_id).await? {
            return Ok(false);
        }
        if let Err(history_err) = self.open_enrollment(entry).await {
            warn!(%student_id, %cohort_id, error = %history_err, "enrollment entry failed, removing from roster");
            return match retry_once(|| self.remove_from_roster(cohort_id, student_id)).await {
                Ok(_) => Err(history_err),
                Err(remove_err) => Err(Error::MigrationInconsistency {
                    student_id,
                    detail: format!(
                        "on roster of {cohort_id} without an enrollment entry: history write \
                         failed ({history_err}), removal failed ({remove_err})"
                    ),
                }),
            };
        }
        Ok(true)
    }

    /// Moves a student between cohorts as one logical unit.
    ///
    /// This default is for stores without multi-record transactions: the
    /// roster move is done remove-first so the student is never on two
    /// rosters, a failed add is compensated by re-adding to the source, and
    /// an unrecoverable state is reported as `MigrationInconsistency`.
    async fn migrate_student(&self, migration: &Migration) -> Result<()> {
        let student_id = migration.student_id;
        let source = migration.source_cohort_id;
        let destination = migration.destination_cohort_id;

        retry_once(|| self.remove_from_roster(source, student_id)).await?;

        if let Err(add_err) = retry_once(|| self.add_to_roster(destination, student_id)).await {
            warn!(%student_id, %destination, error = %add_err, "roster add failed, restoring source");
            return match retry_once(|| self.add_to_roster(source, student_id)).await {
                Ok(_) => Err(add_err),
                Err(restore_err) => Err(Error::MigrationInconsistency {
                    student_id,
                    detail: format!(
                        "removed from {source}, add to {destination} failed ({add_err}), \
                         restore failed ({restore_err}); student is on no roster"
                    ),
                }),
            };
        }

        let records = async {
            self.supersede_progress(migration.superseded_record_id, migration.at)
                .await?;
            self.insert_progress(&migration.new_record).await?;
            self.close_enrollment(student_id, source, migration.at).await?;
            self.open_enrollment(&migration.enrollment).await
        };
        records.await.map_err(|e| Error::MigrationInconsistency {
            student_id,
            detail: format!("roster moved to {destination} but records were not updated: {e}"),
        })
    }
}

async fn retry_once<T, F, Fut>(op: F) -> Result<T>
where
    F: Fn() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T>> + Send,
    T: Send,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(error = %first, "store operation failed, retrying once");
            op().await
        }
    }
}

/// Collaborating user, event and course services.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_student(&self, id: Uuid) -> Result<Option<Student>>;

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>>;

    async fn set_event_cohort(&self, event_id: Uuid, cohort_id: Option<Uuid>) -> Result<()>;

    async fn add_event_participants(&self, event_id: Uuid, student_ids: &[Uuid]) -> Result<()>;

    async fn get_course(&self, id: Uuid) -> Result<Option<Course>>;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::NaiveDate;

    use super::*;
    use crate::criteria::ValidationCriteria;
    use crate::models::{CohortStatus, EnrollmentReason, IntakeSeason};

    fn cohort(semester: u8) -> SemesterCohort {
        let now = Utc::now();
        SemesterCohort {
            id: Uuid::new_v4(),
            semester,
            intake: IntakeSeason::for_semester(semester),
            academic_year: "2026-2027".into(),
            name: format!("S{semester}"),
            starts_on: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            ends_on: NaiveDate::from_ymd_opt(2027, 1, 31).unwrap(),
            status: CohortStatus::Active,
            roster: Default::default(),
            event_ids: Default::default(),
            criteria: ValidationCriteria::default(),
            capacity: 10,
            created_at: now,
            updated_at: now,
        }
    }

    async fn staged_migration(store: &InMemoryStore) -> (Migration, SemesterCohort, SemesterCohort) {
        let (s1, s2) = (cohort(1), cohort(2));
        store.insert_cohort(&s1).await.unwrap();
        store.insert_cohort(&s2).await.unwrap();
        let student_id = Uuid::new_v4();
        store.add_to_roster(s1.id, student_id).await.unwrap();
        let old = ProgressRecord::new(student_id, &s1, Utc::now());
        store.insert_progress(&old).await.unwrap();
        let migration = Migration {
            student_id,
            source_cohort_id: s1.id,
            destination_cohort_id: s2.id,
            superseded_record_id: old.id,
            new_record: ProgressRecord::new(student_id, &s2, Utc::now()),
            enrollment: EnrollmentHistoryEntry::open(
                student_id,
                &s2,
                EnrollmentReason::Progression,
                Utc::now(),
            ),
            at: Utc::now(),
        };
        (migration, s1, s2)
    }

    #[tokio::test]
    async fn default_migration_moves_roster_and_records() {
        let store = Arc::new(InMemoryStore::new());
        let (migration, s1, s2) = staged_migration(&store).await;

        store.migrate_student(&migration).await.unwrap();

        let s1 = store.get_cohort(s1.id).await.unwrap().unwrap();
        let s2 = store.get_cohort(s2.id).await.unwrap().unwrap();
        assert!(!s1.roster.contains(&migration.student_id));
        assert!(s2.roster.contains(&migration.student_id));
        let current = store.current_progress(migration.student_id).await.unwrap().unwrap();
        assert_eq!(current.current_semester, 2);
        let old = store
            .get_progress(migration.superseded_record_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!old.is_active());
    }

    #[tokio::test]
    async fn failed_destination_add_restores_source_roster() {
        let store = InMemoryStore::new();
        let (migration, s1, s2) = staged_migration(&store).await;
        store.fail_roster_writes(s2.id);

        let err = store.migrate_student(&migration).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        let s1 = store.get_cohort(s1.id).await.unwrap().unwrap();
        assert!(s1.roster.contains(&migration.student_id));
    }

    #[tokio::test]
    async fn failed_history_write_undoes_enrollment() {
        let store = InMemoryStore::new();
        let s1 = cohort(1);
        store.insert_cohort(&s1).await.unwrap();
        let student_id = Uuid::new_v4();
        let entry = EnrollmentHistoryEntry::open(student_id, &s1, EnrollmentReason::Added, Utc::now());
        store.fail_enrollment_writes();

        let err = store.enroll_student(&entry).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        let s1 = store.get_cohort(s1.id).await.unwrap().unwrap();
        assert!(!s1.roster.contains(&student_id));
        assert!(store.enrollment_history(student_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_enrollment_reports_inconsistency() {
        let store = InMemoryStore::new();
        let s1 = cohort(1);
        store.insert_cohort(&s1).await.unwrap();
        let entry = EnrollmentHistoryEntry::open(Uuid::new_v4(), &s1, EnrollmentReason::Added, Utc::now());
        store.fail_enrollment_writes();
        store.fail_roster_removes(s1.id);

        let err = store.enroll_student(&entry).await.unwrap_err();
        assert!(matches!(err, Error::MigrationInconsistency { .. }));
    }

    #[tokio::test]
    async fn enrolling_twice_writes_one_entry() {
        let store = InMemoryStore::new();
        let s1 = cohort(1);
        store.insert_cohort(&s1).await.unwrap();
        let student_id = Uuid::new_v4();
        let entry = EnrollmentHistoryEntry::open(student_id, &s1, EnrollmentReason::Initial, Utc::now());

        assert!(store.enroll_student(&entry).await.unwrap());
        assert!(!store.enroll_student(&entry).await.unwrap());
        assert_eq!(store.enrollment_history(student_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unrecoverable_move_reports_inconsistency() {
        let store = InMemoryStore::new();
        let (migration, s1, s2) = staged_migration(&store).await;
        store.fail_roster_adds(s1.id);
        store.fail_roster_writes(s2.id);

        let err = store.migrate_student(&migration).await.unwrap_err();
        assert!(matches!(err, Error::MigrationInconsistency { .. }));
    }
}
