//! Semester cohort registry: the permanent S1-S10 catalog per academic year.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{parse_academic_year, Settings};
use crate::error::{BatchFailure, Error, Result};
use crate::models::{
    CohortStatus, CohortUpdate, EnrollmentHistoryEntry, EnrollmentReason, IntakeSeason, NewCohort,
    SemesterCohort, ValidationStatus, FINAL_SEMESTER, FIRST_SEMESTER,
};
use crate::store::{Directory, ProgressFilter, Store};

const RECENT_PROGRESSION_DAYS: i64 = 30;

#[derive(Debug)]
pub struct SemesterFailure {
    pub semester: u8,
    pub error: Error,
}

#[derive(Debug, Default)]
pub struct InitializationReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: Vec<SemesterFailure>,
}

impl InitializationReport {
    /// Cohorts that were already there before the sweep.
    pub fn existing(&self) -> usize {
        self.updated + self.unchanged
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SemesterSummary {
    pub cohort_id: Uuid,
    pub semester: u8,
    pub name: String,
    pub academic_year: String,
    pub status: CohortStatus,
    pub roster_size: usize,
    pub capacity: u32,
    pub utilization: f64,
    pub status_breakdown: BTreeMap<ValidationStatus, usize>,
    pub recent_progressions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatistics {
    pub academic_year: Option<String>,
    pub total_cohorts: usize,
    pub total_students: usize,
    pub average_utilization: f64,
    pub status_breakdown: BTreeMap<ValidationStatus, usize>,
    pub semesters: Vec<SemesterSummary>,
}

#[derive(Debug, Default)]
pub struct AddStudentsReport {
    pub added: Vec<Uuid>,
    pub already_enrolled: Vec<Uuid>,
    /// Students whose roster entry could not be written; none of them is left
    /// on the roster.
    pub failed: Vec<BatchFailure>,
}

/// Display name every initialized cohort carries.
pub fn canonical_name(semester: u8, academic_year: &str) -> String {
    let season = match IntakeSeason::for_semester(semester) {
        IntakeSeason::Autumn => "Autumn",
        IntakeSeason::Spring => "Spring",
    };
    format!("S{semester} {season} {academic_year}")
}

/// Autumn terms run September to January, spring terms February to June.
pub fn canonical_dates(semester: u8, start_year: i32) -> Result<(NaiveDate, NaiveDate)> {
    let dates = match IntakeSeason::for_semester(semester) {
        IntakeSeason::Autumn => (
            NaiveDate::from_ymd_opt(start_year, 9, 1),
            NaiveDate::from_ymd_opt(start_year + 1, 1, 31),
        ),
        IntakeSeason::Spring => (
            NaiveDate::from_ymd_opt(start_year + 1, 2, 1),
            NaiveDate::from_ymd_opt(start_year + 1, 6, 30),
        ),
    };
    match dates {
        (Some(starts), Some(ends)) => Ok((starts, ends)),
        _ => Err(Error::InvalidInput(format!("no calendar dates for year {start_year}"))),
    }
}

#[derive(Clone)]
pub struct CohortRegistry {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    settings: Arc<Settings>,
}

impl CohortRegistry {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>, settings: Arc<Settings>) -> Self {
        Self {
            store,
            directory,
            settings,
        }
    }

    /// Makes sure S1-S10 exist for `academic_year`. Existing cohorts get stale
    /// display metadata or invalid criteria refreshed; rosters are never
    /// touched. A failing semester does not stop the others.
    #[instrument(skip(self))]
    pub async fn initialize_semesters(&self, academic_year: &str) -> Result<InitializationReport> {
        let start_year = parse_academic_year(academic_year)?;
        let mut report = InitializationReport::default();

        for semester in FIRST_SEMESTER..=FINAL_SEMESTER {
            match self.initialize_semester(semester, academic_year, start_year).await {
                Ok(InitOutcome::Created) => report.created += 1,
                Ok(InitOutcome::Updated) => report.updated += 1,
                Ok(InitOutcome::Unchanged) => report.unchanged += 1,
                Err(error) => {
                    warn!(semester, %error, "semester initialization failed");
                    report.failed.push(SemesterFailure { semester, error });
                }
            }
        }

        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "semesters initialized"
        );
        Ok(report)
    }

    async fn initialize_semester(
        &self,
        semester: u8,
        academic_year: &str,
        start_year: i32,
    ) -> Result<InitOutcome> {
        let name = canonical_name(semester, academic_year);
        let intake = IntakeSeason::for_semester(semester);

        match self.store.find_cohort(semester, academic_year).await? {
            None => {
                let (starts_on, ends_on) = canonical_dates(semester, start_year)?;
                self.create_cohort(NewCohort {
                    semester,
                    academic_year: academic_year.to_string(),
                    name: Some(name),
                    starts_on,
                    ends_on,
                    status: CohortStatus::Active,
                    criteria: self.settings.default_criteria.clone(),
                    capacity: self.settings.cohort_capacity,
                })
                .await?;
                Ok(InitOutcome::Created)
            }
            Some(mut cohort) => {
                let criteria_invalid = cohort.criteria.validate().is_err();
                if cohort.name == name && cohort.intake == intake && !criteria_invalid {
                    return Ok(InitOutcome::Unchanged);
                }
                cohort.name = name;
                cohort.intake = intake;
                if criteria_invalid {
                    cohort.criteria = self.settings.default_criteria.clone();
                }
                cohort.updated_at = Utc::now();
                self.store.update_cohort(&cohort).await?;
                Ok(InitOutcome::Updated)
            }
        }
    }

    /// Creates a cohort, keeping at most one active cohort per
    /// (semester, academic year).
    pub async fn create_cohort(&self, new: NewCohort) -> Result<SemesterCohort> {
        if !crate::models::is_valid_semester(new.semester) {
            return Err(Error::InvalidInput(format!("semester {} is not 1-10", new.semester)));
        }
        parse_academic_year(&new.academic_year)?;
        new.criteria.validate()?;
        if new.ends_on < new.starts_on {
            return Err(Error::InvalidInput("cohort ends before it starts".into()));
        }
        if new.status == CohortStatus::Active {
            self.ensure_no_other_active(new.semester, &new.academic_year, None)
                .await?;
        }

        let now = Utc::now();
        let cohort = SemesterCohort {
            id: Uuid::new_v4(),
            semester: new.semester,
            intake: IntakeSeason::for_semester(new.semester),
            name: new
                .name
                .unwrap_or_else(|| canonical_name(new.semester, &new.academic_year)),
            academic_year: new.academic_year,
            starts_on: new.starts_on,
            ends_on: new.ends_on,
            status: new.status,
            roster: Default::default(),
            event_ids: Default::default(),
            criteria: new.criteria,
            capacity: new.capacity,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_cohort(&cohort).await?;
        info!(cohort_id = %cohort.id, semester = cohort.semester, "cohort created");
        Ok(cohort)
    }

    pub async fn get_cohort(&self, cohort_id: Uuid) -> Result<SemesterCohort> {
        self.store
            .get_cohort(cohort_id)
            .await?
            .ok_or_else(|| Error::not_found("cohort", cohort_id))
    }

    pub async fn update_cohort(&self, cohort_id: Uuid, update: CohortUpdate) -> Result<SemesterCohort> {
        let mut cohort = self.get_cohort(cohort_id).await?;
        if let Some(criteria) = update.criteria {
            criteria.validate()?;
            cohort.criteria = criteria;
        }
        if let Some(status) = update.status {
            if status == CohortStatus::Active && cohort.status != CohortStatus::Active {
                self.ensure_no_other_active(cohort.semester, &cohort.academic_year, Some(cohort.id))
                    .await?;
            }
            cohort.status = status;
        }
        if let Some(name) = update.name {
            cohort.name = name;
        }
        if let Some(starts_on) = update.starts_on {
            cohort.starts_on = starts_on;
        }
        if let Some(ends_on) = update.ends_on {
            cohort.ends_on = ends_on;
        }
        if cohort.ends_on < cohort.starts_on {
            return Err(Error::InvalidInput("cohort ends before it starts".into()));
        }
        if let Some(capacity) = update.capacity {
            cohort.capacity = capacity;
        }
        cohort.updated_at = Utc::now();
        self.store.update_cohort(&cohort).await?;
        Ok(cohort)
    }

    /// Deletes an empty cohort. Cohorts with enrolled students are permanent.
    pub async fn delete_cohort(&self, cohort_id: Uuid) -> Result<()> {
        let cohort = self.get_cohort(cohort_id).await?;
        if !cohort.roster.is_empty() {
            return Err(Error::CohortNotEmpty(cohort_id));
        }
        self.store.delete_cohort(cohort_id).await?;
        info!(%cohort_id, "cohort deleted");
        Ok(())
    }

    async fn ensure_no_other_active(
        &self,
        semester: u8,
        academic_year: &str,
        except: Option<Uuid>,
    ) -> Result<()> {
        let clash = self
            .store
            .list_cohorts(Some(academic_year))
            .await?
            .into_iter()
            .any(|c| {
                c.semester == semester
                    && c.status == CohortStatus::Active
                    && Some(c.id) != except
            });
        if clash {
            return Err(Error::DuplicateActiveCohort {
                semester,
                academic_year: academic_year.to_string(),
            });
        }
        Ok(())
    }

    /// Links an event to the cohort; the current roster joins the event.
    pub async fn link_event(&self, cohort_id: Uuid, event_id: Uuid) -> Result<SemesterCohort> {
        let mut cohort = self.get_cohort(cohort_id).await?;
        if self.directory.get_event(event_id).await?.is_none() {
            return Err(Error::not_found("event", event_id));
        }
        cohort.event_ids.insert(event_id);
        cohort.updated_at = Utc::now();
        self.store.update_cohort(&cohort).await?;
        self.directory.set_event_cohort(event_id, Some(cohort_id)).await?;
        let roster: Vec<Uuid> = cohort.roster.iter().copied().collect();
        self.directory.add_event_participants(event_id, &roster).await?;
        Ok(cohort)
    }

    pub async fn unlink_event(&self, cohort_id: Uuid, event_id: Uuid) -> Result<SemesterCohort> {
        let mut cohort = self.get_cohort(cohort_id).await?;
        if !cohort.event_ids.remove(&event_id) {
            return Err(Error::not_found("cohort event", event_id));
        }
        cohort.updated_at = Utc::now();
        self.store.update_cohort(&cohort).await?;
        if let Some(event) = self.directory.get_event(event_id).await? {
            if event.cohort_id == Some(cohort_id) {
                self.directory.set_event_cohort(event_id, None).await?;
            }
        }
        Ok(cohort)
    }

    pub async fn get_all_semesters(&self, academic_year: Option<&str>) -> Result<Vec<SemesterSummary>> {
        let cohorts = self.store.list_cohorts(academic_year).await?;
        let since = Utc::now() - Duration::days(RECENT_PROGRESSION_DAYS);
        let mut summaries = Vec::with_capacity(cohorts.len());

        for cohort in cohorts {
            let records = self
                .store
                .list_progress(&ProgressFilter::active().in_cohorts(vec![cohort.id]))
                .await?;
            let mut status_breakdown: BTreeMap<ValidationStatus, usize> = BTreeMap::new();
            for student_id in &cohort.roster {
                let status = records
                    .iter()
                    .find(|r| r.student_id == *student_id)
                    .map_or(ValidationStatus::NotStarted, |r| r.validation_status);
                *status_breakdown.entry(status).or_insert(0) += 1;
            }

            let recent_progressions = self
                .store
                .cohort_enrollments(cohort.id)
                .await?
                .iter()
                .filter(|e| e.reason == EnrollmentReason::Progression && e.enrolled_at >= since)
                .count();

            summaries.push(SemesterSummary {
                cohort_id: cohort.id,
                semester: cohort.semester,
                name: cohort.name.clone(),
                academic_year: cohort.academic_year.clone(),
                status: cohort.status,
                roster_size: cohort.roster.len(),
                capacity: cohort.capacity,
                utilization: cohort.utilization(),
                status_breakdown,
                recent_progressions,
            });
        }
        Ok(summaries)
    }

    pub async fn get_statistics(&self, academic_year: Option<&str>) -> Result<RegistryStatistics> {
        let semesters = self.get_all_semesters(academic_year).await?;
        let mut status_breakdown: BTreeMap<ValidationStatus, usize> = BTreeMap::new();
        for summary in &semesters {
            for (status, count) in &summary.status_breakdown {
                *status_breakdown.entry(*status).or_insert(0) += count;
            }
        }
        let average_utilization = if semesters.is_empty() {
            0.0
        } else {
            semesters.iter().map(|s| s.utilization).sum::<f64>() / semesters.len() as f64
        };

        Ok(RegistryStatistics {
            academic_year: academic_year.map(str::to_string),
            total_cohorts: semesters.len(),
            total_students: semesters.iter().map(|s| s.roster_size).sum(),
            average_utilization,
            status_breakdown,
            semesters,
        })
    }

    /// Enrolls students in a cohort and gives them access to its events.
    ///
    /// Fails with `ConflictingEnrollment` when any student is on another
    /// non-archived roster; in that case nobody is added. A student whose
    /// roster entry or enrollment entry cannot be written is reported in
    /// `failed` and left off the roster.
    #[instrument(skip(self, student_ids), fields(count = student_ids.len()))]
    pub async fn add_students(&self, cohort_id: Uuid, student_ids: &[Uuid]) -> Result<AddStudentsReport> {
        let cohort = self.get_cohort(cohort_id).await?;
        if cohort.is_archived() {
            return Err(Error::InvalidInput(format!("cohort {cohort_id} is archived")));
        }

        let mut offenders = Vec::new();
        for student_id in student_ids {
            if self.directory.get_student(*student_id).await?.is_none() {
                return Err(Error::not_found("student", student_id));
            }
            let elsewhere = self
                .store
                .cohorts_for_student(*student_id)
                .await?
                .into_iter()
                .any(|c| c.id != cohort_id);
            if elsewhere {
                offenders.push(*student_id);
            }
        }
        if !offenders.is_empty() {
            return Err(Error::ConflictingEnrollment {
                cohort_id,
                students: offenders,
            });
        }

        let mut report = AddStudentsReport::default();
        let now = Utc::now();
        for student_id in student_ids {
            let entry = EnrollmentHistoryEntry::open(*student_id, &cohort, EnrollmentReason::Added, now);
            match self.store.enroll_student(&entry).await {
                Ok(true) => report.added.push(*student_id),
                Ok(false) => report.already_enrolled.push(*student_id),
                Err(e) => {
                    warn!(%cohort_id, %student_id, error = %e, "student not added");
                    report.failed.push(BatchFailure::new(*student_id, e));
                }
            }
        }

        for event_id in &cohort.event_ids {
            self.directory
                .add_event_participants(*event_id, &report.added)
                .await?;
        }

        let roster_size = cohort.roster.len() + report.added.len();
        if roster_size > cohort.capacity as usize {
            warn!(%cohort_id, roster_size, capacity = cohort.capacity, "cohort over capacity");
        }
        info!(%cohort_id, added = report.added.len(), failed = report.failed.len(), "students added");
        Ok(report)
    }

    /// Detaches a student, closes their enrollment history entry and retires
    /// their progress record in the cohort.
    pub async fn remove_student(&self, cohort_id: Uuid, student_id: Uuid) -> Result<()> {
        self.get_cohort(cohort_id).await?;
        if !self.store.remove_from_roster(cohort_id, student_id).await? {
            return Err(Error::not_found("roster entry", student_id));
        }
        let now = Utc::now();
        self.store.close_enrollment(student_id, cohort_id, now).await?;
        if let Some(record) = self.store.find_progress(student_id, cohort_id).await? {
            self.store.supersede_progress(record.id, now).await?;
        }
        info!(%cohort_id, %student_id, "student removed");
        Ok(())
    }
}

enum InitOutcome {
    Created,
    Updated,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Student, UserRole};
    use crate::store::{InMemoryDirectory, InMemoryStore};

    const YEAR: &str = "2026-2027";

    fn registry() -> (CohortRegistry, Arc<InMemoryStore>, Arc<InMemoryDirectory>) {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let registry = CohortRegistry::new(
            store.clone(),
            directory.clone(),
            Arc::new(Settings::default()),
        );
        (registry, store, directory)
    }

    fn students(directory: &InMemoryDirectory, count: usize) -> Vec<Uuid> {
        (0..count)
            .map(|i| {
                let id = Uuid::new_v4();
                directory
                    .insert_student(Student {
                        id,
                        full_name: format!("Scholar {i}"),
                        email: format!("scholar{i}-{id}@groupscholar.com"),
                        role: UserRole::Student,
                    })
                    .unwrap();
                id
            })
            .collect()
    }

    #[tokio::test]
    async fn initialization_is_idempotent() {
        let (registry, _, _) = registry();
        let first = registry.initialize_semesters(YEAR).await.unwrap();
        assert_eq!(first.created, 10);
        assert!(first.failed.is_empty());

        let second = registry.initialize_semesters(YEAR).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.existing(), 10);
        assert!(second.existing() >= first.existing());

        let cohorts = registry.get_all_semesters(Some(YEAR)).await.unwrap();
        assert_eq!(cohorts.len(), 10);
        assert_eq!(cohorts[0].name, "S1 Autumn 2026-2027");
    }

    #[tokio::test]
    async fn initialization_refreshes_stale_metadata_but_keeps_roster() {
        let (registry, store, directory) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let mut s4 = store.find_cohort(4, YEAR).await.unwrap().unwrap();
        let ids = students(&directory, 1);
        registry.add_students(s4.id, &ids).await.unwrap();
        s4.name = "renamed".into();
        store.update_cohort(&s4).await.unwrap();

        let report = registry.initialize_semesters(YEAR).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.unchanged, 9);
        let s4 = store.get_cohort(s4.id).await.unwrap().unwrap();
        assert_eq!(s4.name, canonical_name(4, YEAR));
        assert!(s4.roster.contains(&ids[0]));
    }

    #[tokio::test]
    async fn rejects_malformed_academic_year() {
        let (registry, _, _) = registry();
        assert!(matches!(
            registry.initialize_semesters("next year").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn one_active_cohort_per_semester_and_year() {
        let (registry, _, _) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let (starts_on, ends_on) = canonical_dates(2, 2026).unwrap();
        let duplicate = NewCohort {
            semester: 2,
            academic_year: YEAR.into(),
            name: None,
            starts_on,
            ends_on,
            status: CohortStatus::Active,
            criteria: Default::default(),
            capacity: 10,
        };
        assert!(matches!(
            registry.create_cohort(duplicate.clone()).await,
            Err(Error::DuplicateActiveCohort { semester: 2, .. })
        ));

        let draft = registry
            .create_cohort(NewCohort {
                status: CohortStatus::Draft,
                ..duplicate
            })
            .await
            .unwrap();
        let activate = CohortUpdate {
            status: Some(CohortStatus::Active),
            ..Default::default()
        };
        assert!(registry.update_cohort(draft.id, activate).await.is_err());
    }

    #[tokio::test]
    async fn add_students_rejects_enrollment_elsewhere() {
        let (registry, store, directory) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let s1 = store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let s2 = store.find_cohort(2, YEAR).await.unwrap().unwrap();
        let ids = students(&directory, 3);

        registry.add_students(s1.id, &ids[..2]).await.unwrap();
        let err = registry.add_students(s2.id, &ids).await.unwrap_err();
        match err {
            Error::ConflictingEnrollment { students, .. } => {
                assert_eq!(students, ids[..2].to_vec())
            }
            other => panic!("unexpected error {other:?}"),
        }
        let s2 = store.get_cohort(s2.id).await.unwrap().unwrap();
        assert!(s2.roster.is_empty());

        // No student sits on two non-archived rosters.
        for id in &ids {
            assert!(store.cohorts_for_student(*id).await.unwrap().len() <= 1);
        }
    }

    #[tokio::test]
    async fn mid_cohort_joiners_gain_event_access() {
        let (registry, store, directory) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let s1 = store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let event = crate::models::Event {
            id: Uuid::new_v4(),
            title: "Orientation".into(),
            cohort_id: None,
            starts_at: Utc::now(),
            participants: Default::default(),
        };
        directory.insert_event(event.clone()).unwrap();
        registry.link_event(s1.id, event.id).await.unwrap();

        let ids = students(&directory, 2);
        registry.add_students(s1.id, &ids).await.unwrap();

        let event = directory.get_event(event.id).await.unwrap().unwrap();
        assert_eq!(event.cohort_id, Some(s1.id));
        assert!(ids.iter().all(|id| event.participants.contains(id)));
    }

    #[tokio::test]
    async fn failed_history_write_leaves_student_off_roster() {
        let (registry, store, directory) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let s1 = store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let ids = students(&directory, 2);
        store.fail_enrollment_writes();

        let report = registry.add_students(s1.id, &ids).await.unwrap();
        assert!(report.added.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|f| matches!(f.error, Error::Storage(_))));

        let s1 = store.get_cohort(s1.id).await.unwrap().unwrap();
        assert!(s1.roster.is_empty());
        for id in &ids {
            assert!(store.enrollment_history(*id).await.unwrap().is_empty());
            assert!(store.cohorts_for_student(*id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn failed_roster_write_is_reported_per_student() {
        let (registry, store, directory) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let s1 = store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let ids = students(&directory, 2);
        store.fail_roster_adds(s1.id);

        let report = registry.add_students(s1.id, &ids).await.unwrap();
        assert!(report.added.is_empty());
        assert_eq!(
            report.failed.iter().map(|f| f.id).collect::<Vec<_>>(),
            ids
        );
        for id in &ids {
            assert!(store.enrollment_history(*id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn remove_student_closes_history_and_retires_record() {
        let (registry, store, directory) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let s1 = store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let ids = students(&directory, 1);
        registry.add_students(s1.id, &ids).await.unwrap();
        let record = crate::models::ProgressRecord::new(ids[0], &s1, Utc::now());
        store.insert_progress(&record).await.unwrap();

        registry.remove_student(s1.id, ids[0]).await.unwrap();

        let history = store.enrollment_history(ids[0]).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].left_at.is_some());
        assert!(store.find_progress(ids[0], s1.id).await.unwrap().is_none());
        assert!(store.current_progress(ids[0]).await.unwrap().is_none());
        let retired = store.get_progress(record.id).await.unwrap().unwrap();
        assert!(!retired.is_active());
        assert!(registry.remove_student(s1.id, ids[0]).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn non_empty_cohorts_cannot_be_deleted() {
        let (registry, store, directory) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let s1 = store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let ids = students(&directory, 1);
        registry.add_students(s1.id, &ids).await.unwrap();
        assert!(matches!(
            registry.delete_cohort(s1.id).await,
            Err(Error::CohortNotEmpty(_))
        ));

        let s9 = store.find_cohort(9, YEAR).await.unwrap().unwrap();
        registry.delete_cohort(s9.id).await.unwrap();
        assert!(store.get_cohort(s9.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn statistics_cover_roster_and_utilization() {
        let (registry, store, directory) = registry();
        registry.initialize_semesters(YEAR).await.unwrap();
        let s1 = store.find_cohort(1, YEAR).await.unwrap().unwrap();
        let ids = students(&directory, 6);
        registry.add_students(s1.id, &ids).await.unwrap();

        let stats = registry.get_statistics(Some(YEAR)).await.unwrap();
        assert_eq!(stats.total_cohorts, 10);
        assert_eq!(stats.total_students, 6);
        assert_eq!(stats.status_breakdown.get(&ValidationStatus::NotStarted), Some(&6));
        let s1_summary = &stats.semesters[0];
        assert_eq!(s1_summary.semester, 1);
        assert!((s1_summary.utilization - 10.0).abs() < 1e-9);
    }
}
