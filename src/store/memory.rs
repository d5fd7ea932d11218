//! In-memory store and directory.
//!
//! No durability and no cross-process coordination: suitable for tests and
//! dry runs only. Every operation takes a single lock, so each call is atomic
//! on its own.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{Directory, ProgressFilter, Store};
use crate::error::{Error, Result};
use crate::models::{
    AttendanceRecord, CohortStatus, Course, EnrollmentHistoryEntry, Event, ProgressRecord, SemesterCohort,
    Student, ValidationHistoryEntry, ValidationStatus,
};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Storage("lock poisoned".into())
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    cohorts: RwLock<HashMap<Uuid, SemesterCohort>>,
    progress: RwLock<HashMap<Uuid, ProgressRecord>>,
    attendance: RwLock<HashMap<(Uuid, Uuid), AttendanceRecord>>,
    enrollments: RwLock<Vec<EnrollmentHistoryEntry>>,
    failing_adds: RwLock<HashSet<Uuid>>,
    failing_removes: RwLock<HashSet<Uuid>>,
    failing_enrollments: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every roster add and removal on `cohort_id` fail.
    #[cfg(test)]
    pub fn fail_roster_writes(&self, cohort_id: Uuid) {
        if let Ok(mut adds) = self.failing_adds.write() {
            adds.insert(cohort_id);
        }
        if let Ok(mut removes) = self.failing_removes.write() {
            removes.insert(cohort_id);
        }
    }

    /// Makes roster adds on `cohort_id` fail.
    #[cfg(test)]
    pub fn fail_roster_adds(&self, cohort_id: Uuid) {
        if let Ok(mut adds) = self.failing_adds.write() {
            adds.insert(cohort_id);
        }
    }

    /// Makes roster removals on `cohort_id` fail.
    #[cfg(test)]
    pub fn fail_roster_removes(&self, cohort_id: Uuid) {
        if let Ok(mut removes) = self.failing_removes.write() {
            removes.insert(cohort_id);
        }
    }

    /// Makes every enrollment history write fail.
    #[cfg(test)]
    pub fn fail_enrollment_writes(&self) {
        self.failing_enrollments.store(true, Ordering::SeqCst);
    }

    fn check_roster_fault(&self, faults: &RwLock<HashSet<Uuid>>, cohort_id: Uuid) -> Result<()> {
        if faults.read().map_err(poison_err)?.contains(&cohort_id) {
            return Err(Error::Storage(format!("roster write rejected for cohort {cohort_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_cohort(&self, cohort: &SemesterCohort) -> Result<()> {
        let mut cohorts = self.cohorts.write().map_err(poison_err)?;
        if cohorts.contains_key(&cohort.id) {
            return Err(Error::Storage(format!("cohort {} already exists", cohort.id)));
        }
        cohorts.insert(cohort.id, cohort.clone());
        Ok(())
    }

    async fn update_cohort(&self, cohort: &SemesterCohort) -> Result<()> {
        let mut cohorts = self.cohorts.write().map_err(poison_err)?;
        let stored = cohorts
            .get_mut(&cohort.id)
            .ok_or_else(|| Error::not_found("cohort", cohort.id))?;
        let roster = std::mem::take(&mut stored.roster);
        *stored = cohort.clone();
        stored.roster = roster;
        Ok(())
    }

    async fn get_cohort(&self, id: Uuid) -> Result<Option<SemesterCohort>> {
        Ok(self.cohorts.read().map_err(poison_err)?.get(&id).cloned())
    }

    async fn find_cohort(
        &self,
        semester: u8,
        academic_year: &str,
    ) -> Result<Option<SemesterCohort>> {
        let cohorts = self.cohorts.read().map_err(poison_err)?;
        let mut matching: Vec<&SemesterCohort> = cohorts
            .values()
            .filter(|c| c.semester == semester && c.academic_year == academic_year)
            .collect();
        // Prefer the active cohort, then the oldest one.
        matching.sort_by_key(|c| (c.status != CohortStatus::Active, c.created_at));
        Ok(matching.first().map(|c| (*c).clone()))
    }

    async fn list_cohorts(&self, academic_year: Option<&str>) -> Result<Vec<SemesterCohort>> {
        let cohorts = self.cohorts.read().map_err(poison_err)?;
        let mut listed: Vec<SemesterCohort> = cohorts
            .values()
            .filter(|c| academic_year.map_or(true, |year| c.academic_year == year))
            .cloned()
            .collect();
        listed.sort_by(|a, b| {
            a.academic_year
                .cmp(&b.academic_year)
                .then(a.semester.cmp(&b.semester))
        });
        Ok(listed)
    }

    async fn delete_cohort(&self, id: Uuid) -> Result<bool> {
        Ok(self.cohorts.write().map_err(poison_err)?.remove(&id).is_some())
    }

    async fn cohorts_for_student(&self, student_id: Uuid) -> Result<Vec<SemesterCohort>> {
        let cohorts = self.cohorts.read().map_err(poison_err)?;
        Ok(cohorts
            .values()
            .filter(|c| !c.is_archived() && c.roster.contains(&student_id))
            .cloned()
            .collect())
    }

    async fn add_to_roster(&self, cohort_id: Uuid, student_id: Uuid) -> Result<bool> {
        self.check_roster_fault(&self.failing_adds, cohort_id)?;
        let mut cohorts = self.cohorts.write().map_err(poison_err)?;
        let cohort = cohorts
            .get_mut(&cohort_id)
            .ok_or_else(|| Error::not_found("cohort", cohort_id))?;
        cohort.updated_at = Utc::now();
        Ok(cohort.roster.insert(student_id))
    }

    async fn remove_from_roster(&self, cohort_id: Uuid, student_id: Uuid) -> Result<bool> {
        self.check_roster_fault(&self.failing_removes, cohort_id)?;
        let mut cohorts = self.cohorts.write().map_err(poison_err)?;
        let cohort = cohorts
            .get_mut(&cohort_id)
            .ok_or_else(|| Error::not_found("cohort", cohort_id))?;
        cohort.updated_at = Utc::now();
        Ok(cohort.roster.remove(&student_id))
    }

    async fn insert_progress(&self, record: &ProgressRecord) -> Result<()> {
        let mut progress = self.progress.write().map_err(poison_err)?;
        let duplicate = progress.values().any(|r| {
            r.is_active() && r.student_id == record.student_id && r.cohort_id == record.cohort_id
        });
        if duplicate || progress.contains_key(&record.id) {
            return Err(Error::Storage(format!(
                "student {} already has an active record in cohort {}",
                record.student_id, record.cohort_id
            )));
        }
        progress.insert(record.id, record.clone());
        Ok(())
    }

    async fn save_progress(&self, record: &ProgressRecord) -> Result<()> {
        let mut progress = self.progress.write().map_err(poison_err)?;
        let stored = progress
            .get_mut(&record.id)
            .ok_or_else(|| Error::not_found("progress record", record.id))?;
        stored.grades = record.grades.clone();
        stored.average_grade = record.average_grade;
        stored.attendance_rate = record.attendance_rate;
        stored.overall_progress = record.overall_progress;
        stored.courses_completed = record.courses_completed.clone();
        stored.courses_in_progress = record.courses_in_progress.clone();
        stored.validation_criteria = record.validation_criteria.clone();
        stored.updated_at = record.updated_at;
        Ok(())
    }

    async fn get_progress(&self, id: Uuid) -> Result<Option<ProgressRecord>> {
        Ok(self.progress.read().map_err(poison_err)?.get(&id).cloned())
    }

    async fn find_progress(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
    ) -> Result<Option<ProgressRecord>> {
        let progress = self.progress.read().map_err(poison_err)?;
        Ok(progress
            .values()
            .find(|r| r.is_active() && r.student_id == student_id && r.cohort_id == cohort_id)
            .cloned())
    }

    async fn current_progress(&self, student_id: Uuid) -> Result<Option<ProgressRecord>> {
        let progress = self.progress.read().map_err(poison_err)?;
        Ok(progress
            .values()
            .filter(|r| r.is_active() && r.student_id == student_id)
            .max_by_key(|r| (r.current_semester, r.created_at))
            .cloned())
    }

    async fn list_progress(&self, filter: &ProgressFilter) -> Result<Vec<ProgressRecord>> {
        let progress = self.progress.read().map_err(poison_err)?;
        let mut records: Vec<ProgressRecord> =
            progress.values().filter(|r| filter.matches(r)).cloned().collect();
        records.sort_by_key(|r| (r.current_semester, r.created_at));
        Ok(records)
    }

    async fn apply_validation(
        &self,
        record_id: Uuid,
        entry: &ValidationHistoryEntry,
        status: ValidationStatus,
        target_semester: Option<u8>,
    ) -> Result<ProgressRecord> {
        let mut progress = self.progress.write().map_err(poison_err)?;
        let record = progress
            .get_mut(&record_id)
            .ok_or_else(|| Error::not_found("progress record", record_id))?;
        record.validation_history.push(entry.clone());
        record.validation_status = status;
        record.target_semester = target_semester;
        record.updated_at = entry.decided_at;
        Ok(record.clone())
    }

    async fn mark_pending(
        &self,
        record_id: Uuid,
        next_validation_date: DateTime<Utc>,
    ) -> Result<ProgressRecord> {
        let mut progress = self.progress.write().map_err(poison_err)?;
        let record = progress
            .get_mut(&record_id)
            .ok_or_else(|| Error::not_found("progress record", record_id))?;
        record.validation_status = ValidationStatus::PendingValidation;
        record.target_semester = None;
        record.next_validation_date = Some(next_validation_date);
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn supersede_progress(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut progress = self.progress.write().map_err(poison_err)?;
        let record = progress
            .get_mut(&record_id)
            .ok_or_else(|| Error::not_found("progress record", record_id))?;
        record.superseded_at = Some(at);
        record.updated_at = at;
        Ok(())
    }

    async fn upsert_attendance(&self, record: &AttendanceRecord) -> Result<()> {
        self.attendance
            .write()
            .map_err(poison_err)?
            .insert((record.event_id, record.student_id), record.clone());
        Ok(())
    }

    async fn attendance_for(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
    ) -> Result<Vec<AttendanceRecord>> {
        let attendance = self.attendance.read().map_err(poison_err)?;
        Ok(attendance
            .values()
            .filter(|r| r.student_id == student_id && r.cohort_id == cohort_id)
            .cloned()
            .collect())
    }

    async fn open_enrollment(&self, entry: &EnrollmentHistoryEntry) -> Result<()> {
        if self.failing_enrollments.load(Ordering::SeqCst) {
            return Err(Error::Storage("enrollment history write rejected".into()));
        }
        self.enrollments.write().map_err(poison_err)?.push(entry.clone());
        Ok(())
    }

    async fn close_enrollment(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut enrollments = self.enrollments.write().map_err(poison_err)?;
        let open = enrollments.iter_mut().find(|e| {
            e.student_id == student_id && e.cohort_id == cohort_id && e.left_at.is_none()
        });
        Ok(match open {
            Some(entry) => {
                entry.left_at = Some(at);
                true
            }
            None => false,
        })
    }

    async fn enrollment_history(&self, student_id: Uuid) -> Result<Vec<EnrollmentHistoryEntry>> {
        let enrollments = self.enrollments.read().map_err(poison_err)?;
        Ok(enrollments
            .iter()
            .filter(|e| e.student_id == student_id)
            .cloned()
            .collect())
    }

    async fn cohort_enrollments(&self, cohort_id: Uuid) -> Result<Vec<EnrollmentHistoryEntry>> {
        let enrollments = self.enrollments.read().map_err(poison_err)?;
        Ok(enrollments
            .iter()
            .filter(|e| e.cohort_id == cohort_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    students: RwLock<HashMap<Uuid, Student>>,
    events: RwLock<HashMap<Uuid, Event>>,
    courses: RwLock<HashMap<Uuid, Course>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_student(&self, student: Student) -> Result<()> {
        self.students
            .write()
            .map_err(poison_err)?
            .insert(student.id, student);
        Ok(())
    }

    pub fn insert_event(&self, event: Event) -> Result<()> {
        self.events.write().map_err(poison_err)?.insert(event.id, event);
        Ok(())
    }

    pub fn insert_course(&self, course: Course) -> Result<()> {
        self.courses.write().map_err(poison_err)?.insert(course.id, course);
        Ok(())
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn get_student(&self, id: Uuid) -> Result<Option<Student>> {
        Ok(self.students.read().map_err(poison_err)?.get(&id).cloned())
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.events.read().map_err(poison_err)?.get(&id).cloned())
    }

    async fn set_event_cohort(&self, event_id: Uuid, cohort_id: Option<Uuid>) -> Result<()> {
        let mut events = self.events.write().map_err(poison_err)?;
        let event = events
            .get_mut(&event_id)
            .ok_or_else(|| Error::not_found("event", event_id))?;
        event.cohort_id = cohort_id;
        Ok(())
    }

    async fn add_event_participants(&self, event_id: Uuid, student_ids: &[Uuid]) -> Result<()> {
        let mut events = self.events.write().map_err(poison_err)?;
        let event = events
            .get_mut(&event_id)
            .ok_or_else(|| Error::not_found("event", event_id))?;
        event.participants.extend(student_ids.iter().copied());
        Ok(())
    }

    async fn get_course(&self, id: Uuid) -> Result<Option<Course>> {
        Ok(self.courses.read().map_err(poison_err)?.get(&id).cloned())
    }
}
