//! Progress records: derived metrics and the operations that feed them.
//!
//! Attendance rate, average grade and overall progress are caches. They are
//! always rebuilt from grades, course data and the attendance ledger by
//! [`refresh_derived`] and never edited by hand.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::criteria::CriteriaOverride;
use crate::error::{Error, Result};
use crate::models::{AttendanceRecord, Course, CourseProgress, ProgressRecord};
use crate::store::{Directory, Store};

const COURSE_WEIGHT: f64 = 0.6;
const GRADE_WEIGHT: f64 = 0.2;
const ATTENDANCE_WEIGHT: f64 = 0.2;

/// Attended share of marked events, as a percentage. No marks means no
/// penalty: the rate is 100.
pub fn attendance_rate(records: &[AttendanceRecord]) -> f64 {
    if records.is_empty() {
        return 100.0;
    }
    let attended = records.iter().filter(|r| r.attended).count();
    attended as f64 / records.len() as f64 * 100.0
}

pub fn average_grade(record: &ProgressRecord) -> f64 {
    if record.grades.is_empty() {
        return 0.0;
    }
    record.grades.values().sum::<f64>() / record.grades.len() as f64
}

/// Completion of one course from chapter and exercise counters. Chapters and
/// exercises weigh half each; a course with only one kind uses that kind.
pub fn course_percent(course: &Course, chapters_completed: u32, exercises_completed: u32) -> f64 {
    let ratio = |done: u32, total: u32| (done.min(total) as f64 / total as f64) * 100.0;
    match (course.total_chapters, course.total_exercises) {
        (0, 0) => 0.0,
        (chapters, 0) => ratio(chapters_completed, chapters),
        (0, exercises) => ratio(exercises_completed, exercises),
        (chapters, exercises) => {
            (ratio(chapters_completed, chapters) + ratio(exercises_completed, exercises)) / 2.0
        }
    }
}

/// Completed courses count as 100%; courses in progress count their percentage.
pub fn course_completion(record: &ProgressRecord) -> f64 {
    let tracked = record.courses_completed.len() + record.courses_in_progress.len();
    if tracked == 0 {
        return 0.0;
    }
    let completed = record.courses_completed.len() as f64 * 100.0;
    let in_progress: f64 = record.courses_in_progress.values().map(|c| c.percent).sum();
    (completed + in_progress) / tracked as f64
}

pub fn overall_progress(record: &ProgressRecord) -> f64 {
    let composite = course_completion(record) * COURSE_WEIGHT
        + record.average_grade * GRADE_WEIGHT
        + record.attendance_rate * ATTENDANCE_WEIGHT;
    composite.clamp(0.0, 100.0)
}

/// Rebuilds every derived field of `record`.
pub fn refresh_derived(record: &mut ProgressRecord, attendance: &[AttendanceRecord]) {
    record.average_grade = average_grade(record);
    record.attendance_rate = attendance_rate(attendance);
    record.overall_progress = overall_progress(record);
    record.updated_at = Utc::now();
}

fn check_grade(grade: f64) -> Result<()> {
    if !grade.is_finite() || !(0.0..=100.0).contains(&grade) {
        return Err(Error::InvalidInput(format!("grade {grade} is outside 0-100")));
    }
    Ok(())
}

/// Creates progress records on first need and applies grade and course updates.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>) -> Self {
        Self { store, directory }
    }

    /// Returns the student's active record in the cohort, creating it with the
    /// cohort's default criteria when missing.
    pub async fn ensure_record(&self, student_id: Uuid, cohort_id: Uuid) -> Result<ProgressRecord> {
        if let Some(record) = self.store.find_progress(student_id, cohort_id).await? {
            return Ok(record);
        }
        let cohort = self
            .store
            .get_cohort(cohort_id)
            .await?
            .ok_or_else(|| Error::not_found("cohort", cohort_id))?;
        let record = ProgressRecord::new(student_id, &cohort, Utc::now());
        if let Err(err) = self.store.insert_progress(&record).await {
            // Lost a creation race: the other writer's record is the one to use.
            return match self.store.find_progress(student_id, cohort_id).await? {
                Some(existing) => Ok(existing),
                None => Err(err),
            };
        }
        debug!(%student_id, %cohort_id, "created progress record");
        Ok(record)
    }

    /// Rebuilds the derived fields of the student's record from the ledger.
    pub async fn recompute(&self, student_id: Uuid, cohort_id: Uuid) -> Result<ProgressRecord> {
        let mut record = self.ensure_record(student_id, cohort_id).await?;
        let attendance = self.store.attendance_for(student_id, cohort_id).await?;
        refresh_derived(&mut record, &attendance);
        self.store.save_progress(&record).await?;
        Ok(record)
    }

    pub async fn record_grade(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
        course_id: Uuid,
        grade: f64,
    ) -> Result<ProgressRecord> {
        check_grade(grade)?;
        let mut record = self.ensure_record(student_id, cohort_id).await?;
        record.grades.insert(course_id, grade);
        self.persist(record).await
    }

    /// Updates the counters of a course in progress. Reaching 100% moves the
    /// course to the completed set.
    pub async fn update_course_progress(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
        course_id: Uuid,
        chapters_completed: u32,
        exercises_completed: u32,
    ) -> Result<ProgressRecord> {
        let course = self
            .directory
            .get_course(course_id)
            .await?
            .ok_or_else(|| Error::not_found("course", course_id))?;
        let mut record = self.ensure_record(student_id, cohort_id).await?;
        if record.courses_completed.contains(&course_id) {
            return Ok(record);
        }

        let percent = course_percent(&course, chapters_completed, exercises_completed);
        if percent >= 100.0 {
            record.courses_in_progress.remove(&course_id);
            record.courses_completed.insert(course_id);
        } else {
            record.courses_in_progress.insert(
                course_id,
                CourseProgress {
                    chapters_completed,
                    exercises_completed,
                    percent,
                },
            );
        }
        self.persist(record).await
    }

    pub async fn mark_course_completed(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
        course_id: Uuid,
    ) -> Result<ProgressRecord> {
        if self.directory.get_course(course_id).await?.is_none() {
            return Err(Error::not_found("course", course_id));
        }
        let mut record = self.ensure_record(student_id, cohort_id).await?;
        record.courses_in_progress.remove(&course_id);
        record.courses_completed.insert(course_id);
        info!(%student_id, %course_id, "course completed");
        self.persist(record).await
    }

    /// Replaces the record's effective criteria with the cohort defaults
    /// merged with `overrides`.
    pub async fn set_criteria_override(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
        overrides: &CriteriaOverride,
    ) -> Result<ProgressRecord> {
        let cohort = self
            .store
            .get_cohort(cohort_id)
            .await?
            .ok_or_else(|| Error::not_found("cohort", cohort_id))?;
        let criteria = cohort.criteria.merged(overrides)?;
        let mut record = self.ensure_record(student_id, cohort_id).await?;
        record.validation_criteria = criteria;
        self.persist(record).await
    }

    async fn persist(&self, mut record: ProgressRecord) -> Result<ProgressRecord> {
        let attendance = self
            .store
            .attendance_for(record.student_id, record.cohort_id)
            .await?;
        refresh_derived(&mut record, &attendance);
        self.store.save_progress(&record).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::criteria::ValidationCriteria;
    use crate::models::{CohortStatus, IntakeSeason, SemesterCohort};
    use crate::store::{InMemoryDirectory, InMemoryStore};

    fn mark(attended: bool) -> AttendanceRecord {
        AttendanceRecord {
            event_id: Uuid::new_v4(),
            student_id: Uuid::nil(),
            cohort_id: Uuid::nil(),
            attended,
            marked_by: Uuid::nil(),
            marked_at: Utc::now(),
            notes: None,
        }
    }

    fn course(chapters: u32, exercises: u32) -> Course {
        Course {
            id: Uuid::new_v4(),
            title: "Algorithms".into(),
            total_chapters: chapters,
            total_exercises: exercises,
        }
    }

    async fn setup() -> (ProgressTracker, Arc<InMemoryDirectory>, SemesterCohort) {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let now = Utc::now();
        let cohort = SemesterCohort {
            id: Uuid::new_v4(),
            semester: 3,
            intake: IntakeSeason::Autumn,
            academic_year: "2026-2027".into(),
            name: "S3".into(),
            starts_on: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            ends_on: NaiveDate::from_ymd_opt(2027, 1, 31).unwrap(),
            status: CohortStatus::Active,
            roster: Default::default(),
            event_ids: Default::default(),
            criteria: ValidationCriteria::default(),
            capacity: 30,
            created_at: now,
            updated_at: now,
        };
        store.insert_cohort(&cohort).await.unwrap();
        let tracker = ProgressTracker::new(store, directory.clone());
        (tracker, directory, cohort)
    }

    #[test]
    fn attendance_rate_defaults_to_full_without_marks() {
        assert_eq!(attendance_rate(&[]), 100.0);
        assert_eq!(attendance_rate(&[mark(true), mark(false)]), 50.0);
        assert_eq!(attendance_rate(&[mark(false)]), 0.0);
    }

    #[test]
    fn course_percent_weighs_chapters_and_exercises() {
        assert_eq!(course_percent(&course(10, 20), 5, 20), 75.0);
        assert_eq!(course_percent(&course(4, 0), 1, 99), 25.0);
        assert_eq!(course_percent(&course(0, 0), 3, 3), 0.0);
        assert_eq!(course_percent(&course(2, 2), 10, 10), 100.0);
    }

    #[tokio::test]
    async fn ensure_record_is_lazy_and_stable() {
        let (tracker, _, cohort) = setup().await;
        let student_id = Uuid::new_v4();
        let first = tracker.ensure_record(student_id, cohort.id).await.unwrap();
        let second = tracker.ensure_record(student_id, cohort.id).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.current_semester, 3);
        assert_eq!(first.validation_criteria, cohort.criteria);
    }

    #[tokio::test]
    async fn grades_and_courses_feed_overall_progress() {
        let (tracker, directory, cohort) = setup().await;
        let student_id = Uuid::new_v4();
        let algorithms = course(4, 0);
        directory.insert_course(algorithms.clone()).unwrap();

        tracker
            .record_grade(student_id, cohort.id, algorithms.id, 80.0)
            .await
            .unwrap();
        let record = tracker
            .update_course_progress(student_id, cohort.id, algorithms.id, 2, 0)
            .await
            .unwrap();
        assert_eq!(record.average_grade, 80.0);
        // 50% course * 0.6 + 80 * 0.2 + 100 attendance * 0.2
        assert!((record.overall_progress - 66.0).abs() < 1e-9);

        let record = tracker
            .update_course_progress(student_id, cohort.id, algorithms.id, 4, 0)
            .await
            .unwrap();
        assert!(record.courses_completed.contains(&algorithms.id));
        assert!(record.courses_in_progress.is_empty());
    }

    #[tokio::test]
    async fn rejects_grades_outside_range_and_unknown_courses() {
        let (tracker, _, cohort) = setup().await;
        let student_id = Uuid::new_v4();
        assert!(matches!(
            tracker.record_grade(student_id, cohort.id, Uuid::new_v4(), 101.0).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(tracker
            .mark_course_completed(student_id, cohort.id, Uuid::new_v4())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn criteria_override_merges_onto_cohort_defaults() {
        let (tracker, _, cohort) = setup().await;
        let student_id = Uuid::new_v4();
        let overrides = CriteriaOverride {
            courses_required: Some(3),
            ..Default::default()
        };
        let record = tracker
            .set_criteria_override(student_id, cohort.id, &overrides)
            .await
            .unwrap();
        assert_eq!(record.validation_criteria.courses_required, 3);
        assert_eq!(record.validation_criteria.min_grade, cohort.criteria.min_grade);
    }
}
