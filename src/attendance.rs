//! Attendance ledger: per-event presence marks feeding progress records.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{BatchFailure, Error, Result};
use crate::models::{AttendanceMark, AttendanceRecord, CallerContext, Event, SemesterCohort};
use crate::progress::{self, ProgressTracker};
use crate::store::{Directory, Store};

#[derive(Debug, Default)]
pub struct BulkAttendanceResult {
    pub marked: Vec<Uuid>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Clone)]
pub struct AttendanceLedger {
    store: Arc<dyn Store>,
    directory: Arc<dyn Directory>,
    tracker: ProgressTracker,
}

impl AttendanceLedger {
    pub fn new(store: Arc<dyn Store>, directory: Arc<dyn Directory>) -> Self {
        let tracker = ProgressTracker::new(store.clone(), directory.clone());
        Self {
            store,
            directory,
            tracker,
        }
    }

    /// Upserts one mark and refreshes the student's progress record.
    pub async fn mark_attendance(
        &self,
        caller: &CallerContext,
        event_id: Uuid,
        student_id: Uuid,
        attended: bool,
        notes: Option<String>,
    ) -> Result<AttendanceRecord> {
        let event = self.load_event(event_id).await?;
        let cohort = self.cohort_for(&event, student_id).await?;
        let record = AttendanceRecord {
            event_id,
            student_id,
            cohort_id: cohort.id,
            attended,
            marked_by: caller.caller_id,
            marked_at: Utc::now(),
            notes,
        };
        self.store.upsert_attendance(&record).await?;
        self.tracker.recompute(student_id, cohort.id).await?;
        Ok(record)
    }

    /// Applies a list of marks for one event of `cohort_id`.
    ///
    /// Each student is handled on its own: failures are reported per id and
    /// the rest of the list still goes through. When a student appears more
    /// than once, the last mark wins. An event outside the cohort fails every
    /// mark with `InvalidCohort`, as a single mark would.
    #[instrument(skip(self, caller, marks), fields(count = marks.len()))]
    pub async fn bulk_mark_attendance(
        &self,
        caller: &CallerContext,
        event_id: Uuid,
        cohort_id: Uuid,
        marks: &[AttendanceMark],
    ) -> Result<BulkAttendanceResult> {
        let event = self.load_event(event_id).await?;
        let cohort = self
            .store
            .get_cohort(cohort_id)
            .await?
            .ok_or_else(|| Error::not_found("cohort", cohort_id))?;
        let latest: BTreeMap<Uuid, &AttendanceMark> =
            marks.iter().map(|mark| (mark.student_id, mark)).collect();
        let mut result = BulkAttendanceResult::default();

        if !is_linked(&cohort, &event) {
            warn!(%event_id, %cohort_id, "event is not linked to cohort");
            result.failed = latest
                .into_keys()
                .map(|student_id| {
                    BatchFailure::new(student_id, Error::InvalidCohort { event_id, student_id })
                })
                .collect();
            return Ok(result);
        }

        for (student_id, mark) in latest {
            match self.apply_mark(caller, &cohort, event_id, mark).await {
                Ok(()) => result.marked.push(student_id),
                Err(error) => {
                    warn!(%student_id, %event_id, %error, "attendance mark failed");
                    result.failed.push(BatchFailure::new(student_id, error));
                }
            }
        }
        info!(
            marked = result.marked.len(),
            failed = result.failed.len(),
            "bulk attendance applied"
        );
        Ok(result)
    }

    /// Attendance rate of a student in a cohort; 100 when nothing is marked.
    pub async fn attendance_rate(&self, student_id: Uuid, cohort_id: Uuid) -> Result<f64> {
        let records = self.store.attendance_for(student_id, cohort_id).await?;
        Ok(progress::attendance_rate(&records))
    }

    async fn apply_mark(
        &self,
        caller: &CallerContext,
        cohort: &SemesterCohort,
        event_id: Uuid,
        mark: &AttendanceMark,
    ) -> Result<()> {
        if self.directory.get_student(mark.student_id).await?.is_none() {
            return Err(Error::not_found("student", mark.student_id));
        }
        if !cohort.roster.contains(&mark.student_id) {
            return Err(Error::InvalidCohort {
                event_id,
                student_id: mark.student_id,
            });
        }
        let record = AttendanceRecord {
            event_id,
            student_id: mark.student_id,
            cohort_id: cohort.id,
            attended: mark.attended,
            marked_by: caller.caller_id,
            marked_at: Utc::now(),
            notes: mark.notes.clone(),
        };
        self.store.upsert_attendance(&record).await?;
        self.tracker.recompute(mark.student_id, cohort.id).await?;
        Ok(())
    }

    async fn load_event(&self, event_id: Uuid) -> Result<Event> {
        self.directory
            .get_event(event_id)
            .await?
            .ok_or_else(|| Error::not_found("event", event_id))
    }

    /// The student's cohort the event belongs to.
    async fn cohort_for(&self, event: &Event, student_id: Uuid) -> Result<SemesterCohort> {
        if self.directory.get_student(student_id).await?.is_none() {
            return Err(Error::not_found("student", student_id));
        }
        self.store
            .cohorts_for_student(student_id)
            .await?
            .into_iter()
            .find(|cohort| is_linked(cohort, event))
            .ok_or(Error::InvalidCohort {
                event_id: event.id,
                student_id,
            })
    }
}

fn is_linked(cohort: &SemesterCohort, event: &Event) -> bool {
    event.cohort_id == Some(cohort.id) || cohort.event_ids.contains(&event.id)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::NaiveDate;

    use super::*;
    use crate::criteria::ValidationCriteria;
    use crate::models::{CallerRole, CohortStatus, IntakeSeason, Student, UserRole};
    use crate::store::{InMemoryDirectory, InMemoryStore};

    struct Fixture {
        ledger: AttendanceLedger,
        store: Arc<InMemoryStore>,
        directory: Arc<InMemoryDirectory>,
        cohort: SemesterCohort,
        event: Event,
        caller: CallerContext,
    }

    fn student(directory: &InMemoryDirectory) -> Uuid {
        let id = Uuid::new_v4();
        directory
            .insert_student(Student {
                id,
                full_name: "Avery Lee".into(),
                email: format!("{id}@groupscholar.com"),
                role: UserRole::Student,
            })
            .unwrap();
        id
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let now = Utc::now();
        let event = Event {
            id: Uuid::new_v4(),
            title: "Lecture 1".into(),
            cohort_id: None,
            starts_at: now,
            participants: BTreeSet::new(),
        };
        let cohort = SemesterCohort {
            id: Uuid::new_v4(),
            semester: 1,
            intake: IntakeSeason::Autumn,
            academic_year: "2026-2027".into(),
            name: "S1".into(),
            starts_on: NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
            ends_on: NaiveDate::from_ymd_opt(2027, 1, 31).unwrap(),
            status: CohortStatus::Active,
            roster: BTreeSet::new(),
            event_ids: [event.id].into_iter().collect(),
            criteria: ValidationCriteria::default(),
            capacity: 30,
            created_at: now,
            updated_at: now,
        };
        store.insert_cohort(&cohort).await.unwrap();
        directory.insert_event(event.clone()).unwrap();
        let ledger = AttendanceLedger::new(store.clone(), directory.clone());
        Fixture {
            ledger,
            store,
            directory,
            cohort,
            event,
            caller: CallerContext::new(Uuid::new_v4(), CallerRole::Staff),
        }
    }

    #[tokio::test]
    async fn marking_updates_rate_and_progress_record() {
        let f = fixture().await;
        let student_id = student(&f.directory);
        f.store.add_to_roster(f.cohort.id, student_id).await.unwrap();

        assert_eq!(f.ledger.attendance_rate(student_id, f.cohort.id).await.unwrap(), 100.0);
        f.ledger
            .mark_attendance(&f.caller, f.event.id, student_id, false, Some("sick".into()))
            .await
            .unwrap();

        assert_eq!(f.ledger.attendance_rate(student_id, f.cohort.id).await.unwrap(), 0.0);
        let record = f.store.find_progress(student_id, f.cohort.id).await.unwrap().unwrap();
        assert_eq!(record.attendance_rate, 0.0);

        // Re-marking the same event replaces the earlier mark.
        f.ledger
            .mark_attendance(&f.caller, f.event.id, student_id, true, None)
            .await
            .unwrap();
        let record = f.store.find_progress(student_id, f.cohort.id).await.unwrap().unwrap();
        assert_eq!(record.attendance_rate, 100.0);
    }

    #[tokio::test]
    async fn marking_requires_a_linked_cohort() {
        let f = fixture().await;
        let outsider = student(&f.directory);
        let err = f
            .ledger
            .mark_attendance(&f.caller, f.event.id, outsider, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCohort { .. }));

        let err = f
            .ledger
            .mark_attendance(&f.caller, Uuid::new_v4(), outsider, true, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = f
            .ledger
            .mark_attendance(&f.caller, f.event.id, Uuid::new_v4(), true, None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn bulk_marking_reports_failures_per_student() {
        let f = fixture().await;
        let present = student(&f.directory);
        let absent = student(&f.directory);
        let outsider = student(&f.directory);
        for id in [present, absent] {
            f.store.add_to_roster(f.cohort.id, id).await.unwrap();
        }
        let marks = vec![
            AttendanceMark { student_id: present, attended: true, notes: None },
            AttendanceMark { student_id: absent, attended: false, notes: None },
            AttendanceMark { student_id: outsider, attended: true, notes: None },
        ];

        let result = f
            .ledger
            .bulk_mark_attendance(&f.caller, f.event.id, f.cohort.id, &marks)
            .await
            .unwrap();

        assert_eq!(result.marked.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].id, outsider);
        assert!(matches!(result.failed[0].error, Error::InvalidCohort { .. }));
        assert_eq!(f.ledger.attendance_rate(absent, f.cohort.id).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn bulk_marking_rejects_unlinked_event_per_student() {
        let f = fixture().await;
        let student_id = student(&f.directory);
        f.store.add_to_roster(f.cohort.id, student_id).await.unwrap();
        let other_event = Event {
            id: Uuid::new_v4(),
            title: "Guest Talk".into(),
            cohort_id: None,
            starts_at: Utc::now(),
            participants: BTreeSet::new(),
        };
        f.directory.insert_event(other_event.clone()).unwrap();
        let marks = vec![AttendanceMark { student_id, attended: false, notes: None }];

        let result = f
            .ledger
            .bulk_mark_attendance(&f.caller, other_event.id, f.cohort.id, &marks)
            .await
            .unwrap();

        assert!(result.marked.is_empty());
        assert_eq!(result.failed.len(), 1);
        assert!(matches!(
            result.failed[0].error,
            Error::InvalidCohort { event_id, student_id: id } if event_id == other_event.id && id == student_id
        ));
        assert_eq!(f.ledger.attendance_rate(student_id, f.cohort.id).await.unwrap(), 100.0);
    }
}
