//! Postgres-backed store and directory.
//!
//! All SQL is runtime-checked (`sqlx::query`, not `sqlx::query!`) so the crate
//! builds without a database. Sets, maps and history are stored as JSONB.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::{Directory, Migration, ProgressFilter, Store};
use crate::criteria::ValidationCriteria;
use crate::error::{Error, Result};
use crate::models::{
    AttendanceRecord, Course, CourseProgress, EnrollmentHistoryEntry, Event, ProgressRecord,
    SemesterCohort, Student, UserRole, ValidationHistoryEntry, ValidationStatus,
};

const COHORT_SELECT: &str = r#"
    SELECT c.id, c.semester, c.intake, c.academic_year, c.name, c.starts_on, c.ends_on,
           c.status, c.criteria, c.capacity, c.created_at, c.updated_at,
           ARRAY(SELECT m.student_id FROM semester_progression.cohort_members m
                 WHERE m.cohort_id = c.id ORDER BY m.student_id) AS roster,
           ARRAY(SELECT e.event_id FROM semester_progression.cohort_events e
                 WHERE e.cohort_id = c.id ORDER BY e.event_id) AS event_ids
    FROM semester_progression.cohorts c
"#;

const PROGRESS_COLUMNS: &str = r#"
    id, student_id, cohort_id, current_semester, target_semester, grades, average_grade,
    attendance_rate, overall_progress, courses_completed, courses_in_progress,
    validation_status, next_validation_date, validation_criteria, validation_history,
    created_at, updated_at, superseded_at
"#;

#[derive(sqlx::FromRow)]
struct CohortRow {
    id: Uuid,
    semester: i16,
    intake: String,
    academic_year: String,
    name: String,
    starts_on: NaiveDate,
    ends_on: NaiveDate,
    status: String,
    criteria: Json<ValidationCriteria>,
    capacity: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    roster: Vec<Uuid>,
    event_ids: Vec<Uuid>,
}

impl TryFrom<CohortRow> for SemesterCohort {
    type Error = Error;

    fn try_from(row: CohortRow) -> Result<Self> {
        Ok(SemesterCohort {
            id: row.id,
            semester: to_semester(row.semester)?,
            intake: row.intake.parse()?,
            academic_year: row.academic_year,
            name: row.name,
            starts_on: row.starts_on,
            ends_on: row.ends_on,
            status: row.status.parse()?,
            roster: row.roster.into_iter().collect(),
            event_ids: row.event_ids.into_iter().collect(),
            criteria: row.criteria.0,
            capacity: u32::try_from(row.capacity)
                .map_err(|_| Error::Storage(format!("negative capacity {}", row.capacity)))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProgressRow {
    id: Uuid,
    student_id: Uuid,
    cohort_id: Uuid,
    current_semester: i16,
    target_semester: Option<i16>,
    grades: Json<BTreeMap<Uuid, f64>>,
    average_grade: f64,
    attendance_rate: f64,
    overall_progress: f64,
    courses_completed: Json<BTreeSet<Uuid>>,
    courses_in_progress: Json<BTreeMap<Uuid, CourseProgress>>,
    validation_status: String,
    next_validation_date: Option<DateTime<Utc>>,
    validation_criteria: Json<ValidationCriteria>,
    validation_history: Json<Vec<ValidationHistoryEntry>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    superseded_at: Option<DateTime<Utc>>,
}

impl TryFrom<ProgressRow> for ProgressRecord {
    type Error = Error;

    fn try_from(row: ProgressRow) -> Result<Self> {
        Ok(ProgressRecord {
            id: row.id,
            student_id: row.student_id,
            cohort_id: row.cohort_id,
            current_semester: to_semester(row.current_semester)?,
            target_semester: row.target_semester.map(to_semester).transpose()?,
            grades: row.grades.0,
            average_grade: row.average_grade,
            attendance_rate: row.attendance_rate,
            overall_progress: row.overall_progress,
            courses_completed: row.courses_completed.0,
            courses_in_progress: row.courses_in_progress.0,
            validation_status: row.validation_status.parse()?,
            next_validation_date: row.next_validation_date,
            validation_criteria: row.validation_criteria.0,
            validation_history: row.validation_history.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            superseded_at: row.superseded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EnrollmentRow {
    id: Uuid,
    student_id: Uuid,
    cohort_id: Uuid,
    semester: i16,
    reason: String,
    enrolled_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
}

impl TryFrom<EnrollmentRow> for EnrollmentHistoryEntry {
    type Error = Error;

    fn try_from(row: EnrollmentRow) -> Result<Self> {
        Ok(EnrollmentHistoryEntry {
            id: row.id,
            student_id: row.student_id,
            cohort_id: row.cohort_id,
            semester: to_semester(row.semester)?,
            reason: row.reason.parse()?,
            enrolled_at: row.enrolled_at,
            left_at: row.left_at,
        })
    }
}

fn to_semester(value: i16) -> Result<u8> {
    u8::try_from(value).map_err(|_| Error::Storage(format!("semester {value} out of range")))
}

fn collect_rows<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

async fn insert_progress_row<'c>(executor: impl PgExecutor<'c>, record: &ProgressRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO semester_progression.progress_records
        (id, student_id, cohort_id, current_semester, target_semester, grades, average_grade,
         attendance_rate, overall_progress, courses_completed, courses_in_progress,
         validation_status, next_validation_date, validation_criteria, validation_history,
         created_at, updated_at, superseded_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(record.id)
    .bind(record.student_id)
    .bind(record.cohort_id)
    .bind(i16::from(record.current_semester))
    .bind(record.target_semester.map(i16::from))
    .bind(Json(&record.grades))
    .bind(record.average_grade)
    .bind(record.attendance_rate)
    .bind(record.overall_progress)
    .bind(Json(&record.courses_completed))
    .bind(Json(&record.courses_in_progress))
    .bind(record.validation_status.as_str())
    .bind(record.next_validation_date)
    .bind(Json(&record.validation_criteria))
    .bind(Json(&record.validation_history))
    .bind(record.created_at)
    .bind(record.updated_at)
    .bind(record.superseded_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_enrollment_row<'c>(
    executor: impl PgExecutor<'c>,
    entry: &EnrollmentHistoryEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO semester_progression.enrollment_history
        (id, student_id, cohort_id, semester, reason, enrolled_at, left_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(entry.id)
    .bind(entry.student_id)
    .bind(entry.cohort_id)
    .bind(i16::from(entry.semester))
    .bind(entry.reason.as_str())
    .bind(entry.enrolled_at)
    .bind(entry.left_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn close_enrollment_row<'c>(
    executor: impl PgExecutor<'c>,
    student_id: Uuid,
    cohort_id: Uuid,
    at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE semester_progression.enrollment_history
        SET left_at = $3
        WHERE student_id = $1 AND cohort_id = $2 AND left_at IS NULL
        "#,
    )
    .bind(student_id)
    .bind(cohort_id)
    .bind(at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_progress_where(&self, clause: &str, binds: &[Uuid]) -> Result<Option<ProgressRecord>> {
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM semester_progression.progress_records {clause} LIMIT 1"
        );
        let mut query = sqlx::query_as::<_, ProgressRow>(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        query
            .fetch_optional(&self.pool)
            .await?
            .map(ProgressRecord::try_from)
            .transpose()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_cohort(&self, cohort: &SemesterCohort) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO semester_progression.cohorts
            (id, semester, intake, academic_year, name, starts_on, ends_on, status,
             criteria, capacity, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(cohort.id)
        .bind(i16::from(cohort.semester))
        .bind(cohort.intake.as_str())
        .bind(&cohort.academic_year)
        .bind(&cohort.name)
        .bind(cohort.starts_on)
        .bind(cohort.ends_on)
        .bind(cohort.status.as_str())
        .bind(Json(&cohort.criteria))
        .bind(cohort.capacity as i32)
        .bind(cohort.created_at)
        .bind(cohort.updated_at)
        .execute(&mut *tx)
        .await?;

        let roster: Vec<Uuid> = cohort.roster.iter().copied().collect();
        sqlx::query(
            r#"
            INSERT INTO semester_progression.cohort_members (cohort_id, student_id)
            SELECT $1, UNNEST($2::uuid[])
            "#,
        )
        .bind(cohort.id)
        .bind(&roster)
        .execute(&mut *tx)
        .await?;

        let events: Vec<Uuid> = cohort.event_ids.iter().copied().collect();
        sqlx::query(
            r#"
            INSERT INTO semester_progression.cohort_events (cohort_id, event_id)
            SELECT $1, UNNEST($2::uuid[])
            "#,
        )
        .bind(cohort.id)
        .bind(&events)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_cohort(&self, cohort: &SemesterCohort) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE semester_progression.cohorts
            SET name = $2, starts_on = $3, ends_on = $4, status = $5, criteria = $6,
                capacity = $7, intake = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(cohort.id)
        .bind(&cohort.name)
        .bind(cohort.starts_on)
        .bind(cohort.ends_on)
        .bind(cohort.status.as_str())
        .bind(Json(&cohort.criteria))
        .bind(cohort.capacity as i32)
        .bind(cohort.intake.as_str())
        .bind(cohort.updated_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("cohort", cohort.id));
        }

        let events: Vec<Uuid> = cohort.event_ids.iter().copied().collect();
        sqlx::query("DELETE FROM semester_progression.cohort_events WHERE cohort_id = $1")
            .bind(cohort.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO semester_progression.cohort_events (cohort_id, event_id)
            SELECT $1, UNNEST($2::uuid[])
            "#,
        )
        .bind(cohort.id)
        .bind(&events)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_cohort(&self, id: Uuid) -> Result<Option<SemesterCohort>> {
        let sql = format!("{COHORT_SELECT} WHERE c.id = $1");
        sqlx::query_as::<_, CohortRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(SemesterCohort::try_from)
            .transpose()
    }

    async fn find_cohort(
        &self,
        semester: u8,
        academic_year: &str,
    ) -> Result<Option<SemesterCohort>> {
        let sql = format!(
            "{COHORT_SELECT} WHERE c.semester = $1 AND c.academic_year = $2 \
             ORDER BY (c.status <> 'active'), c.created_at LIMIT 1"
        );
        sqlx::query_as::<_, CohortRow>(&sql)
            .bind(i16::from(semester))
            .bind(academic_year)
            .fetch_optional(&self.pool)
            .await?
            .map(SemesterCohort::try_from)
            .transpose()
    }

    async fn list_cohorts(&self, academic_year: Option<&str>) -> Result<Vec<SemesterCohort>> {
        let sql = format!(
            "{COHORT_SELECT} WHERE ($1::text IS NULL OR c.academic_year = $1) \
             ORDER BY c.academic_year, c.semester"
        );
        let rows = sqlx::query_as::<_, CohortRow>(&sql)
            .bind(academic_year)
            .fetch_all(&self.pool)
            .await?;
        collect_rows(rows)
    }

    async fn delete_cohort(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM semester_progression.cohorts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cohorts_for_student(&self, student_id: Uuid) -> Result<Vec<SemesterCohort>> {
        let sql = format!(
            "{COHORT_SELECT} WHERE c.status <> 'archived' AND EXISTS (\
               SELECT 1 FROM semester_progression.cohort_members m \
               WHERE m.cohort_id = c.id AND m.student_id = $1)"
        );
        let rows = sqlx::query_as::<_, CohortRow>(&sql)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await?;
        collect_rows(rows)
    }

    async fn add_to_roster(&self, cohort_id: Uuid, student_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO semester_progression.cohort_members (cohort_id, student_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(cohort_id)
        .bind(student_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_from_roster(&self, cohort_id: Uuid, student_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM semester_progression.cohort_members WHERE cohort_id = $1 AND student_id = $2",
        )
        .bind(cohort_id)
        .bind(student_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_progress(&self, record: &ProgressRecord) -> Result<()> {
        insert_progress_row(&self.pool, record).await
    }

    async fn save_progress(&self, record: &ProgressRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE semester_progression.progress_records
            SET grades = $2, average_grade = $3, attendance_rate = $4, overall_progress = $5,
                courses_completed = $6, courses_in_progress = $7, validation_criteria = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(Json(&record.grades))
        .bind(record.average_grade)
        .bind(record.attendance_rate)
        .bind(record.overall_progress)
        .bind(Json(&record.courses_completed))
        .bind(Json(&record.courses_in_progress))
        .bind(Json(&record.validation_criteria))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("progress record", record.id));
        }
        Ok(())
    }

    async fn get_progress(&self, id: Uuid) -> Result<Option<ProgressRecord>> {
        self.fetch_progress_where("WHERE id = $1", &[id]).await
    }

    async fn find_progress(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
    ) -> Result<Option<ProgressRecord>> {
        self.fetch_progress_where(
            "WHERE student_id = $1 AND cohort_id = $2 AND superseded_at IS NULL",
            &[student_id, cohort_id],
        )
        .await
    }

    async fn current_progress(&self, student_id: Uuid) -> Result<Option<ProgressRecord>> {
        self.fetch_progress_where(
            "WHERE student_id = $1 AND superseded_at IS NULL \
             ORDER BY current_semester DESC, created_at DESC",
            &[student_id],
        )
        .await
    }

    async fn list_progress(&self, filter: &ProgressFilter) -> Result<Vec<ProgressRecord>> {
        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM semester_progression.progress_records \
             WHERE ($1::uuid[] IS NULL OR cohort_id = ANY($1)) \
               AND ($2::text[] IS NULL OR validation_status = ANY($2)) \
               AND ($3 OR superseded_at IS NULL) \
             ORDER BY current_semester, created_at"
        );
        let statuses: Option<Vec<String>> = filter
            .statuses
            .as_ref()
            .map(|s| s.iter().map(|status| status.as_str().to_string()).collect());
        let rows = sqlx::query_as::<_, ProgressRow>(&sql)
            .bind(filter.cohort_ids.clone())
            .bind(statuses)
            .bind(filter.include_superseded)
            .fetch_all(&self.pool)
            .await?;
        collect_rows(rows)
    }

    async fn apply_validation(
        &self,
        record_id: Uuid,
        entry: &ValidationHistoryEntry,
        status: ValidationStatus,
        target_semester: Option<u8>,
    ) -> Result<ProgressRecord> {
        // A single statement: concurrent appends serialize on the row lock.
        let sql = format!(
            "UPDATE semester_progression.progress_records \
             SET validation_history = validation_history || jsonb_build_array($2::jsonb), \
                 validation_status = $3, target_semester = $4, updated_at = $5 \
             WHERE id = $1 RETURNING {PROGRESS_COLUMNS}"
        );
        sqlx::query_as::<_, ProgressRow>(&sql)
            .bind(record_id)
            .bind(Json(entry))
            .bind(status.as_str())
            .bind(target_semester.map(i16::from))
            .bind(entry.decided_at)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("progress record", record_id))?
            .try_into()
    }

    async fn mark_pending(
        &self,
        record_id: Uuid,
        next_validation_date: DateTime<Utc>,
    ) -> Result<ProgressRecord> {
        let sql = format!(
            "UPDATE semester_progression.progress_records \
             SET validation_status = 'pending_validation', target_semester = NULL, \
                 next_validation_date = $2, updated_at = NOW() \
             WHERE id = $1 RETURNING {PROGRESS_COLUMNS}"
        );
        sqlx::query_as::<_, ProgressRow>(&sql)
            .bind(record_id)
            .bind(next_validation_date)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("progress record", record_id))?
            .try_into()
    }

    async fn supersede_progress(&self, record_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE semester_progression.progress_records SET superseded_at = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(record_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_attendance(&self, record: &AttendanceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO semester_progression.attendance_records
            (event_id, student_id, cohort_id, attended, marked_by, marked_at, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (event_id, student_id) DO UPDATE
            SET cohort_id = EXCLUDED.cohort_id, attended = EXCLUDED.attended,
                marked_by = EXCLUDED.marked_by, marked_at = EXCLUDED.marked_at,
                notes = EXCLUDED.notes
            "#,
        )
        .bind(record.event_id)
        .bind(record.student_id)
        .bind(record.cohort_id)
        .bind(record.attended)
        .bind(record.marked_by)
        .bind(record.marked_at)
        .bind(&record.notes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attendance_for(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
    ) -> Result<Vec<AttendanceRecord>> {
        let rows: Vec<(Uuid, Uuid, Uuid, bool, Uuid, DateTime<Utc>, Option<String>)> =
            sqlx::query_as(
                r#"
                SELECT event_id, student_id, cohort_id, attended, marked_by, marked_at, notes
                FROM semester_progression.attendance_records
                WHERE student_id = $1 AND cohort_id = $2
                "#,
            )
            .bind(student_id)
            .bind(cohort_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(
                |(event_id, student_id, cohort_id, attended, marked_by, marked_at, notes)| {
                    AttendanceRecord {
                        event_id,
                        student_id,
                        cohort_id,
                        attended,
                        marked_by,
                        marked_at,
                        notes,
                    }
                },
            )
            .collect())
    }

    async fn open_enrollment(&self, entry: &EnrollmentHistoryEntry) -> Result<()> {
        insert_enrollment_row(&self.pool, entry).await
    }

    async fn close_enrollment(
        &self,
        student_id: Uuid,
        cohort_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        close_enrollment_row(&self.pool, student_id, cohort_id, at).await
    }

    async fn enrollment_history(&self, student_id: Uuid) -> Result<Vec<EnrollmentHistoryEntry>> {
        let rows = sqlx::query_as::<_, EnrollmentRow>(
            r#"
            SELECT id, student_id, cohort_id, semester, reason, enrolled_at, left_at
            FROM semester_progression.enrollment_history
            WHERE student_id = $1
            ORDER BY enrolled_at
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        collect_rows(rows)
    }

    async fn cohort_enrollments(&self, cohort_id: Uuid) -> Result<Vec<EnrollmentHistoryEntry>> {
        let rows = sqlx::query_as::<_, EnrollmentRow>(
            r#"
            SELECT id, student_id, cohort_id, semester, reason, enrolled_at, left_at
            FROM semester_progression.enrollment_history
            WHERE cohort_id = $1
            ORDER BY enrolled_at
            "#,
        )
        .bind(cohort_id)
        .fetch_all(&self.pool)
        .await?;
        collect_rows(rows)
    }

    /// Roster row and history entry commit together or not at all.
    async fn enroll_student(&self, entry: &EnrollmentHistoryEntry) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO semester_progression.cohort_members (cohort_id, student_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(entry.cohort_id)
        .bind(entry.student_id)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;
        if inserted {
            insert_enrollment_row(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Runs the whole move in one transaction; any failure rolls it back.
    async fn migrate_student(&self, migration: &Migration) -> Result<()> {
        let student_id = migration.student_id;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM semester_progression.cohort_members WHERE cohort_id = $1 AND student_id = $2",
        )
        .bind(migration.source_cohort_id)
        .bind(student_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO semester_progression.cohort_members (cohort_id, student_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(migration.destination_cohort_id)
        .bind(student_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE semester_progression.progress_records SET superseded_at = $2, updated_at = $2 WHERE id = $1",
        )
        .bind(migration.superseded_record_id)
        .bind(migration.at)
        .execute(&mut *tx)
        .await?;
        insert_progress_row(&mut *tx, &migration.new_record).await?;
        close_enrollment_row(&mut *tx, student_id, migration.source_cohort_id, migration.at).await?;
        insert_enrollment_row(&mut *tx, &migration.enrollment).await?;

        tx.commit().await?;
        debug!(%student_id, "migration committed");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_role(role: &str) -> Result<UserRole> {
    match role {
        "student" => Ok(UserRole::Student),
        "instructor" => Ok(UserRole::Instructor),
        "admin" => Ok(UserRole::Admin),
        other => Err(Error::Storage(format!("unknown user role '{other}'"))),
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn get_student(&self, id: Uuid) -> Result<Option<Student>> {
        let row: Option<(Uuid, String, String, String)> = sqlx::query_as(
            "SELECT id, full_name, email, role FROM semester_progression.students WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(id, full_name, email, role)| {
            Ok(Student {
                id,
                full_name,
                email,
                role: parse_role(&role)?,
            })
        })
        .transpose()
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        let row: Option<(Uuid, String, Option<Uuid>, DateTime<Utc>, Vec<Uuid>)> = sqlx::query_as(
            r#"
            SELECT ev.id, ev.title, ev.cohort_id, ev.starts_at,
                   ARRAY(SELECT p.student_id FROM semester_progression.event_participants p
                         WHERE p.event_id = ev.id) AS participants
            FROM semester_progression.events ev
            WHERE ev.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, title, cohort_id, starts_at, participants)| Event {
            id,
            title,
            cohort_id,
            starts_at,
            participants: participants.into_iter().collect(),
        }))
    }

    async fn set_event_cohort(&self, event_id: Uuid, cohort_id: Option<Uuid>) -> Result<()> {
        let result = sqlx::query("UPDATE semester_progression.events SET cohort_id = $2 WHERE id = $1")
            .bind(event_id)
            .bind(cohort_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("event", event_id));
        }
        Ok(())
    }

    async fn add_event_participants(&self, event_id: Uuid, student_ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO semester_progression.event_participants (event_id, student_id)
            SELECT $1, UNNEST($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(student_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_course(&self, id: Uuid) -> Result<Option<Course>> {
        let row: Option<(Uuid, String, i32, i32)> = sqlx::query_as(
            r#"
            SELECT id, title, total_chapters, total_exercises
            FROM semester_progression.courses
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, title, chapters, exercises)| Course {
            id,
            title,
            total_chapters: chapters.max(0) as u32,
            total_exercises: exercises.max(0) as u32,
        }))
    }
}
