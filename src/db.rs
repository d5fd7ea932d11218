use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::attendance::AttendanceLedger;
use crate::config::Settings;
use crate::models::{AttendanceMark, CallerContext, CallerRole};
use crate::registry::CohortRegistry;
use crate::semester::SemesterService;
use crate::store::{PgDirectory, PgStore};

pub async fn connect(settings: &Settings) -> anyhow::Result<PgPool> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Loads a small catalog: students, courses, one S1 lecture and the S1-S10
/// cohorts of `academic_year`, with the students enrolled in S1.
pub async fn seed(pool: &PgPool, settings: Arc<Settings>, academic_year: &str) -> anyhow::Result<()> {
    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Avery Lee",
            "avery.lee@groupscholar.com",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Jules Moreno",
            "jules.moreno@groupscholar.com",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Kiara Patel",
            "kiara.patel@groupscholar.com",
        ),
    ];

    for (id, name, email) in &students {
        sqlx::query(
            r#"
            INSERT INTO semester_progression.students (id, full_name, email, role)
            VALUES ($1, $2, $3, 'student')
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .execute(pool)
        .await?;
    }

    let courses = vec![
        (
            Uuid::parse_str("6b1c2f0e-8f7a-4f43-9d0a-1f5a3c7b9e21")?,
            "Foundations of Programming",
            12,
            40,
        ),
        (
            Uuid::parse_str("a4e9d3b2-5c61-4b8e-a7f0-2d9c8e1b6f53")?,
            "Discrete Mathematics",
            10,
            30,
        ),
    ];

    for (id, title, chapters, exercises) in courses {
        sqlx::query(
            r#"
            INSERT INTO semester_progression.courses (id, title, total_chapters, total_exercises)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title,
                total_chapters = EXCLUDED.total_chapters,
                total_exercises = EXCLUDED.total_exercises
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(chapters)
        .bind(exercises)
        .execute(pool)
        .await?;
    }

    let store = Arc::new(PgStore::new(pool.clone()));
    let directory = Arc::new(PgDirectory::new(pool.clone()));
    let registry = CohortRegistry::new(store.clone(), directory.clone(), settings.clone());
    let report = registry.initialize_semesters(academic_year).await?;
    if let Some(failure) = report.failed.first() {
        anyhow::bail!("failed to initialize S{}: {}", failure.semester, failure.error);
    }

    let s1 = registry
        .get_all_semesters(Some(academic_year))
        .await?
        .into_iter()
        .find(|summary| summary.semester == 1)
        .context("S1 cohort missing after initialization")?;

    let lecture_id = Uuid::parse_str("f0c4a8e2-3b7d-4c19-8e5a-9d2b6f1c7a30")?;
    let starts_at = Utc
        .with_ymd_and_hms(2026, 9, 7, 9, 0, 0)
        .single()
        .context("invalid seed date")?;
    sqlx::query(
        r#"
        INSERT INTO semester_progression.events (id, title, cohort_id, starts_at)
        VALUES ($1, $2, NULL, $3)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(lecture_id)
    .bind("Orientation Lecture")
    .bind(starts_at)
    .execute(pool)
    .await?;
    registry.link_event(s1.cohort_id, lecture_id).await?;

    let service = SemesterService::new(store, directory, settings);
    let ids: Vec<Uuid> = students.iter().map(|(id, _, _)| *id).collect();
    let assignment = service.assign_new_students_to_s1(&ids, academic_year).await?;
    for failure in &assignment.failed {
        warn!(student_id = %failure.id, error = %failure.error, "seed student not assigned");
    }

    info!(
        cohorts_created = report.created,
        assigned = assignment.assigned.len(),
        "seed data loaded"
    );
    Ok(())
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    pub events: usize,
    pub marked: usize,
    pub failed: usize,
}

/// Imports attendance rows and applies them per event through the ledger.
pub async fn import_attendance_csv(
    pool: &PgPool,
    csv_path: &Path,
    caller: &CallerContext,
) -> anyhow::Result<ImportSummary> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        event_id: Uuid,
        student_id: Uuid,
        attended: bool,
        marked_by: Option<Uuid>,
        notes: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("cannot open {}", csv_path.display()))?;
    // Grouped by (event, marker) so every row keeps the identity that marked it.
    let mut batches: BTreeMap<(Uuid, Uuid), Vec<AttendanceMark>> = BTreeMap::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let marker = row.marked_by.unwrap_or(caller.caller_id);
        batches
            .entry((row.event_id, marker))
            .or_default()
            .push(AttendanceMark {
                student_id: row.student_id,
                attended: row.attended,
                notes: row.notes.filter(|n| !n.trim().is_empty()),
            });
    }

    let store = Arc::new(PgStore::new(pool.clone()));
    let directory = Arc::new(PgDirectory::new(pool.clone()));
    let ledger = AttendanceLedger::new(store, directory);
    let mut summary = ImportSummary::default();
    let mut events = std::collections::BTreeSet::new();

    for ((event_id, marker), marks) in batches {
        events.insert(event_id);
        let marker = CallerContext::new(marker, CallerRole::Staff);
        let cohort_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT cohort_id FROM semester_progression.events WHERE id = $1",
        )
        .bind(event_id)
        .fetch_optional(pool)
        .await?
        .flatten();

        let Some(cohort_id) = cohort_id else {
            warn!(%event_id, rows = marks.len(), "event has no cohort, rows skipped");
            summary.failed += marks.len();
            continue;
        };

        let result = ledger
            .bulk_mark_attendance(&marker, event_id, cohort_id, &marks)
            .await?;
        for failure in &result.failed {
            warn!(%event_id, student_id = %failure.id, error = %failure.error, "row rejected");
        }
        summary.marked += result.marked.len();
        summary.failed += result.failed.len();
    }
    summary.events = events.len();

    Ok(summary)
}
