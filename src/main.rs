use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use semester_progression::attendance::AttendanceLedger;
use semester_progression::config::Settings;
use semester_progression::criteria::CriteriaOverride;
use semester_progression::db;
use semester_progression::models::{CallerContext, CallerRole, ValidationDecision};
use semester_progression::registry::CohortRegistry;
use semester_progression::report;
use semester_progression::risk::{self, RiskThresholds};
use semester_progression::semester::SemesterService;
use semester_progression::store::{Directory, PgDirectory, PgStore, ProgressFilter, Store};
use semester_progression::validation::ValidationEngine;

#[derive(Parser)]
#[command(name = "semester-progression")]
#[command(about = "Semester progression and validation engine for Group Scholar", long_about = None)]
struct Cli {
    /// Optional TOML settings file; environment variables override it
    #[arg(long, global = true, env = "SEMESTER_PROGRESSION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load seed students, courses and the semester catalog
    Seed {
        #[arg(long)]
        year: Option<String>,
    },
    /// Make sure S1-S10 exist for an academic year
    InitSemesters {
        #[arg(long)]
        year: Option<String>,
    },
    /// Import attendance marks from a CSV file
    ImportAttendance {
        #[arg(long)]
        csv: PathBuf,
        /// Marker recorded for rows without a marked_by column
        #[arg(long)]
        marked_by: Uuid,
    },
    /// Evaluate one student against the validation criteria
    Evaluate {
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        min_grade: Option<f64>,
        #[arg(long)]
        min_attendance: Option<f64>,
        #[arg(long)]
        courses_required: Option<u32>,
    },
    /// Record a validation decision for several students
    Validate {
        #[arg(long, value_delimiter = ',', required = true)]
        students: Vec<Uuid>,
        #[arg(long)]
        decision: ValidationDecision,
        #[arg(long)]
        validator: Uuid,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Approve pending students of auto-validating cohorts who meet the criteria
    AutoValidate,
    /// Queue students for validation
    Flag {
        #[arg(long = "cohort", value_delimiter = ',')]
        cohorts: Vec<Uuid>,
    },
    /// Move validated students to their next semester
    Progress,
    /// Enroll new students in S1
    AssignS1 {
        #[arg(long, value_delimiter = ',', required = true)]
        students: Vec<Uuid>,
        #[arg(long)]
        year: Option<String>,
    },
    /// Print cohort statistics as JSON
    Stats {
        #[arg(long)]
        year: Option<String>,
    },
    /// Print validation insights as JSON
    Insights {
        #[arg(long)]
        cohort: Option<Uuid>,
    },
    /// Check the semester catalog of the current academic year
    Health,
    /// List students below the risk thresholds
    AtRisk {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        year: Option<String>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Arc::new(Settings::load(cli.config.as_deref()).context("invalid settings")?);
    let pool = db::connect(&settings).await?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let directory: Arc<dyn Directory> = Arc::new(PgDirectory::new(pool.clone()));
    let registry = CohortRegistry::new(store.clone(), directory.clone(), settings.clone());
    let engine = ValidationEngine::new(store.clone(), settings.clone());
    let service = SemesterService::new(store.clone(), directory.clone(), settings.clone());
    let current_year = |year: Option<String>| {
        year.unwrap_or_else(|| settings.academic_year_for(Utc::now().date_naive()))
    };

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { year } => {
            let year = current_year(year);
            db::seed(&pool, settings.clone(), &year).await?;
            println!("Seed data inserted for {year}.");
        }
        Commands::InitSemesters { year } => {
            let year = current_year(year);
            let report = registry.initialize_semesters(&year).await?;
            println!(
                "{year}: {} created, {} updated, {} unchanged.",
                report.created, report.updated, report.unchanged
            );
            for failure in &report.failed {
                println!("- S{} failed: {}", failure.semester, failure.error);
            }
        }
        Commands::ImportAttendance { csv, marked_by } => {
            let caller = CallerContext::new(marked_by, CallerRole::Staff);
            let summary = db::import_attendance_csv(&pool, &csv, &caller).await?;
            println!(
                "Marked {} rows across {} events from {} ({} rejected).",
                summary.marked,
                summary.events,
                csv.display(),
                summary.failed
            );
        }
        Commands::Evaluate {
            student,
            min_grade,
            min_attendance,
            courses_required,
        } => {
            let overrides = CriteriaOverride {
                min_grade,
                min_attendance,
                courses_required,
                ..Default::default()
            };
            let overrides = (!overrides.is_empty()).then_some(&overrides);
            let result = engine.evaluate(student, overrides).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Validate {
            students,
            decision,
            validator,
            reason,
            notes,
        } => {
            let caller = CallerContext::new(validator, CallerRole::Staff);
            let result = engine
                .perform_bulk_validation(&caller, &students, decision, reason, notes, None)
                .await?;
            println!(
                "{} approved, {} conditional, {} rejected, {} errors.",
                result.summary.approved,
                result.summary.conditional,
                result.summary.rejected,
                result.summary.errors
            );
            for failure in &result.failed {
                println!("- {}: {}", failure.id, failure.error);
            }
        }
        Commands::AutoValidate => {
            let result = engine.process_auto_validations().await?;
            println!(
                "Auto-validated {} students ({} errors).",
                result.summary.approved, result.summary.errors
            );
        }
        Commands::Flag { cohorts } => {
            let scope = (!cohorts.is_empty()).then_some(cohorts.as_slice());
            let report = service.flag_students_for_validation(scope).await?;
            println!(
                "Flagged {} students, {} already in review, {} errors.",
                report.flagged,
                report.skipped,
                report.failed.len()
            );
        }
        Commands::Progress => {
            let report = service.progress_validated_students().await?;
            for progression in &report.progressed {
                println!(
                    "- {}: S{} -> S{}",
                    progression.student_id, progression.from_semester, progression.to_semester
                );
            }
            for skipped in &report.skipped {
                println!("- {} skipped: {}", skipped.student_id, skipped.reason);
            }
            for failure in &report.failed {
                println!("- {} failed: {}", failure.id, failure.error);
            }
            println!(
                "{} progressed, {} skipped, {} failed.",
                report.progressed.len(),
                report.skipped.len(),
                report.failed.len()
            );
        }
        Commands::AssignS1 { students, year } => {
            let year = current_year(year);
            let report = service.assign_new_students_to_s1(&students, &year).await?;
            println!(
                "Assigned {} students to S1 {year}, {} already enrolled, {} failed.",
                report.assigned.len(),
                report.already_enrolled.len(),
                report.failed.len()
            );
            for failure in &report.failed {
                println!("- {}: {}", failure.id, failure.error);
            }
        }
        Commands::Stats { year } => {
            let statistics = registry.get_statistics(year.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&statistics)?);
        }
        Commands::Insights { cohort } => {
            let insights = engine.get_validation_insights(cohort).await?;
            println!("{}", serde_json::to_string_pretty(&insights)?);
        }
        Commands::Health => {
            let health = service.perform_health_check().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::AtRisk { limit } => {
            let records = store.list_progress(&ProgressFilter::active()).await?;
            let at_risk = risk::find_at_risk(&records, RiskThresholds::from_settings(&settings));

            if at_risk.is_empty() {
                println!("No students below the risk thresholds.");
                return Ok(());
            }

            println!("Students at risk:");
            for student in at_risk.iter().take(limit) {
                println!(
                    "- {} S{} severity {:.2}: progress {:.1}%, attendance {:.1}%",
                    student.student_id,
                    student.current_semester,
                    student.severity,
                    student.overall_progress,
                    student.attendance_rate
                );
            }
        }
        Commands::Report { year, out } => {
            let year = current_year(year);
            let statistics = registry.get_statistics(Some(&year)).await?;
            let insights = engine.get_validation_insights(None).await?;
            let cohort_ids = statistics.semesters.iter().map(|s| s.cohort_id).collect();
            let records = store
                .list_progress(&ProgressFilter::active().in_cohorts(cohort_ids))
                .await?;
            let at_risk = risk::find_at_risk(&records, RiskThresholds::from_settings(&settings));

            let mut students = HashMap::new();
            for entry in &at_risk {
                if let Some(student) = directory.get_student(entry.student_id).await? {
                    students.insert(student.id, student);
                }
            }

            let report = report::build_report(
                Utc::now().date_naive(),
                &statistics,
                &insights,
                &at_risk,
                &students,
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
