use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, NaiveDate, Weekday};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

mod admin;
mod cache;
mod calendar;
mod config;
mod db;
mod eligibility;
mod engine;
mod error;
mod events;
mod forecast;
mod import;
mod logging;
mod models;
mod projector;
mod report;
mod store;

use crate::admin::{CalendarDraft, RecordedAttendance};
use crate::config::{Config, LogFormat};
use crate::engine::Engine;
use crate::models::{Course, HolidayType, WeeklyPattern};
use crate::store::{ReportStore, ScheduleStore};

#[derive(Parser)]
#[command(name = "attendance-forecast")]
#[command(about = "Attendance forecasting and exam eligibility for enrolled courses", long_about = None)]
struct Cli {
    /// Evaluate as of this date instead of today
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
    /// Override LOG_FORMAT
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load the sample semester and courses
    Seed,
    /// Replace the academic calendar from a JSON file
    SetCalendar {
        #[arg(long)]
        file: PathBuf,
    },
    /// Declare a single holiday
    AddHoliday {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "PUBLIC")]
        kind: HolidayType,
    },
    /// Declare every day in an inclusive range a holiday
    AddHolidayRange {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "ACADEMIC")]
        kind: HolidayType,
    },
    /// Import holidays from a CSV file with date,reason columns
    ImportHolidays {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Remove the holiday on a date
    RemoveHoliday {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Create or update a course enrolment
    AddCourse {
        #[arg(long)]
        id: Option<Uuid>,
        #[arg(long)]
        student: Uuid,
        #[arg(long)]
        code: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        start_date: Option<NaiveDate>,
    },
    /// Replace a course's weekly schedule, e.g. --session Tue=2 --session Thu=1
    SetSchedule {
        #[arg(long)]
        course: Uuid,
        #[arg(long = "session", value_parser = parse_session)]
        sessions: Vec<(Weekday, u32)>,
    },
    /// Record aggregate attendance counts for a course
    RecordAttendance {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        conducted: u32,
        #[arg(long)]
        attended: u32,
    },
    /// Mark attendance for one class date
    Mark {
        #[arg(long)]
        course: Uuid,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        absent: bool,
    },
    /// Import per-date marks from a CSV file with student_id,course_code,date,attended columns
    ImportMarks {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Delete a course with its schedule, history and report
    DeleteCourse {
        #[arg(long)]
        course: Uuid,
    },
    /// Recompute one course report, or every report when no course is given
    Recompute {
        #[arg(long)]
        course: Option<Uuid>,
    },
    /// Generate a markdown forecast for a student
    Report {
        #[arg(long)]
        student: Uuid,
        #[arg(long, default_value = "attendance.md")]
        out: PathBuf,
    },
    /// List scheduled class dates of a course so far
    ClassDates {
        #[arg(long)]
        course: Uuid,
    },
}

fn parse_session(value: &str) -> Result<(Weekday, u32), String> {
    let (day, count) = value
        .split_once('=')
        .ok_or_else(|| format!("expected DAY=COUNT, got `{value}`"))?;
    let weekday = day
        .trim()
        .parse::<Weekday>()
        .map_err(|_| format!("unknown weekday `{day}`"))?;
    let count = count
        .trim()
        .parse::<u32>()
        .map_err(|err| format!("invalid session count `{count}`: {err}"))?;
    Ok((weekday, count))
}

/// Writes back every report the command touched.
async fn persist_reports(pool: &PgPool, engine: &Engine) -> anyhow::Result<()> {
    let reports = engine.store().all()?;
    db::save_reports(pool, &reports).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    logging::setup_logging(&config, cli.log_format.unwrap_or(config.log_format));

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let today = cli.today.unwrap_or_else(|| Local::now().date_naive());

    if let Commands::InitDb = cli.command {
        db::init_db(&pool).await?;
        println!("Schema ready.");
        return Ok(());
    }

    let store = Arc::new(db::load_store(&pool).await?);
    let engine = Engine::new(store, config.policy());
    let registrar = engine.registrar();

    match cli.command {
        Commands::InitDb => {}
        Commands::Seed => {
            db::seed(&pool, &engine, today).await?;
            persist_reports(&pool, &engine).await?;
            println!("Seed data loaded.");
        }
        Commands::SetCalendar { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let draft: CalendarDraft = serde_json::from_str(&raw).context("invalid calendar file")?;
            let calendar = registrar.save_calendar(draft)?;
            db::save_calendar(&pool, &calendar, engine.snapshot()?.generation).await?;
            println!(
                "Calendar {} active from {} to {} with {} milestones.",
                calendar.id,
                calendar.semester_start,
                calendar.exam_window_start,
                calendar.milestones.len()
            );
        }
        Commands::AddHoliday { date, reason, kind } => {
            let holiday = registrar.add_holiday(date, &reason, kind)?;
            db::insert_holidays(&pool, &[holiday], engine.snapshot()?.generation).await?;
            println!("Holiday added on {}.", date);
        }
        Commands::AddHolidayRange {
            start,
            end,
            reason,
            kind,
        } => {
            let added = registrar.add_holiday_range(start, end, &reason, kind)?;
            if !added.is_empty() {
                db::insert_holidays(&pool, &added, engine.snapshot()?.generation).await?;
            }
            println!("Added {} holidays between {} and {}.", added.len(), start, end);
        }
        Commands::ImportHolidays { csv } => {
            let file = std::fs::File::open(&csv).with_context(|| format!("failed to open {}", csv.display()))?;
            let added = registrar.bulk_add_holidays(import::read_holidays(file)?)?;
            if !added.is_empty() {
                db::insert_holidays(&pool, &added, engine.snapshot()?.generation).await?;
            }
            println!("Imported {} holidays.", added.len());
        }
        Commands::RemoveHoliday { date } => {
            let holiday = registrar.delete_holiday(date)?;
            db::delete_holiday(&pool, date, engine.snapshot()?.generation).await?;
            println!("Removed holiday on {} ({}).", holiday.date, holiday.reason);
        }
        Commands::AddCourse {
            id,
            student,
            code,
            name,
            start_date,
        } => {
            let course = Course {
                id: id.unwrap_or_else(Uuid::new_v4),
                student_id: student,
                code,
                name,
                start_date,
            };
            db::save_course(&pool, &course).await?;
            println!("Course {} saved as {}.", course.code, course.id);
            registrar.save_course(course)?;
            persist_reports(&pool, &engine).await?;
        }
        Commands::SetSchedule { course, sessions } => {
            let pattern = WeeklyPattern::from_entries(sessions)?;
            registrar.set_weekly_pattern(course, pattern)?;
            db::save_pattern(&pool, course, &pattern).await?;
            println!("Schedule updated for {}.", course);
        }
        Commands::RecordAttendance {
            course,
            conducted,
            attended,
        } => {
            let recorded = registrar.record_aggregate(course, conducted, attended, today)?;
            save_attendance(&pool, &engine, course, recorded).await?;
        }
        Commands::Mark { course, date, absent } => {
            let recorded = registrar.record_dated(course, BTreeMap::from([(date, !absent)]), today)?;
            save_attendance(&pool, &engine, course, recorded).await?;
        }
        Commands::ImportMarks { csv } => {
            let file = std::fs::File::open(&csv).with_context(|| format!("failed to open {}", csv.display()))?;
            let imported = import::read_marks(file, engine.store())?;
            let recorded = registrar.import_marks(imported.marks, today)?;
            let histories: Vec<_> = recorded.iter().map(|(course, r)| (*course, &r.history)).collect();
            db::save_histories(&pool, &histories).await?;
            persist_reports(&pool, &engine).await?;
            println!(
                "Imported marks for {} courses ({} rows without a matching course).",
                recorded.len(),
                imported.unmatched
            );
            for (course, outcome) in &recorded {
                if let Err(err) = &outcome.forecast {
                    println!("- {}: forecast not refreshed: {}", course, err);
                }
            }
        }
        Commands::DeleteCourse { course } => {
            let deleted = registrar.delete_course(course)?;
            db::delete_course(&pool, course).await?;
            println!("Deleted {} ({}).", deleted.code, deleted.id);
        }
        Commands::Recompute { course: Some(course) } => {
            let before = engine.cache().state(course)?;
            match engine.cache().recompute(course, today)? {
                Some(report) => println!(
                    "{}: {} (report was {})",
                    report.course_code,
                    report.status().as_str(),
                    before.as_str()
                ),
                None => println!("No attendance recorded for {}.", course),
            }
            persist_reports(&pool, &engine).await?;
        }
        Commands::Recompute { course: None } => {
            let summary = engine.sweep(today).await?;
            persist_reports(&pool, &engine).await?;
            println!(
                "Recomputed {} reports, skipped {} without attendance, {} failed.",
                summary.recomputed, summary.skipped, summary.failed
            );
            for course in summary.failed_courses {
                println!("- failed: {}", course);
            }
        }
        Commands::Report { student, out } => {
            let forecast = engine.reports_for_student(student, today)?;
            persist_reports(&pool, &engine).await?;
            let markdown = report::build_report(student, today, &forecast);
            std::fs::write(&out, markdown)?;
            println!("Report written to {}.", out.display());
            for (course, err) in &forecast.failures {
                println!("- {} could not be forecast: {}", course.code, err);
            }
        }
        Commands::ClassDates { course } => {
            let dates = engine.class_dates(course, today)?;
            if dates.is_empty() {
                println!("No class dates so far.");
            }
            for line in report::class_date_lines(&dates) {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

/// Persists an applied attendance write, then surfaces a failed refresh.
async fn save_attendance(
    pool: &PgPool,
    engine: &Engine,
    course_id: Uuid,
    recorded: RecordedAttendance,
) -> anyhow::Result<()> {
    db::save_history(pool, course_id, &recorded.history).await?;
    persist_reports(pool, engine).await?;
    recorded
        .forecast
        .context("attendance saved, but the forecast could not be refreshed")?;
    print_course_status(engine, course_id)
}

fn print_course_status(engine: &Engine, course_id: Uuid) -> anyhow::Result<()> {
    let course = engine
        .store()
        .course(course_id)?
        .context("course disappeared while recording attendance")?;
    let Some(report) = engine.store().get(course_id)? else {
        println!("{}: attendance recorded, no forecast available.", course.code);
        return Ok(());
    };
    println!(
        "{}: {:.2}% attended, {} at 75%, {} sessions remaining.",
        course.code,
        report.current_percentage,
        report.status().as_str(),
        report.future_sessions
    );
    if let Some(milestone) = &report.milestone {
        println!(
            "{}: {:.0}% projected by {} on {}.",
            course.code,
            milestone.projected_percentage(),
            milestone.kind,
            milestone.start
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_arguments_parse() {
        assert_eq!(parse_session("Tue=2"), Ok((Weekday::Tue, 2)));
        assert_eq!(parse_session("thursday = 1"), Ok((Weekday::Thu, 1)));
        assert!(parse_session("Tue").is_err());
        assert!(parse_session("Tue=two").is_err());
    }

    #[test]
    fn cli_parses_global_date() {
        let cli = Cli::try_parse_from([
            "attendance-forecast",
            "recompute",
            "--today",
            "2026-10-14",
        ])
        .unwrap();
        assert_eq!(cli.today, NaiveDate::from_ymd_opt(2026, 10, 14));
        assert!(matches!(cli.command, Commands::Recompute { course: None }));
    }
}
