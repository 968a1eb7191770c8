use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use chrono::{NaiveDate, Weekday};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::admin::CalendarDraft;
use crate::engine::Engine;
use crate::models::{
    AcademicCalendar, AttendanceHistory, AttendanceReport, CalendarSnapshot, Course, Holiday, HolidayType,
    Milestone, MilestoneKind, WeeklyPattern,
};
use crate::store::{MemoryStore, ReportStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn to_i64(value: u64) -> anyhow::Result<i64> {
    i64::try_from(value).context("value does not fit a BIGINT column")
}

fn to_i32(value: u32) -> anyhow::Result<i32> {
    i32::try_from(value).context("value does not fit an INTEGER column")
}

fn from_i32(value: i32, column: &str) -> anyhow::Result<u32> {
    u32::try_from(value).with_context(|| format!("negative value in {column}"))
}

/// Reads every table into a fresh in-memory store.
pub async fn load_store(pool: &PgPool) -> anyhow::Result<MemoryStore> {
    let store = MemoryStore::new();
    store.load_snapshot(load_snapshot(pool).await?);

    let courses = load_courses(pool).await?;
    let course_count = courses.len();
    for course in courses {
        store.put_course(course);
    }
    for (course_id, pattern) in load_patterns(pool).await? {
        store.set_pattern(course_id, pattern);
    }
    for (course_id, history) in load_histories(pool).await? {
        store.set_history(course_id, history);
    }
    let reports = load_reports(pool).await?;
    let report_count = reports.len();
    for report in reports {
        store.upsert(report)?;
    }

    info!(courses = course_count, reports = report_count, "Loaded engine state");
    Ok(store)
}

async fn load_snapshot(pool: &PgPool) -> anyhow::Result<CalendarSnapshot> {
    let generation: i64 = sqlx::query("SELECT calendar_generation FROM attendance_forecast.engine_state WHERE id")
        .fetch_optional(pool)
        .await?
        .map(|row| row.get("calendar_generation"))
        .unwrap_or(0);

    let calendar_row = sqlx::query(
        r#"
        SELECT id, academic_year, semester_start, exam_window_start
        FROM attendance_forecast.academic_calendar
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    let calendar = match calendar_row {
        Some(row) => {
            let id: i64 = row.get("id");
            let mut milestones = Vec::new();
            for milestone in sqlx::query(
                "SELECT kind, start_date, end_date FROM attendance_forecast.milestones \
                 WHERE calendar_id = $1 ORDER BY start_date",
            )
            .bind(id)
            .fetch_all(pool)
            .await?
            {
                let kind: String = milestone.get("kind");
                milestones.push(Milestone {
                    kind: kind.parse::<MilestoneKind>()?,
                    start: milestone.get("start_date"),
                    end: milestone.get("end_date"),
                });
            }
            Some(AcademicCalendar::new(
                id,
                row.get("academic_year"),
                row.get("semester_start"),
                row.get("exam_window_start"),
                milestones,
            )?)
        }
        None => None,
    };

    let mut holidays = BTreeMap::new();
    for row in sqlx::query(
        "SELECT holiday_date, reason, holiday_type, calendar_id FROM attendance_forecast.holidays",
    )
    .fetch_all(pool)
    .await?
    {
        let date: NaiveDate = row.get("holiday_date");
        let kind: String = row.get("holiday_type");
        holidays.insert(
            date,
            Holiday {
                date,
                reason: row.get("reason"),
                kind: kind.parse::<HolidayType>()?,
                calendar_id: row.get("calendar_id"),
            },
        );
    }

    Ok(CalendarSnapshot {
        generation: u64::try_from(generation).context("negative calendar generation")?,
        calendar,
        holidays,
    })
}

async fn load_courses(pool: &PgPool) -> anyhow::Result<Vec<Course>> {
    let rows = sqlx::query("SELECT id, student_id, code, name, start_date FROM attendance_forecast.courses")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .map(|row| Course {
            id: row.get("id"),
            student_id: row.get("student_id"),
            code: row.get("code"),
            name: row.get("name"),
            start_date: row.get("start_date"),
        })
        .collect())
}

async fn load_patterns(pool: &PgPool) -> anyhow::Result<HashMap<Uuid, WeeklyPattern>> {
    let rows = sqlx::query("SELECT course_id, weekday, sessions FROM attendance_forecast.weekly_sessions")
        .fetch_all(pool)
        .await?;

    let mut entries: HashMap<Uuid, Vec<(Weekday, u32)>> = HashMap::new();
    for row in rows {
        let weekday: String = row.get("weekday");
        let weekday = weekday
            .parse::<Weekday>()
            .map_err(|_| anyhow::anyhow!("unknown weekday `{weekday}`"))?;
        let sessions = from_i32(row.get("sessions"), "weekly_sessions.sessions")?;
        entries.entry(row.get("course_id")).or_default().push((weekday, sessions));
    }

    let mut patterns = HashMap::new();
    for (course_id, entries) in entries {
        patterns.insert(course_id, WeeklyPattern::from_entries(entries)?);
    }
    Ok(patterns)
}

async fn load_histories(pool: &PgPool) -> anyhow::Result<HashMap<Uuid, AttendanceHistory>> {
    let mut histories = HashMap::new();

    for row in sqlx::query("SELECT course_id, conducted, attended FROM attendance_forecast.attendance_aggregate")
        .fetch_all(pool)
        .await?
    {
        histories.insert(
            row.get("course_id"),
            AttendanceHistory::Aggregate {
                conducted: from_i32(row.get("conducted"), "attendance_aggregate.conducted")?,
                attended: from_i32(row.get("attended"), "attendance_aggregate.attended")?,
            },
        );
    }

    let mut marks: HashMap<Uuid, BTreeMap<NaiveDate, bool>> = HashMap::new();
    for row in sqlx::query("SELECT course_id, class_date, attended FROM attendance_forecast.attendance_marks")
        .fetch_all(pool)
        .await?
    {
        marks
            .entry(row.get("course_id"))
            .or_default()
            .insert(row.get("class_date"), row.get("attended"));
    }
    for (course_id, records) in marks {
        histories.insert(course_id, AttendanceHistory::Dated { records });
    }

    Ok(histories)
}

async fn load_reports(pool: &PgPool) -> anyhow::Result<Vec<AttendanceReport>> {
    let rows = sqlx::query(
        "SELECT payload::text AS payload, stale, calendar_generation FROM attendance_forecast.attendance_reports",
    )
    .fetch_all(pool)
    .await?;

    let mut reports = Vec::with_capacity(rows.len());
    for row in rows {
        let payload: String = row.get("payload");
        let mut report: AttendanceReport =
            serde_json::from_str(&payload).context("failed to decode stored attendance report")?;
        // The columns are what invalidation updates.
        report.stale = row.get("stale");
        let generation: i64 = row.get("calendar_generation");
        report.calendar_generation = u64::try_from(generation).context("negative report generation")?;
        reports.push(report);
    }
    Ok(reports)
}

/// Records the new generation and flags every stored report stale.
async fn invalidate_reports(tx: &mut Transaction<'_, Postgres>, generation: u64) -> anyhow::Result<u64> {
    sqlx::query("UPDATE attendance_forecast.engine_state SET calendar_generation = $1 WHERE id")
        .bind(to_i64(generation)?)
        .execute(&mut **tx)
        .await?;
    let result = sqlx::query("UPDATE attendance_forecast.attendance_reports SET stale = TRUE WHERE NOT stale")
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

pub async fn save_calendar(pool: &PgPool, calendar: &AcademicCalendar, generation: u64) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM attendance_forecast.academic_calendar")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO attendance_forecast.academic_calendar
        (id, academic_year, semester_start, exam_window_start)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(calendar.id)
    .bind(&calendar.academic_year)
    .bind(calendar.semester_start)
    .bind(calendar.exam_window_start)
    .execute(&mut *tx)
    .await?;

    for milestone in &calendar.milestones {
        sqlx::query(
            r#"
            INSERT INTO attendance_forecast.milestones (calendar_id, kind, start_date, end_date)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(calendar.id)
        .bind(milestone.kind.label())
        .bind(milestone.start)
        .bind(milestone.end)
        .execute(&mut *tx)
        .await?;
    }

    let marked = invalidate_reports(&mut tx, generation).await?;
    tx.commit().await?;
    info!(calendar_id = calendar.id, generation, marked, "Stored academic calendar");
    Ok(())
}

pub async fn insert_holidays(pool: &PgPool, holidays: &[Holiday], generation: u64) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for holiday in holidays {
        sqlx::query(
            r#"
            INSERT INTO attendance_forecast.holidays (holiday_date, reason, holiday_type, calendar_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (holiday_date) DO NOTHING
            "#,
        )
        .bind(holiday.date)
        .bind(&holiday.reason)
        .bind(holiday.kind.as_str())
        .bind(holiday.calendar_id)
        .execute(&mut *tx)
        .await?;
    }
    invalidate_reports(&mut tx, generation).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn delete_holiday(pool: &PgPool, date: NaiveDate, generation: u64) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM attendance_forecast.holidays WHERE holiday_date = $1")
        .bind(date)
        .execute(&mut *tx)
        .await?;
    invalidate_reports(&mut tx, generation).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn save_course(pool: &PgPool, course: &Course) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO attendance_forecast.courses (id, student_id, code, name, start_date)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO UPDATE
        SET student_id = EXCLUDED.student_id, code = EXCLUDED.code,
            name = EXCLUDED.name, start_date = EXCLUDED.start_date
        "#,
    )
    .bind(course.id)
    .bind(course.student_id)
    .bind(&course.code)
    .bind(&course.name)
    .bind(course.start_date)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save_pattern(pool: &PgPool, course_id: Uuid, pattern: &WeeklyPattern) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM attendance_forecast.weekly_sessions WHERE course_id = $1")
        .bind(course_id)
        .execute(&mut *tx)
        .await?;
    for (weekday, sessions) in pattern.entries() {
        sqlx::query(
            "INSERT INTO attendance_forecast.weekly_sessions (course_id, weekday, sessions) VALUES ($1, $2, $3)",
        )
        .bind(course_id)
        .bind(weekday.to_string())
        .bind(to_i32(sessions)?)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("UPDATE attendance_forecast.attendance_reports SET stale = TRUE WHERE course_id = $1")
        .bind(course_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Replaces whichever history representation was stored and flags the
/// course report stale until a new one is saved.
async fn write_history(
    tx: &mut Transaction<'_, Postgres>,
    course_id: Uuid,
    history: &AttendanceHistory,
) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM attendance_forecast.attendance_aggregate WHERE course_id = $1")
        .bind(course_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM attendance_forecast.attendance_marks WHERE course_id = $1")
        .bind(course_id)
        .execute(&mut **tx)
        .await?;

    match history {
        AttendanceHistory::Aggregate { conducted, attended } => {
            sqlx::query(
                r#"
                INSERT INTO attendance_forecast.attendance_aggregate (course_id, conducted, attended)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(course_id)
            .bind(to_i32(*conducted)?)
            .bind(to_i32(*attended)?)
            .execute(&mut **tx)
            .await?;
        }
        AttendanceHistory::Dated { records } => {
            for (date, attended) in records {
                sqlx::query(
                    r#"
                    INSERT INTO attendance_forecast.attendance_marks (course_id, class_date, attended)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(course_id)
                .bind(*date)
                .bind(*attended)
                .execute(&mut **tx)
                .await?;
            }
        }
    }

    sqlx::query("UPDATE attendance_forecast.attendance_reports SET stale = TRUE WHERE course_id = $1")
        .bind(course_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

pub async fn save_history(pool: &PgPool, course_id: Uuid, history: &AttendanceHistory) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    write_history(&mut tx, course_id, history).await?;
    tx.commit().await?;
    Ok(())
}

/// Writes several histories in one transaction.
pub async fn save_histories(pool: &PgPool, histories: &[(Uuid, &AttendanceHistory)]) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;
    for (course_id, history) in histories {
        write_history(&mut tx, *course_id, history).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Course rows cascade to schedule, history and report.
pub async fn delete_course(pool: &PgPool, course_id: Uuid) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM attendance_forecast.courses WHERE id = $1")
        .bind(course_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn save_reports(pool: &PgPool, reports: &[AttendanceReport]) -> anyhow::Result<usize> {
    let mut tx = pool.begin().await?;
    for report in reports {
        let payload = serde_json::to_string(report).context("failed to encode attendance report")?;
        sqlx::query(
            r#"
            INSERT INTO attendance_forecast.attendance_reports
            (course_id, student_id, calendar_generation, status, stale, payload, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7)
            ON CONFLICT (course_id) DO UPDATE
            SET student_id = EXCLUDED.student_id,
                calendar_generation = EXCLUDED.calendar_generation,
                status = EXCLUDED.status,
                stale = EXCLUDED.stale,
                payload = EXCLUDED.payload,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(report.course_id)
        .bind(report.student_id)
        .bind(to_i64(report.calendar_generation)?)
        .bind(report.status().as_str())
        .bind(report.stale)
        .bind(payload)
        .bind(report.computed_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(reports.len())
}

fn seed_date(y: i32, m: u32, d: u32) -> anyhow::Result<NaiveDate> {
    NaiveDate::from_ymd_opt(y, m, d).context("invalid date")
}

/// Loads the 2026 fall semester with a handful of enrolled courses.
pub async fn seed(pool: &PgPool, engine: &Engine, today: NaiveDate) -> anyhow::Result<()> {
    let registrar = engine.registrar();

    let draft = CalendarDraft {
        academic_year: Some("2026-27".to_string()),
        semester_start: seed_date(2026, 7, 14)?,
        exam_window_start: seed_date(2026, 11, 21)?,
        milestones: vec![
            Milestone {
                kind: MilestoneKind::Cat1,
                start: seed_date(2026, 8, 25)?,
                end: seed_date(2026, 8, 29)?,
            },
            Milestone {
                kind: MilestoneKind::Cat2,
                start: seed_date(2026, 10, 6)?,
                end: seed_date(2026, 10, 10)?,
            },
            Milestone {
                kind: MilestoneKind::Fat,
                start: seed_date(2026, 11, 24)?,
                end: seed_date(2026, 12, 5)?,
            },
        ],
    };

    let snapshot = engine.snapshot()?;
    let already_seeded = snapshot.calendar.as_ref().is_some_and(|c| {
        c.semester_start == draft.semester_start
            && c.exam_window_start == draft.exam_window_start
            && c.milestones == draft.milestones
    });
    if !already_seeded {
        let calendar = registrar.save_calendar(draft)?;
        save_calendar(pool, &calendar, engine.snapshot()?.generation).await?;
    }

    let holidays = [
        (seed_date(2026, 8, 15)?, "Independence Day", HolidayType::Public),
        (seed_date(2026, 10, 2)?, "Gandhi Jayanti", HolidayType::Public),
        (seed_date(2026, 10, 20)?, "Dussehra", HolidayType::Public),
        (seed_date(2026, 11, 10)?, "Diwali", HolidayType::Public),
    ];
    let mut added = Vec::new();
    for (date, reason, kind) in holidays {
        added.extend(registrar.add_holiday_range(date, date, reason, kind)?);
    }
    if !added.is_empty() {
        insert_holidays(pool, &added, engine.snapshot()?.generation).await?;
    }

    let avery = Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?;
    let jules = Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?;
    let courses = vec![
        (
            Uuid::parse_str("6a1d3d2e-6f0b-4a43-9c55-0d1f0b6c2a11")?,
            avery,
            "MAT2002",
            "Discrete Mathematics",
            vec![(Weekday::Tue, 2), (Weekday::Thu, 1)],
            (30, 24),
        ),
        (
            Uuid::parse_str("b0c5e9a4-3d4f-4e0a-8f5e-7b2c1d9e4f22")?,
            avery,
            "CSE1001",
            "Problem Solving and Programming",
            vec![(Weekday::Wed, 1), (Weekday::Fri, 2)],
            (28, 19),
        ),
        (
            Uuid::parse_str("e7f8a9b0-1c2d-4e3f-a4b5-c6d7e8f9a033")?,
            jules,
            "PHY1001",
            "Engineering Physics",
            vec![(Weekday::Tue, 1), (Weekday::Wed, 1), (Weekday::Sat, 1)],
            (27, 26),
        ),
    ];

    for (id, student_id, code, name, sessions, (conducted, attended)) in courses {
        let course = Course {
            id,
            student_id,
            code: code.to_string(),
            name: name.to_string(),
            start_date: Some(seed_date(2026, 7, 14)?),
        };
        save_course(pool, &course).await?;
        registrar.save_course(course)?;

        let pattern = WeeklyPattern::from_entries(sessions)?;
        registrar.set_weekly_pattern(id, pattern)?;
        save_pattern(pool, id, &pattern).await?;

        let recorded = registrar.record_aggregate(id, conducted, attended, today)?;
        save_history(pool, id, &recorded.history).await?;
        recorded.forecast?;
    }

    Ok(())
}
