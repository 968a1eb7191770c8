//! Turns class days into session counts using a course's weekly pattern.

use std::collections::BTreeSet;

use chrono::{Datelike, Months, NaiveDate, Weekday};
use serde::Serialize;
use tracing::debug;

use crate::calendar::{future_class_days, valid_class_days, Exclusions, Horizon};
use crate::error::ForecastError;
use crate::models::{AttendanceHistory, CalendarSnapshot, Course, WeeklyPattern};

/// Months of marks consulted when skipping already-recorded days.
pub const DEFAULT_LOOKBACK_MONTHS: u32 = 6;

/// Sum of scheduled sessions over `valid_days`, ignoring days already marked.
pub fn project_sessions(
    pattern: &WeeklyPattern,
    valid_days: &[NaiveDate],
    already_recorded: &BTreeSet<NaiveDate>,
) -> u32 {
    valid_days
        .iter()
        .filter(|day| !already_recorded.contains(day))
        .map(|day| pattern.sessions_on(day.weekday()))
        .sum()
}

/// Marked dates inside the lookback window ending at `today`.
pub fn recorded_dates(history: &AttendanceHistory, today: NaiveDate, lookback_months: u32) -> BTreeSet<NaiveDate> {
    let since = today
        .checked_sub_months(Months::new(lookback_months))
        .unwrap_or(NaiveDate::MIN);
    history.recorded_since(since)
}

/// Future sessions for one course as of `today`.
#[derive(Debug)]
pub struct FutureSessionProjector<'a> {
    snapshot: &'a CalendarSnapshot,
    pattern: &'a WeeklyPattern,
    already_recorded: BTreeSet<NaiveDate>,
    today: NaiveDate,
}

impl<'a> FutureSessionProjector<'a> {
    pub fn new(
        snapshot: &'a CalendarSnapshot,
        pattern: &'a WeeklyPattern,
        history: &AttendanceHistory,
        today: NaiveDate,
        lookback_months: u32,
    ) -> Self {
        FutureSessionProjector {
            snapshot,
            pattern,
            already_recorded: recorded_dates(history, today, lookback_months),
            today,
        }
    }

    /// Sessions left through the semester boundary.
    pub fn through_semester(&self) -> u32 {
        self.project(Horizon::SemesterEnd)
    }

    pub fn project(&self, horizon: Horizon) -> u32 {
        let days = future_class_days(self.snapshot, self.today, horizon);
        let sessions = project_sessions(self.pattern, &days, &self.already_recorded);
        debug!(
            ?horizon,
            days = days.len(),
            skipped = self.already_recorded.len(),
            sessions,
            "Projected future sessions"
        );
        sessions
    }
}

/// One scheduled class date up to today.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassDate {
    pub date: NaiveDate,
    pub weekday: Weekday,
    pub sessions: u32,
    pub attended: Option<bool>,
}

/// Scheduled class dates from the course start through `today`, with any
/// recorded mark. Holidays and exam windows are skipped; when no calendar is
/// current only holidays are.
pub fn class_dates(
    course: &Course,
    pattern: &WeeklyPattern,
    history: Option<&AttendanceHistory>,
    snapshot: &CalendarSnapshot,
    today: NaiveDate,
) -> Result<Vec<ClassDate>, ForecastError> {
    let start = course.start_date.ok_or(ForecastError::InvalidCourseState {
        course_id: course.id,
        reason: "course start date is not set",
    })?;
    if pattern.is_empty() {
        return Err(ForecastError::InvalidCourseState {
            course_id: course.id,
            reason: "no weekly schedule",
        });
    }

    let holidays = snapshot.active_holidays();
    let exclusions = match snapshot.current_for(today) {
        Ok(calendar) => Exclusions {
            exam_windows: calendar.milestones.iter().map(|m| (m.start, m.end)).collect(),
            holidays,
            study_holidays: BTreeSet::new(),
        },
        Err(_) => Exclusions {
            holidays,
            ..Exclusions::default()
        },
    };

    let dates = valid_class_days(start, today, &exclusions)
        .into_iter()
        .filter_map(|date| {
            let sessions = pattern.sessions_on(date.weekday());
            (sessions > 0).then(|| ClassDate {
                date,
                weekday: date.weekday(),
                sessions,
                attended: history.and_then(|h| h.mark_on(date)),
            })
        })
        .collect();
    Ok(dates)
}
