//! Builds one course's attendance report from the calendar snapshot, its
//! weekly pattern and its recorded history.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::calendar::Horizon;
use crate::eligibility::{assess_milestone, assess_overall, upcoming_milestone, Tally, Threshold};
use crate::error::ForecastError;
use crate::models::{AttendanceHistory, AttendanceReport, CalendarSnapshot, Course, MilestoneForecast, WeeklyPattern};
use crate::projector::FutureSessionProjector;

/// `Ok(None)` when the course has no recorded session yet.
pub fn build_report(
    course: &Course,
    pattern: &WeeklyPattern,
    history: &AttendanceHistory,
    snapshot: &CalendarSnapshot,
    today: NaiveDate,
    lookback_months: u32,
    computed_at: DateTime<Utc>,
) -> Result<Option<AttendanceReport>, ForecastError> {
    let (conducted, attended) = history.counts_from(course.start_date);
    if conducted == 0 {
        debug!(course_id = %course.id, "No sessions recorded, nothing to forecast");
        return Ok(None);
    }

    let tally = Tally::new(conducted, attended).ok_or(ForecastError::InvalidCourseState {
        course_id: course.id,
        reason: "attended sessions exceed conducted sessions",
    })?;
    if pattern.is_empty() {
        return Err(ForecastError::InvalidCourseState {
            course_id: course.id,
            reason: "no weekly schedule",
        });
    }

    let projector = FutureSessionProjector::new(snapshot, pattern, history, today, lookback_months);
    let future = projector.through_semester();

    let milestone = snapshot
        .current_for(today)
        .ok()
        .and_then(|calendar| upcoming_milestone(calendar, today))
        .map(|milestone| {
            let future_until = projector.project(Horizon::Milestone(milestone.kind));
            MilestoneForecast {
                kind: milestone.kind,
                start: milestone.start,
                end: milestone.end,
                future_sessions: future_until,
                standard: assess_milestone(tally, future_until, Threshold::Standard),
                relaxed: assess_milestone(tally, future_until, Threshold::Relaxed),
            }
        });

    Ok(Some(AttendanceReport {
        course_id: course.id,
        student_id: course.student_id,
        course_code: course.code.clone(),
        calendar_generation: snapshot.generation,
        total_conducted: tally.conducted(),
        attended: tally.attended(),
        current_percentage: tally.current_percentage(),
        future_sessions: future,
        standard: assess_overall(tally, future, Threshold::Standard),
        relaxed: assess_overall(tally, future, Threshold::Relaxed),
        milestone,
        stale: false,
        computed_at,
    }))
}
