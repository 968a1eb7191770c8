//! Error types for the forecasting engine.

use chrono::NaiveDate;
use uuid::Uuid;

/// Failure raised by one of the backing stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no course {0} to attach a report to")]
    OrphanedReport(Uuid),
    #[cfg(test)]
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ForecastError {
    /// No academic calendar covers the query date. Callers degrade to an empty
    /// future-session set instead of failing.
    #[error("no academic calendar is current on {0}")]
    ConfigurationMissing(NaiveDate),
    #[error("course {course_id} cannot be forecast: {reason}")]
    InvalidCourseState {
        course_id: Uuid,
        reason: &'static str,
    },
    #[error("failed to compute the attendance report for course {course_id}")]
    ComputationFailure {
        course_id: Uuid,
        #[source]
        source: StoreError,
    },
    #[error("invalid academic calendar: {0}")]
    InvalidCalendar(String),
    #[error("a holiday already exists on {0}")]
    DuplicateHoliday(NaiveDate),
    #[error("no holiday exists on {0}")]
    HolidayNotFound(NaiveDate),
    #[error("course {0} not found")]
    CourseNotFound(Uuid),
    #[error("invalid weekly schedule: {0}")]
    InvalidSchedule(String),
    #[error("invalid attendance: {0}")]
    InvalidAttendance(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

