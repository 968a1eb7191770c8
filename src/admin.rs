//! Calendar, holiday, schedule and attendance writes. Every change is applied
//! to the store first and then published so cached reports follow.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ForecastError;
use crate::events::{EventBus, InvalidationEvent};
use crate::models::{
    AcademicCalendar, AttendanceHistory, CalendarSnapshot, Course, Holiday, HolidayType, Milestone, WeeklyPattern,
};
use crate::store::{MemoryStore, ScheduleStore};

/// A calendar as submitted, before it is assigned an id.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarDraft {
    #[serde(default)]
    pub academic_year: Option<String>,
    pub semester_start: NaiveDate,
    pub exam_window_start: NaiveDate,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

/// Never reuses an id a holiday may still be tagged with.
fn next_calendar_id(snapshot: &CalendarSnapshot) -> i64 {
    let current = snapshot.calendar.as_ref().map(|c| c.id);
    let tagged = snapshot.holidays.values().filter_map(|h| h.calendar_id).max();
    current.max(tagged).unwrap_or(0) + 1
}

fn reject_future_marks(marks: &BTreeMap<NaiveDate, bool>, today: NaiveDate) -> Result<(), ForecastError> {
    match marks.keys().find(|date| **date > today) {
        Some(future) => Err(ForecastError::InvalidAttendance(format!(
            "cannot mark attendance for {future}, which is after {today}"
        ))),
        None => Ok(()),
    }
}

/// An attendance write that was applied. `forecast` carries the outcome of
/// refreshing the course report; on failure the report is left stale.
#[derive(Debug)]
pub struct RecordedAttendance {
    pub history: AttendanceHistory,
    pub forecast: Result<(), ForecastError>,
}

pub struct Registrar {
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
}

impl Registrar {
    pub fn new(store: Arc<MemoryStore>, bus: Arc<EventBus>) -> Self {
        Registrar { store, bus }
    }

    /// Replaces the current calendar. The replacement always gets a new id.
    pub fn save_calendar(&self, draft: CalendarDraft) -> Result<AcademicCalendar, ForecastError> {
        let (calendar, generation) = self.store.update_calendar(|snapshot| {
            let calendar = AcademicCalendar::new(
                next_calendar_id(snapshot),
                draft.academic_year,
                draft.semester_start,
                draft.exam_window_start,
                draft.milestones,
            )?;
            snapshot.calendar = Some(calendar.clone());
            Ok(calendar)
        })?;

        info!(
            calendar_id = calendar.id,
            semester_start = %calendar.semester_start,
            exam_window_start = %calendar.exam_window_start,
            "Academic calendar replaced"
        );
        if let Some(generation) = generation {
            self.bus.publish(InvalidationEvent::CalendarReplaced {
                calendar_id: calendar.id,
                generation,
            })?;
        }
        Ok(calendar)
    }

    pub fn add_holiday(&self, date: NaiveDate, reason: &str, kind: HolidayType) -> Result<Holiday, ForecastError> {
        let (holiday, generation) = self.store.update_calendar(|snapshot| {
            if snapshot.holidays.contains_key(&date) {
                return Err(ForecastError::DuplicateHoliday(date));
            }
            let holiday = Holiday {
                date,
                reason: reason.to_string(),
                kind,
                calendar_id: snapshot.calendar.as_ref().map(|c| c.id),
            };
            snapshot.holidays.insert(date, holiday.clone());
            Ok(holiday)
        })?;

        self.holidays_changed(generation, 1, 0)?;
        Ok(holiday)
    }

    /// Adds every date in `start..=end` that is not already a holiday.
    pub fn add_holiday_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        reason: &str,
        kind: HolidayType,
    ) -> Result<Vec<Holiday>, ForecastError> {
        if end < start {
            return Err(ForecastError::InvalidCalendar(format!(
                "holiday range ends on {end} before it starts on {start}"
            )));
        }
        let entries = start
            .iter_days()
            .take_while(|day| *day <= end)
            .map(|day| (day, reason.to_string()));
        self.insert_missing(entries, kind)
    }

    /// Imports holidays of type `CALENDAR`, skipping dates already present.
    pub fn bulk_add_holidays<I>(&self, entries: I) -> Result<Vec<Holiday>, ForecastError>
    where
        I: IntoIterator<Item = (NaiveDate, String)>,
    {
        self.insert_missing(entries, HolidayType::Calendar)
    }

    fn insert_missing<I>(&self, entries: I, kind: HolidayType) -> Result<Vec<Holiday>, ForecastError>
    where
        I: IntoIterator<Item = (NaiveDate, String)>,
    {
        let (added, generation) = self.store.update_calendar(|snapshot| {
            let calendar_id = snapshot.calendar.as_ref().map(|c| c.id);
            let mut added = Vec::new();
            for (date, reason) in entries {
                if snapshot.holidays.contains_key(&date) {
                    continue;
                }
                let holiday = Holiday {
                    date,
                    reason,
                    kind,
                    calendar_id,
                };
                snapshot.holidays.insert(date, holiday.clone());
                added.push(holiday);
            }
            Ok(added)
        })?;

        self.holidays_changed(generation, added.len(), 0)?;
        Ok(added)
    }

    pub fn delete_holiday(&self, date: NaiveDate) -> Result<Holiday, ForecastError> {
        let (holiday, generation) = self.store.update_calendar(|snapshot| {
            snapshot
                .holidays
                .remove(&date)
                .ok_or(ForecastError::HolidayNotFound(date))
        })?;
        self.holidays_changed(generation, 0, 1)?;
        Ok(holiday)
    }

    fn holidays_changed(&self, generation: Option<u64>, added: usize, removed: usize) -> Result<(), ForecastError> {
        let Some(generation) = generation else {
            return Ok(());
        };
        info!(generation, added, removed, "Holidays changed");
        self.bus.publish(InvalidationEvent::HolidaysChanged {
            generation,
            added,
            removed,
        })
    }

    /// Creates or updates a course. A new course has no report to invalidate.
    pub fn save_course(&self, course: Course) -> Result<(), ForecastError> {
        let course_id = course.id;
        let existed = self.store.course(course_id)?.is_some();
        self.store.put_course(course);
        if existed {
            self.bus.publish(InvalidationEvent::ScheduleChanged { course_id })?;
        }
        Ok(())
    }

    pub fn set_weekly_pattern(&self, course_id: Uuid, pattern: WeeklyPattern) -> Result<(), ForecastError> {
        self.require_course(course_id)?;
        self.store.set_pattern(course_id, pattern);
        self.bus.publish(InvalidationEvent::ScheduleChanged { course_id })
    }

    /// Replaces the course history with aggregate counts.
    pub fn record_aggregate(
        &self,
        course_id: Uuid,
        conducted: u32,
        attended: u32,
        today: NaiveDate,
    ) -> Result<RecordedAttendance, ForecastError> {
        self.require_course(course_id)?;
        if attended > conducted {
            return Err(ForecastError::InvalidAttendance(format!(
                "attended {attended} exceeds conducted {conducted}"
            )));
        }

        let history = AttendanceHistory::Aggregate { conducted, attended };
        self.store.set_history(course_id, history.clone());
        Ok(self.attendance_recorded(course_id, history, today))
    }

    /// Merges per-date marks into the course history. A later mark for the
    /// same date wins.
    pub fn record_dated(
        &self,
        course_id: Uuid,
        marks: BTreeMap<NaiveDate, bool>,
        today: NaiveDate,
    ) -> Result<RecordedAttendance, ForecastError> {
        self.require_course(course_id)?;
        reject_future_marks(&marks, today)?;

        let history = self.store.merge_marks(course_id, marks);
        Ok(self.attendance_recorded(course_id, history, today))
    }

    /// Records marks for several courses. Every course and date is checked
    /// before the first one is written, so a bad row leaves all histories as
    /// they were.
    pub fn import_marks(
        &self,
        marks: BTreeMap<Uuid, BTreeMap<NaiveDate, bool>>,
        today: NaiveDate,
    ) -> Result<Vec<(Uuid, RecordedAttendance)>, ForecastError> {
        for (course_id, course_marks) in &marks {
            self.require_course(*course_id)?;
            reject_future_marks(course_marks, today)?;
        }

        let recorded = marks
            .into_iter()
            .map(|(course_id, course_marks)| {
                let history = self.store.merge_marks(course_id, course_marks);
                (course_id, self.attendance_recorded(course_id, history, today))
            })
            .collect();
        Ok(recorded)
    }

    fn attendance_recorded(&self, course_id: Uuid, history: AttendanceHistory, today: NaiveDate) -> RecordedAttendance {
        let forecast = self
            .bus
            .publish(InvalidationEvent::AttendanceRecorded { course_id, today });
        RecordedAttendance { history, forecast }
    }

    pub fn delete_course(&self, course_id: Uuid) -> Result<Course, ForecastError> {
        let course = self
            .store
            .remove_course(course_id)
            .ok_or(ForecastError::CourseNotFound(course_id))?;
        info!(%course_id, code = %course.code, "Course deleted");
        self.bus.publish(InvalidationEvent::CourseDeleted { course_id })?;
        Ok(course)
    }

    fn require_course(&self, course_id: Uuid) -> Result<Course, ForecastError> {
        self.store
            .course(course_id)?
            .ok_or(ForecastError::CourseNotFound(course_id))
    }
}
