//! Class-day enumeration over the academic calendar.
//!
//! A date is a class day when it falls on Tuesday to Saturday, is not a
//! holiday, lies outside every milestone window and is not the study holiday
//! in front of a CAT. Pure logic: the caller hands in the calendar snapshot
//! and the query date, nothing here reads the clock.

use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, Weekday};
use tracing::{debug, warn};

use crate::error::ForecastError;
use crate::models::{AcademicCalendar, CalendarSnapshot, MilestoneKind};

/// Sunday and Monday never carry classes.
pub fn is_class_weekday(weekday: Weekday) -> bool {
    !matches!(weekday, Weekday::Sun | Weekday::Mon)
}

/// How far ahead a forecast counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizon {
    /// Through the exam window start, inclusive.
    SemesterEnd,
    /// Through the last class day before the given milestone.
    Milestone(MilestoneKind),
}

/// Dates removed from the forecast on top of the weekday rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub holidays: BTreeSet<NaiveDate>,
    pub exam_windows: Vec<(NaiveDate, NaiveDate)>,
    pub study_holidays: BTreeSet<NaiveDate>,
}

impl Exclusions {
    pub fn for_calendar(calendar: &AcademicCalendar, holidays: BTreeSet<NaiveDate>) -> Self {
        let exam_windows = calendar
            .milestones
            .iter()
            .map(|m| (m.start, m.end))
            .collect();
        let study_holidays = calendar
            .milestones
            .iter()
            .filter(|m| !m.kind.is_terminal())
            .filter_map(|m| study_holiday(m.start, calendar.semester_start, &holidays))
            .collect();

        Exclusions {
            holidays,
            exam_windows,
            study_holidays,
        }
    }

    pub fn excludes(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
            || self
                .exam_windows
                .iter()
                .any(|(start, end)| *start <= date && date <= *end)
            || self.study_holidays.contains(&date)
    }
}

/// The last Tuesday-to-Saturday non-holiday strictly before `milestone_start`,
/// searched back no further than `floor`. Exam windows do not stop the search.
pub fn study_holiday(
    milestone_start: NaiveDate,
    floor: NaiveDate,
    holidays: &BTreeSet<NaiveDate>,
) -> Option<NaiveDate> {
    let mut day = milestone_start.pred_opt()?;
    while day >= floor {
        if is_class_weekday(day.weekday()) && !holidays.contains(&day) {
            return Some(day);
        }
        day = day.pred_opt()?;
    }
    None
}

/// Every class day in `start..=end`.
pub fn valid_class_days(start: NaiveDate, end: NaiveDate, exclusions: &Exclusions) -> Vec<NaiveDate> {
    if start > end {
        return Vec::new();
    }

    start
        .iter_days()
        .take_while(|day| *day <= end)
        .filter(|day| is_class_weekday(day.weekday()) && !exclusions.excludes(*day))
        .collect()
}

/// Class-day calculator bound to the calendar that is current on a query date.
#[derive(Debug)]
pub struct WorkingDayCalculator<'a> {
    calendar: &'a AcademicCalendar,
    exclusions: Exclusions,
}

impl<'a> WorkingDayCalculator<'a> {
    pub fn new(snapshot: &'a CalendarSnapshot, today: NaiveDate) -> Result<Self, ForecastError> {
        let calendar = snapshot.current_for(today)?;
        let exclusions = Exclusions::for_calendar(calendar, snapshot.active_holidays());
        Ok(WorkingDayCalculator {
            calendar,
            exclusions,
        })
    }

    /// Last date a forecast towards `horizon` may count. `None` when the
    /// milestone is not part of the calendar.
    pub fn last_countable_day(&self, horizon: Horizon) -> Option<NaiveDate> {
        let boundary = self.calendar.exam_window_start;
        let kind = match horizon {
            Horizon::SemesterEnd => return Some(boundary),
            Horizon::Milestone(kind) => kind,
        };

        let milestone = self.calendar.milestone(kind)?;
        if kind.is_terminal() {
            return Some(boundary);
        }

        let cutoff = study_holiday(
            milestone.start,
            self.calendar.semester_start,
            &self.exclusions.holidays,
        )
        .unwrap_or(milestone.start);
        cutoff.pred_opt().map(|day| day.min(boundary))
    }

    /// Class days from `from` (inclusive) through the horizon.
    pub fn days_from(&self, from: NaiveDate, horizon: Horizon) -> Vec<NaiveDate> {
        let Some(end) = self.last_countable_day(horizon) else {
            return Vec::new();
        };
        let start = from.max(self.calendar.semester_start);
        let days = valid_class_days(start, end, &self.exclusions);
        debug!(
            calendar_id = self.calendar.id,
            ?horizon,
            %start,
            %end,
            days = days.len(),
            "Enumerated class days"
        );
        days
    }
}

/// Class days from `today` through `horizon`, or nothing when no calendar is
/// current.
pub fn future_class_days(snapshot: &CalendarSnapshot, today: NaiveDate, horizon: Horizon) -> Vec<NaiveDate> {
    match WorkingDayCalculator::new(snapshot, today) {
        Ok(calculator) => calculator.days_from(today, horizon),
        Err(err) => {
            warn!(%today, error = %err, "No future class days");
            Vec::new()
        }
    }
}
