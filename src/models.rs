use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::is_class_weekday;
use crate::eligibility::{ForecastStatus, MilestoneEligibility, ThresholdForecast};
use crate::error::ForecastError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MilestoneKind {
    #[serde(rename = "CAT-1")]
    Cat1,
    #[serde(rename = "CAT-2")]
    Cat2,
    #[serde(rename = "FAT")]
    Fat,
}

impl MilestoneKind {
    /// Order in which the upcoming milestone is picked.
    pub const PRIORITY: [MilestoneKind; 3] = [MilestoneKind::Cat1, MilestoneKind::Cat2, MilestoneKind::Fat];

    pub fn label(self) -> &'static str {
        match self {
            MilestoneKind::Cat1 => "CAT-1",
            MilestoneKind::Cat2 => "CAT-2",
            MilestoneKind::Fat => "FAT",
        }
    }

    /// The final exam closes the semester and has no study holiday.
    pub fn is_terminal(self) -> bool {
        matches!(self, MilestoneKind::Fat)
    }
}

impl fmt::Display for MilestoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MilestoneKind {
    type Err = ForecastError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CAT-1" | "CAT1" => Ok(MilestoneKind::Cat1),
            "CAT-2" | "CAT2" => Ok(MilestoneKind::Cat2),
            "FAT" => Ok(MilestoneKind::Fat),
            other => Err(ForecastError::InvalidCalendar(format!(
                "unknown milestone `{other}`"
            ))),
        }
    }
}

/// A named exam window, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub kind: MilestoneKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcademicCalendar {
    pub id: i64,
    pub academic_year: Option<String>,
    pub semester_start: NaiveDate,
    /// Last working day of the semester, inclusive.
    pub exam_window_start: NaiveDate,
    pub milestones: Vec<Milestone>,
}

impl AcademicCalendar {
    pub fn new(
        id: i64,
        academic_year: Option<String>,
        semester_start: NaiveDate,
        exam_window_start: NaiveDate,
        milestones: Vec<Milestone>,
    ) -> Result<Self, ForecastError> {
        let calendar = AcademicCalendar {
            id,
            academic_year,
            semester_start,
            exam_window_start,
            milestones,
        };
        calendar.validate()?;
        Ok(calendar)
    }

    pub fn validate(&self) -> Result<(), ForecastError> {
        if self.semester_start > self.exam_window_start {
            return Err(ForecastError::InvalidCalendar(format!(
                "semester start {} is after exam window start {}",
                self.semester_start, self.exam_window_start
            )));
        }

        let mut seen = BTreeSet::new();
        for milestone in &self.milestones {
            if milestone.start > milestone.end {
                return Err(ForecastError::InvalidCalendar(format!(
                    "{} starts on {} but ends on {}",
                    milestone.kind, milestone.start, milestone.end
                )));
            }
            if !seen.insert(milestone.kind) {
                return Err(ForecastError::InvalidCalendar(format!(
                    "{} is defined more than once",
                    milestone.kind
                )));
            }
        }

        Ok(())
    }

    pub fn milestone(&self, kind: MilestoneKind) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.kind == kind)
    }

    pub fn covers(&self, date: NaiveDate) -> bool {
        self.semester_start <= date && date <= self.exam_window_start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HolidayType {
    Public,
    Academic,
    Restricted,
    Calendar,
    Extra,
}

impl HolidayType {
    pub fn as_str(self) -> &'static str {
        match self {
            HolidayType::Public => "PUBLIC",
            HolidayType::Academic => "ACADEMIC",
            HolidayType::Restricted => "RESTRICTED",
            HolidayType::Calendar => "CALENDAR",
            HolidayType::Extra => "EXTRA",
        }
    }
}

impl FromStr for HolidayType {
    type Err = ForecastError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PUBLIC" => Ok(HolidayType::Public),
            "ACADEMIC" => Ok(HolidayType::Academic),
            "RESTRICTED" => Ok(HolidayType::Restricted),
            "CALENDAR" => Ok(HolidayType::Calendar),
            "EXTRA" => Ok(HolidayType::Extra),
            other => Err(ForecastError::InvalidCalendar(format!(
                "unknown holiday type `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holiday {
    pub date: NaiveDate,
    pub reason: String,
    pub kind: HolidayType,
    /// Calendar the holiday was declared against. Untagged holidays apply to
    /// every calendar.
    pub calendar_id: Option<i64>,
}

/// Versioned view of the calendar configuration. Every calendar or holiday
/// mutation produces a new snapshot with a higher generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CalendarSnapshot {
    pub generation: u64,
    pub calendar: Option<AcademicCalendar>,
    pub holidays: BTreeMap<NaiveDate, Holiday>,
}

impl CalendarSnapshot {
    pub fn current_for(&self, today: NaiveDate) -> Result<&AcademicCalendar, ForecastError> {
        self.calendar
            .as_ref()
            .filter(|calendar| calendar.covers(today))
            .ok_or(ForecastError::ConfigurationMissing(today))
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        let current_id = self.calendar.as_ref().map(|c| c.id);
        self.holidays
            .get(&date)
            .is_some_and(|h| h.calendar_id.is_none() || h.calendar_id == current_id)
    }

    /// Holiday dates that apply to the current calendar.
    pub fn active_holidays(&self) -> BTreeSet<NaiveDate> {
        self.holidays
            .keys()
            .copied()
            .filter(|date| self.is_holiday(*date))
            .collect()
    }
}

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Sessions held per weekday. Only Tuesday to Saturday may carry classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyPattern {
    sessions: [u32; 7],
}

impl WeeklyPattern {
    pub fn from_entries<I>(entries: I) -> Result<Self, ForecastError>
    where
        I: IntoIterator<Item = (Weekday, u32)>,
    {
        let mut pattern = WeeklyPattern::default();
        for (weekday, count) in entries {
            if !is_class_weekday(weekday) && count > 0 {
                return Err(ForecastError::InvalidSchedule(format!(
                    "classes cannot be scheduled on {weekday}"
                )));
            }
            pattern.sessions[weekday.num_days_from_monday() as usize] = count;
        }
        Ok(pattern)
    }

    pub fn sessions_on(&self, weekday: Weekday) -> u32 {
        self.sessions[weekday.num_days_from_monday() as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.iter().all(|count| *count == 0)
    }

    /// Weekdays with at least one session, Monday first.
    pub fn entries(&self) -> impl Iterator<Item = (Weekday, u32)> + '_ {
        WEEK.iter()
            .map(|weekday| (*weekday, self.sessions_on(*weekday)))
            .filter(|(_, count)| *count > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: Uuid,
    pub student_id: Uuid,
    pub code: String,
    pub name: String,
    /// Needed for listing past class dates.
    pub start_date: Option<NaiveDate>,
}

/// Recorded attendance for one course. Writing one representation replaces
/// the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttendanceHistory {
    Aggregate { conducted: u32, attended: u32 },
    Dated { records: BTreeMap<NaiveDate, bool> },
}

impl AttendanceHistory {
    /// `(conducted, attended)`.
    pub fn counts(&self) -> (u32, u32) {
        self.counts_from(None)
    }

    /// Like `counts`, leaving out dated marks before `start`.
    pub fn counts_from(&self, start: Option<NaiveDate>) -> (u32, u32) {
        match self {
            AttendanceHistory::Aggregate {
                conducted,
                attended,
            } => (*conducted, *attended),
            AttendanceHistory::Dated { records } => {
                let counted: Vec<bool> = match start {
                    Some(start) => records.range(start..).map(|(_, present)| *present).collect(),
                    None => records.values().copied().collect(),
                };
                let conducted = u32::try_from(counted.len()).unwrap_or(u32::MAX);
                let attended = counted.iter().filter(|present| **present).count();
                (conducted, u32::try_from(attended).unwrap_or(u32::MAX))
            }
        }
    }

    /// Dates already marked on or after `since`. Aggregate history has none.
    pub fn recorded_since(&self, since: NaiveDate) -> BTreeSet<NaiveDate> {
        match self {
            AttendanceHistory::Aggregate { .. } => BTreeSet::new(),
            AttendanceHistory::Dated { records } => records.range(since..).map(|(d, _)| *d).collect(),
        }
    }

    pub fn mark_on(&self, date: NaiveDate) -> Option<bool> {
        match self {
            AttendanceHistory::Aggregate { .. } => None,
            AttendanceHistory::Dated { records } => records.get(&date).copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneForecast {
    pub kind: MilestoneKind,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub future_sessions: u32,
    pub standard: MilestoneEligibility,
    pub relaxed: MilestoneEligibility,
}

impl MilestoneForecast {
    pub fn projected_percentage(&self) -> f64 {
        self.standard.projected_percentage
    }
}

/// Cached forecast snapshot, one per course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceReport {
    pub course_id: Uuid,
    pub student_id: Uuid,
    pub course_code: String,
    pub calendar_generation: u64,
    pub total_conducted: u32,
    pub attended: u32,
    pub current_percentage: f64,
    pub future_sessions: u32,
    pub standard: ThresholdForecast,
    pub relaxed: ThresholdForecast,
    pub milestone: Option<MilestoneForecast>,
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
}

impl AttendanceReport {
    /// Overall status at the standard threshold.
    pub fn status(&self) -> ForecastStatus {
        self.standard.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn calendar_rejects_inverted_semester() {
        let result = AcademicCalendar::new(1, None, date(2026, 11, 1), date(2026, 7, 1), vec![]);
        assert!(matches!(result, Err(ForecastError::InvalidCalendar(_))));
    }

    #[test]
    fn calendar_rejects_duplicate_milestones() {
        let window = Milestone {
            kind: MilestoneKind::Cat1,
            start: date(2026, 8, 25),
            end: date(2026, 8, 29),
        };
        let result = AcademicCalendar::new(
            1,
            None,
            date(2026, 7, 14),
            date(2026, 11, 21),
            vec![window, window],
        );
        assert!(matches!(result, Err(ForecastError::InvalidCalendar(_))));
    }

    #[test]
    fn holidays_tagged_to_old_calendars_stop_applying() {
        let calendar =
            AcademicCalendar::new(2, None, date(2026, 7, 14), date(2026, 11, 21), vec![]).unwrap();
        let mut snapshot = CalendarSnapshot {
            generation: 1,
            calendar: Some(calendar),
            holidays: BTreeMap::new(),
        };
        for (day, tag) in [(4, Some(1)), (5, Some(2)), (6, None)] {
            snapshot.holidays.insert(
                date(2026, 8, day),
                Holiday {
                    date: date(2026, 8, day),
                    reason: "test".to_string(),
                    kind: HolidayType::Public,
                    calendar_id: tag,
                },
            );
        }

        assert!(!snapshot.is_holiday(date(2026, 8, 4)));
        assert!(snapshot.is_holiday(date(2026, 8, 5)));
        assert!(snapshot.is_holiday(date(2026, 8, 6)));
        assert_eq!(snapshot.active_holidays().len(), 2);
    }

    #[test]
    fn current_for_requires_coverage() {
        let calendar =
            AcademicCalendar::new(1, None, date(2026, 7, 14), date(2026, 11, 21), vec![]).unwrap();
        let snapshot = CalendarSnapshot {
            generation: 1,
            calendar: Some(calendar),
            holidays: BTreeMap::new(),
        };
        assert!(snapshot.current_for(date(2026, 9, 1)).is_ok());
        assert!(matches!(
            snapshot.current_for(date(2026, 12, 1)),
            Err(ForecastError::ConfigurationMissing(_))
        ));
    }

    #[test]
    fn weekly_pattern_rejects_sunday_and_monday() {
        assert!(WeeklyPattern::from_entries([(Weekday::Mon, 1)]).is_err());
        assert!(WeeklyPattern::from_entries([(Weekday::Sun, 2)]).is_err());

        let pattern = WeeklyPattern::from_entries([(Weekday::Tue, 2), (Weekday::Fri, 1)]).unwrap();
        assert_eq!(pattern.sessions_on(Weekday::Tue), 2);
        assert_eq!(pattern.sessions_on(Weekday::Wed), 0);
        assert_eq!(
            pattern.entries().collect::<Vec<_>>(),
            vec![(Weekday::Tue, 2), (Weekday::Fri, 1)]
        );
    }

    #[test]
    fn dated_history_counts_marks() {
        let history = AttendanceHistory::Dated {
            records: BTreeMap::from([
                (date(2026, 8, 4), true),
                (date(2026, 8, 5), false),
                (date(2026, 8, 6), true),
            ]),
        };
        assert_eq!(history.counts(), (3, 2));
        assert_eq!(history.counts_from(Some(date(2026, 8, 5))), (2, 1));
        assert_eq!(history.counts_from(Some(date(2026, 8, 7))), (0, 0));
        assert_eq!(history.recorded_since(date(2026, 8, 5)).len(), 2);
        assert_eq!(history.mark_on(date(2026, 8, 5)), Some(false));
    }
}
