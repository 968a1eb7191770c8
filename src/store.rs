//! Storage seams consumed by the report cache, plus the in-process store the
//! CLI hydrates from Postgres.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{ForecastError, StoreError};
use crate::models::{AttendanceHistory, AttendanceReport, CalendarSnapshot, Course, WeeklyPattern};

pub trait CalendarStore: Send + Sync {
    /// The snapshot every computation of one pass should share.
    fn current(&self) -> Result<Arc<CalendarSnapshot>, StoreError>;
}

pub trait ScheduleStore: Send + Sync {
    fn course(&self, course_id: Uuid) -> Result<Option<Course>, StoreError>;
    fn courses(&self) -> Result<Vec<Course>, StoreError>;
    fn courses_for_student(&self, student_id: Uuid) -> Result<Vec<Course>, StoreError>;
    fn weekly_pattern(&self, course_id: Uuid) -> Result<Option<WeeklyPattern>, StoreError>;
}

pub trait AttendanceHistoryStore: Send + Sync {
    fn history(&self, course_id: Uuid) -> Result<Option<AttendanceHistory>, StoreError>;
}

pub trait ReportStore: Send + Sync {
    fn get(&self, course_id: Uuid) -> Result<Option<AttendanceReport>, StoreError>;
    fn upsert(&self, report: AttendanceReport) -> Result<(), StoreError>;
    /// Returns whether a report existed.
    fn mark_stale(&self, course_id: Uuid) -> Result<bool, StoreError>;
    fn mark_all_stale(&self) -> Result<usize, StoreError>;
    fn delete(&self, course_id: Uuid) -> Result<bool, StoreError>;
    fn all(&self) -> Result<Vec<AttendanceReport>, StoreError>;
}

/// Everything the engine needs, held in memory. The calendar snapshot is
/// swapped whole on every change so readers never see a half-applied update.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: RwLock<Arc<CalendarSnapshot>>,
    courses: DashMap<Uuid, Course>,
    patterns: DashMap<Uuid, WeeklyPattern>,
    histories: DashMap<Uuid, AttendanceHistory>,
    reports: DashMap<Uuid, AttendanceReport>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot as loaded, generation included.
    pub fn load_snapshot(&self, snapshot: CalendarSnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Applies `change` to a copy of the snapshot. When the copy differs it is
    /// published under the next generation, which is returned alongside the
    /// closure's value. A failing closure leaves the snapshot untouched.
    pub fn update_calendar<T, F>(&self, change: F) -> Result<(T, Option<u64>), ForecastError>
    where
        F: FnOnce(&mut CalendarSnapshot) -> Result<T, ForecastError>,
    {
        let mut guard = self.snapshot.write();
        let mut next = CalendarSnapshot::clone(&guard);
        let value = change(&mut next)?;
        if next == **guard {
            return Ok((value, None));
        }

        next.generation = guard.generation + 1;
        let generation = next.generation;
        *guard = Arc::new(next);
        Ok((value, Some(generation)))
    }

    pub fn put_course(&self, course: Course) {
        self.courses.insert(course.id, course);
    }

    pub fn set_pattern(&self, course_id: Uuid, pattern: WeeklyPattern) {
        self.patterns.insert(course_id, pattern);
    }

    pub fn set_history(&self, course_id: Uuid, history: AttendanceHistory) {
        self.histories.insert(course_id, history);
    }

    /// Merges dated marks into the course history. Aggregate counts are
    /// superseded by the first dated write.
    pub fn merge_marks(&self, course_id: Uuid, marks: BTreeMap<NaiveDate, bool>) -> AttendanceHistory {
        let mut entry = self
            .histories
            .entry(course_id)
            .or_insert_with(|| AttendanceHistory::Dated {
                records: BTreeMap::new(),
            });
        match entry.value_mut() {
            AttendanceHistory::Dated { records } => records.extend(marks),
            history => *history = AttendanceHistory::Dated { records: marks },
        }
        entry.value().clone()
    }

    /// Drops the course and everything keyed by it.
    pub fn remove_course(&self, course_id: Uuid) -> Option<Course> {
        self.patterns.remove(&course_id);
        self.histories.remove(&course_id);
        self.reports.remove(&course_id);
        self.courses.remove(&course_id).map(|(_, course)| course)
    }
}

impl CalendarStore for MemoryStore {
    fn current(&self) -> Result<Arc<CalendarSnapshot>, StoreError> {
        Ok(Arc::clone(&self.snapshot.read()))
    }
}

impl ScheduleStore for MemoryStore {
    fn course(&self, course_id: Uuid) -> Result<Option<Course>, StoreError> {
        Ok(self.courses.get(&course_id).map(|c| c.value().clone()))
    }

    fn courses(&self) -> Result<Vec<Course>, StoreError> {
        Ok(self.courses.iter().map(|c| c.value().clone()).collect())
    }

    fn courses_for_student(&self, student_id: Uuid) -> Result<Vec<Course>, StoreError> {
        Ok(self
            .courses
            .iter()
            .filter(|c| c.student_id == student_id)
            .map(|c| c.value().clone())
            .collect())
    }

    fn weekly_pattern(&self, course_id: Uuid) -> Result<Option<WeeklyPattern>, StoreError> {
        Ok(self.patterns.get(&course_id).map(|p| *p.value()))
    }
}

impl AttendanceHistoryStore for MemoryStore {
    fn history(&self, course_id: Uuid) -> Result<Option<AttendanceHistory>, StoreError> {
        Ok(self.histories.get(&course_id).map(|h| h.value().clone()))
    }
}

impl ReportStore for MemoryStore {
    fn get(&self, course_id: Uuid) -> Result<Option<AttendanceReport>, StoreError> {
        Ok(self.reports.get(&course_id).map(|r| r.value().clone()))
    }

    /// Refuses reports for courses that are gone, so a recompute racing a
    /// delete cannot resurrect one.
    fn upsert(&self, report: AttendanceReport) -> Result<(), StoreError> {
        if !self.courses.contains_key(&report.course_id) {
            return Err(StoreError::OrphanedReport(report.course_id));
        }
        self.reports.insert(report.course_id, report);
        Ok(())
    }

    fn mark_stale(&self, course_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .reports
            .get_mut(&course_id)
            .map(|mut report| report.stale = true)
            .is_some())
    }

    fn mark_all_stale(&self) -> Result<usize, StoreError> {
        let mut marked = 0;
        for mut report in self.reports.iter_mut() {
            report.stale = true;
            marked += 1;
        }
        Ok(marked)
    }

    fn delete(&self, course_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.reports.remove(&course_id).is_some())
    }

    fn all(&self) -> Result<Vec<AttendanceReport>, StoreError> {
        Ok(self.reports.iter().map(|r| r.value().clone()).collect())
    }
}
