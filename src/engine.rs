use std::sync::Arc;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::admin::Registrar;
use crate::cache::{self, ForecastPolicy, ReportCache, StudentForecast, SweepSummary};
use crate::error::ForecastError;
use crate::events::EventBus;
use crate::models::CalendarSnapshot;
use crate::projector::{self, ClassDate};
use crate::store::{AttendanceHistoryStore, CalendarStore, MemoryStore, ScheduleStore};

/// The store, the event bus and the report cache wired together. The cache
/// listens on the bus for every write made through the registrar.
pub struct Engine {
    store: Arc<MemoryStore>,
    cache: Arc<ReportCache>,
    registrar: Registrar,
}

impl Engine {
    pub fn new(store: Arc<MemoryStore>, policy: ForecastPolicy) -> Self {
        let bus = Arc::new(EventBus::new());
        let cache = Arc::new(ReportCache::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            policy,
        ));
        bus.subscribe(cache.clone());
        let registrar = Registrar::new(store.clone(), bus);
        Engine {
            store,
            cache,
            registrar,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn cache(&self) -> &ReportCache {
        &self.cache
    }

    pub fn snapshot(&self) -> Result<Arc<CalendarSnapshot>, ForecastError> {
        Ok(self.store.current()?)
    }

    pub fn reports_for_student(&self, student_id: Uuid, today: NaiveDate) -> Result<StudentForecast, ForecastError> {
        self.cache.reports_for_student(student_id, today)
    }

    pub fn class_dates(&self, course_id: Uuid, today: NaiveDate) -> Result<Vec<ClassDate>, ForecastError> {
        let course = self
            .store
            .course(course_id)?
            .ok_or(ForecastError::CourseNotFound(course_id))?;
        let pattern = self.store.weekly_pattern(course_id)?.unwrap_or_default();
        let history = self.store.history(course_id)?;
        let snapshot = self.store.current()?;
        projector::class_dates(&course, &pattern, history.as_ref(), &snapshot, today)
    }

    pub async fn sweep(&self, today: NaiveDate) -> Result<SweepSummary, ForecastError> {
        cache::sweep(Arc::clone(&self.cache), today).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Weekday;

    use super::*;
    use crate::admin::CalendarDraft;
    use crate::cache::ReportState;
    use crate::calendar::tests::{date, september_snapshot};
    use crate::eligibility::ForecastStatus;
    use crate::models::{Course, HolidayType, WeeklyPattern};
    use crate::store::ReportStore;

    fn engine() -> Engine {
        let store = Arc::new(MemoryStore::new());
        store.load_snapshot(september_snapshot());
        Engine::new(store, ForecastPolicy::default())
    }

    fn enrol(engine: &Engine, student_id: Uuid, code: &str) -> Uuid {
        let course = Course {
            id: Uuid::new_v4(),
            student_id,
            code: code.to_string(),
            name: code.to_string(),
            start_date: Some(date(2026, 9, 1)),
        };
        let course_id = course.id;
        engine.registrar().save_course(course).unwrap();
        engine
            .registrar()
            .set_weekly_pattern(
                course_id,
                WeeklyPattern::from_entries([(Weekday::Tue, 2), (Weekday::Thu, 1)]).unwrap(),
            )
            .unwrap();
        course_id
    }

    #[test]
    fn recording_attendance_materializes_a_fresh_report() {
        let engine = engine();
        let course_id = enrol(&engine, Uuid::new_v4(), "MAT2002");
        assert_eq!(engine.cache().state(course_id).unwrap(), ReportState::Absent);

        engine
            .registrar()
            .record_aggregate(course_id, 10, 8, date(2026, 9, 1))
            .unwrap();
        assert_eq!(engine.cache().state(course_id).unwrap(), ReportState::Fresh);
    }

    #[test]
    fn holiday_change_invalidates_and_read_refreshes() {
        let engine = engine();
        let student = Uuid::new_v4();
        let course_id = enrol(&engine, student, "MAT2002");
        engine
            .registrar()
            .record_aggregate(course_id, 10, 8, date(2026, 9, 1))
            .unwrap();

        engine
            .registrar()
            .add_holiday(date(2026, 9, 22), "Exam prep", HolidayType::Academic)
            .unwrap();
        assert_eq!(engine.cache().state(course_id).unwrap(), ReportState::Stale);

        let forecast = engine.reports_for_student(student, date(2026, 9, 1)).unwrap();
        // Tuesday the 22nd carried two sessions
        assert_eq!(forecast.reports[0].future_sessions, 7);
        assert_eq!(engine.cache().state(course_id).unwrap(), ReportState::Fresh);
    }

    #[test]
    fn dated_marks_feed_the_report_and_class_dates() {
        let engine = engine();
        let student = Uuid::new_v4();
        let course_id = enrol(&engine, student, "CSE1001");
        engine
            .registrar()
            .record_dated(
                course_id,
                BTreeMap::from([(date(2026, 9, 1), true), (date(2026, 9, 3), false)]),
                date(2026, 9, 3),
            )
            .unwrap();

        let listed = engine.class_dates(course_id, date(2026, 9, 3)).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].attended, Some(false));

        let reports = engine.reports_for_student(student, date(2026, 9, 3)).unwrap().reports;
        assert_eq!(reports[0].total_conducted, 2);
        assert_eq!(reports[0].attended, 1);
        assert_eq!(reports[0].status(), ForecastStatus::AtRisk);
    }

    #[test]
    fn calendar_replacement_marks_everything_stale() {
        let engine = engine();
        let first = enrol(&engine, Uuid::new_v4(), "MAT2002");
        let second = enrol(&engine, Uuid::new_v4(), "PHY1001");
        for course_id in [first, second] {
            engine
                .registrar()
                .record_aggregate(course_id, 4, 4, date(2026, 9, 1))
                .unwrap();
        }

        engine
            .registrar()
            .save_calendar(CalendarDraft {
                academic_year: Some("2026-27".to_string()),
                semester_start: date(2026, 9, 1),
                exam_window_start: date(2026, 10, 31),
                milestones: vec![],
            })
            .unwrap();

        for course_id in [first, second] {
            assert_eq!(engine.cache().state(course_id).unwrap(), ReportState::Stale);
        }
        assert!(engine.store().all().unwrap().iter().all(|r| r.stale));

        let refreshed = engine.cache().recompute(first, date(2026, 9, 1)).unwrap().unwrap();
        assert!(!refreshed.stale);
        assert_eq!(engine.cache().state(first).unwrap(), ReportState::Fresh);
        assert!(!engine.store().get(first).unwrap().unwrap().stale);
        assert_eq!(engine.cache().state(second).unwrap(), ReportState::Stale);
        assert!(engine.store().get(second).unwrap().unwrap().stale);
    }

    #[test]
    fn attendance_for_an_unscheduled_course_is_kept_but_not_forecast() {
        let engine = engine();
        let course = Course {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            code: "MAT2002".to_string(),
            name: "Discrete Mathematics".to_string(),
            start_date: Some(date(2026, 9, 1)),
        };
        let course_id = course.id;
        engine.registrar().save_course(course).unwrap();

        let recorded = engine
            .registrar()
            .record_aggregate(course_id, 10, 8, date(2026, 9, 1))
            .unwrap();
        assert_eq!(recorded.history.counts(), (10, 8));
        assert!(matches!(
            recorded.forecast,
            Err(ForecastError::InvalidCourseState { reason: "no weekly schedule", .. })
        ));
        assert_eq!(engine.cache().state(course_id).unwrap(), ReportState::Absent);
    }

    #[test]
    fn failed_refresh_after_new_attendance_leaves_the_old_report_stale() {
        let engine = engine();
        let course_id = enrol(&engine, Uuid::new_v4(), "MAT2002");
        engine
            .registrar()
            .record_aggregate(course_id, 10, 8, date(2026, 9, 1))
            .unwrap()
            .forecast
            .unwrap();

        engine
            .registrar()
            .set_weekly_pattern(course_id, WeeklyPattern::default())
            .unwrap();
        let recorded = engine
            .registrar()
            .record_aggregate(course_id, 20, 5, date(2026, 9, 1))
            .unwrap();
        assert!(recorded.forecast.is_err());
        assert_eq!(engine.cache().state(course_id).unwrap(), ReportState::Stale);
    }

    #[test]
    fn deleting_a_course_removes_its_report() {
        let engine = engine();
        let course_id = enrol(&engine, Uuid::new_v4(), "MAT2002");
        engine
            .registrar()
            .record_aggregate(course_id, 4, 3, date(2026, 9, 1))
            .unwrap();

        engine.registrar().delete_course(course_id).unwrap();
        assert_eq!(engine.cache().state(course_id).unwrap(), ReportState::Absent);
        assert!(matches!(
            engine.class_dates(course_id, date(2026, 9, 3)),
            Err(ForecastError::CourseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn sweep_refreshes_every_course() {
        let engine = engine();
        let student = Uuid::new_v4();
        let with_history = enrol(&engine, student, "MAT2002");
        enrol(&engine, student, "PHY1001");
        engine
            .registrar()
            .record_aggregate(with_history, 10, 8, date(2026, 9, 1))
            .unwrap();
        engine
            .registrar()
            .add_holiday(date(2026, 9, 22), "Exam prep", HolidayType::Academic)
            .unwrap();

        let summary = engine.sweep(date(2026, 9, 1)).await.unwrap();
        assert_eq!(summary.recomputed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(engine.cache().state(with_history).unwrap(), ReportState::Fresh);
    }
}
