//! Materialized per-course reports with staleness tracking.
//!
//! A report is stale when its flag is set or when it was computed against a
//! calendar generation other than the current one. Reads recompute stale or
//! missing reports lazily; the sweep recomputes every course in parallel.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ForecastError, StoreError};
use crate::events::{InvalidationEvent, InvalidationListener};
use crate::forecast::build_report;
use crate::models::{AttendanceReport, CalendarSnapshot, Course};
use crate::projector::DEFAULT_LOOKBACK_MONTHS;
use crate::store::{AttendanceHistoryStore, CalendarStore, ReportStore, ScheduleStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForecastPolicy {
    pub lookback_months: u32,
    pub sweep_workers: usize,
}

impl Default for ForecastPolicy {
    fn default() -> Self {
        ForecastPolicy {
            lookback_months: DEFAULT_LOOKBACK_MONTHS,
            sweep_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    Absent,
    Fresh,
    Stale,
}

impl ReportState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportState::Absent => "absent",
            ReportState::Fresh => "fresh",
            ReportState::Stale => "stale",
        }
    }
}

/// Everything known about one student's courses.
#[derive(Debug, Default)]
pub struct StudentForecast {
    /// Ordered by course code.
    pub reports: Vec<AttendanceReport>,
    /// Courses with history whose report could not be produced.
    pub failures: Vec<(Course, ForecastError)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub recomputed: usize,
    /// Courses without any recorded session.
    pub skipped: usize,
    pub failed: usize,
    pub failed_courses: Vec<Uuid>,
}

fn is_fresh(report: &AttendanceReport, snapshot: &CalendarSnapshot) -> bool {
    !report.stale && report.calendar_generation == snapshot.generation
}

pub struct ReportCache {
    calendars: Arc<dyn CalendarStore>,
    schedules: Arc<dyn ScheduleStore>,
    histories: Arc<dyn AttendanceHistoryStore>,
    reports: Arc<dyn ReportStore>,
    policy: ForecastPolicy,
}

impl ReportCache {
    pub fn new(
        calendars: Arc<dyn CalendarStore>,
        schedules: Arc<dyn ScheduleStore>,
        histories: Arc<dyn AttendanceHistoryStore>,
        reports: Arc<dyn ReportStore>,
        policy: ForecastPolicy,
    ) -> Self {
        ReportCache {
            calendars,
            schedules,
            histories,
            reports,
            policy,
        }
    }

    fn snapshot_for(&self, course_id: Uuid) -> Result<Arc<CalendarSnapshot>, ForecastError> {
        self.calendars
            .current()
            .map_err(|source| ForecastError::ComputationFailure { course_id, source })
    }

    /// Recomputes and stores the course report. `Ok(None)` when the course
    /// has no recorded session, in which case nothing is stored.
    pub fn recompute(&self, course_id: Uuid, today: NaiveDate) -> Result<Option<AttendanceReport>, ForecastError> {
        let snapshot = self.snapshot_for(course_id)?;
        self.recompute_with(&snapshot, course_id, today)
    }

    fn recompute_with(
        &self,
        snapshot: &CalendarSnapshot,
        course_id: Uuid,
        today: NaiveDate,
    ) -> Result<Option<AttendanceReport>, ForecastError> {
        let failure = |source: StoreError| ForecastError::ComputationFailure { course_id, source };

        let course = self
            .schedules
            .course(course_id)
            .map_err(failure)?
            .ok_or(ForecastError::CourseNotFound(course_id))?;
        let Some(history) = self.histories.history(course_id).map_err(failure)? else {
            debug!(%course_id, "No attendance history, report not materialized");
            return Ok(None);
        };
        let pattern = self
            .schedules
            .weekly_pattern(course_id)
            .map_err(failure)?
            .unwrap_or_default();

        let Some(report) = build_report(
            &course,
            &pattern,
            &history,
            snapshot,
            today,
            self.policy.lookback_months,
            Utc::now(),
        )?
        else {
            return Ok(None);
        };

        self.reports.upsert(report.clone()).map_err(failure)?;
        info!(
            %course_id,
            code = %report.course_code,
            status = report.status().as_str(),
            generation = report.calendar_generation,
            "Recomputed attendance report"
        );
        Ok(Some(report))
    }

    pub fn state(&self, course_id: Uuid) -> Result<ReportState, ForecastError> {
        let snapshot = self.snapshot_for(course_id)?;
        let state = match self.reports.get(course_id)? {
            None => ReportState::Absent,
            Some(report) if is_fresh(&report, &snapshot) => ReportState::Fresh,
            Some(_) => ReportState::Stale,
        };
        Ok(state)
    }

    /// The course report, recomputed first when missing or stale. A stale
    /// report is served as-is when the recompute fails.
    pub fn report(&self, course_id: Uuid, today: NaiveDate) -> Result<Option<AttendanceReport>, ForecastError> {
        let snapshot = self.snapshot_for(course_id)?;
        let cached = self.reports.get(course_id)?;
        if let Some(report) = &cached {
            if is_fresh(report, &snapshot) {
                return Ok(cached);
            }
        }

        match self.recompute_with(&snapshot, course_id, today) {
            Ok(Some(report)) => Ok(Some(report)),
            Ok(None) => Ok(cached),
            Err(err) => match cached {
                Some(mut report) => {
                    warn!(%course_id, error = %err, "Recompute failed, serving stale report");
                    report.stale = true;
                    Ok(Some(report))
                }
                None => Err(err),
            },
        }
    }

    /// Reports for every course of the student. Courses without history are
    /// left out; courses that cannot be forecast are listed with the reason.
    pub fn reports_for_student(&self, student_id: Uuid, today: NaiveDate) -> Result<StudentForecast, ForecastError> {
        let mut courses = self.schedules.courses_for_student(student_id)?;
        courses.sort_by(|a, b| a.code.cmp(&b.code));

        let mut forecast = StudentForecast::default();
        for course in courses {
            match self.report(course.id, today) {
                Ok(Some(report)) => forecast.reports.push(report),
                Ok(None) => {}
                Err(err) => {
                    warn!(course_id = %course.id, code = %course.code, error = %err, "Course cannot be forecast");
                    forecast.failures.push((course, err));
                }
            }
        }
        Ok(forecast)
    }

    pub fn mark_all_stale(&self) -> Result<usize, ForecastError> {
        let marked = self.reports.mark_all_stale()?;
        info!(marked, "Marked all reports stale");
        Ok(marked)
    }

    pub fn mark_stale(&self, course_id: Uuid) -> Result<bool, ForecastError> {
        Ok(self.reports.mark_stale(course_id)?)
    }

    pub fn evict(&self, course_id: Uuid) -> Result<bool, ForecastError> {
        Ok(self.reports.delete(course_id)?)
    }
}

impl InvalidationListener for ReportCache {
    fn on_event(&self, event: &InvalidationEvent) -> Result<(), ForecastError> {
        match event {
            InvalidationEvent::CalendarReplaced {
                calendar_id,
                generation,
            } => {
                debug!(calendar_id, generation, "Calendar replaced, invalidating reports");
                self.mark_all_stale().map(|_| ())
            }
            InvalidationEvent::HolidaysChanged {
                generation,
                added,
                removed,
            } => {
                debug!(generation, added, removed, "Holidays changed, invalidating reports");
                self.mark_all_stale().map(|_| ())
            }
            InvalidationEvent::ScheduleChanged { course_id } => self.mark_stale(*course_id).map(|_| ()),
            InvalidationEvent::AttendanceRecorded { course_id, today } => {
                // stays stale if the recompute fails
                self.mark_stale(*course_id)?;
                if self.recompute(*course_id, *today)?.is_none() {
                    self.evict(*course_id)?;
                }
                Ok(())
            }
            InvalidationEvent::CourseDeleted { course_id } => self.evict(*course_id).map(|_| ()),
        }
    }
}

/// Recomputes every known course against one shared calendar snapshot, at
/// most `sweep_workers` at a time. A failing course is counted and logged,
/// the rest still complete.
pub async fn sweep(cache: Arc<ReportCache>, today: NaiveDate) -> Result<SweepSummary, ForecastError> {
    let snapshot = cache.calendars.current()?;
    let courses = cache.schedules.courses()?;
    let semaphore = Arc::new(Semaphore::new(cache.policy.sweep_workers.max(1)));
    info!(
        courses = courses.len(),
        workers = cache.policy.sweep_workers.max(1),
        generation = snapshot.generation,
        "Starting report sweep"
    );

    let mut tasks = JoinSet::new();
    for course in courses {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let cache = Arc::clone(&cache);
        let snapshot = Arc::clone(&snapshot);
        tasks.spawn_blocking(move || {
            let _permit = permit;
            (course.id, cache.recompute_with(&snapshot, course.id, today))
        });
    }

    let mut summary = SweepSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(Some(_)))) => summary.recomputed += 1,
            Ok((_, Ok(None))) => summary.skipped += 1,
            Ok((course_id, Err(err))) => {
                error!(%course_id, error = %err, "Report recompute failed");
                summary.failed += 1;
                summary.failed_courses.push(course_id);
            }
            Err(err) => {
                error!(error = %err, "Report recompute task did not finish");
                summary.failed += 1;
            }
        }
    }
    summary.failed_courses.sort();

    info!(
        recomputed = summary.recomputed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Report sweep finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Weekday;

    use super::*;
    use crate::calendar::tests::{date, september_snapshot};
    use crate::eligibility::ForecastStatus;
    use crate::models::{AttendanceHistory, Course, WeeklyPattern};
    use crate::store::MemoryStore;

    fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.load_snapshot(september_snapshot());
        store
    }

    fn add_course(store: &MemoryStore, code: &str, student_id: Uuid, history: Option<AttendanceHistory>) -> Uuid {
        let course = Course {
            id: Uuid::new_v4(),
            student_id,
            code: code.to_string(),
            name: code.to_string(),
            start_date: Some(date(2026, 9, 1)),
        };
        let course_id = course.id;
        store.put_course(course);
        store.set_pattern(
            course_id,
            WeeklyPattern::from_entries([(Weekday::Tue, 2), (Weekday::Thu, 1)]).unwrap(),
        );
        if let Some(history) = history {
            store.set_history(course_id, history);
        }
        course_id
    }

    fn cache_over(store: &Arc<MemoryStore>) -> ReportCache {
        ReportCache::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            ForecastPolicy::default(),
        )
    }

    fn aggregate(conducted: u32, attended: u32) -> Option<AttendanceHistory> {
        Some(AttendanceHistory::Aggregate { conducted, attended })
    }

    #[test]
    fn recompute_is_idempotent() {
        let store = seeded_store();
        let course_id = add_course(&store, "MAT2002", Uuid::new_v4(), aggregate(10, 8));
        let cache = cache_over(&store);

        let first = cache.recompute(course_id, date(2026, 9, 1)).unwrap().unwrap();
        let mut second = cache.recompute(course_id, date(2026, 9, 1)).unwrap().unwrap();
        second.computed_at = first.computed_at;
        assert_eq!(first, second);
    }

    #[test]
    fn calendar_change_makes_reports_stale_until_recomputed() {
        let store = seeded_store();
        let course_id = add_course(&store, "MAT2002", Uuid::new_v4(), aggregate(10, 8));
        let cache = cache_over(&store);

        assert_eq!(cache.state(course_id).unwrap(), ReportState::Absent);
        cache.recompute(course_id, date(2026, 9, 1)).unwrap();
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Fresh);

        store
            .update_calendar(|snapshot| {
                snapshot.holidays.clear();
                Ok(())
            })
            .unwrap();
        // generation moved on without anyone flagging the report
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Stale);

        let report = cache.report(course_id, date(2026, 9, 1)).unwrap().unwrap();
        assert_eq!(report.calendar_generation, 2);
        // Thursday the 10th is a class day again
        assert_eq!(report.future_sessions, 10);
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Fresh);
    }

    #[test]
    fn courses_without_history_get_no_report() {
        let store = seeded_store();
        let course_id = add_course(&store, "MAT2002", Uuid::new_v4(), None);
        let cache = cache_over(&store);

        assert!(cache.recompute(course_id, date(2026, 9, 1)).unwrap().is_none());
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Absent);
    }

    #[test]
    fn student_reports_are_sorted_by_code() {
        let store = seeded_store();
        let student = Uuid::new_v4();
        add_course(&store, "PHY1001", student, aggregate(40, 40));
        add_course(&store, "CSE1001", student, aggregate(4, 2));
        add_course(&store, "MAT2002", student, None);
        add_course(&store, "ENG1001", Uuid::new_v4(), aggregate(4, 4));
        let cache = cache_over(&store);

        let forecast = cache.reports_for_student(student, date(2026, 9, 1)).unwrap();
        let codes: Vec<_> = forecast.reports.iter().map(|r| r.course_code.as_str()).collect();
        assert_eq!(codes, vec!["CSE1001", "PHY1001"]);
        assert_eq!(forecast.reports[1].status(), ForecastStatus::Safe);
        assert!(forecast.failures.is_empty());
    }

    #[test]
    fn student_reports_name_courses_that_cannot_be_forecast() {
        let store = seeded_store();
        let student = Uuid::new_v4();
        add_course(&store, "CSE1001", student, aggregate(4, 2));
        let unscheduled = add_course(&store, "MAT2002", student, aggregate(10, 8));
        store.set_pattern(unscheduled, WeeklyPattern::default());
        let cache = cache_over(&store);

        let forecast = cache.reports_for_student(student, date(2026, 9, 1)).unwrap();
        assert_eq!(forecast.reports.len(), 1);
        assert_eq!(forecast.failures.len(), 1);
        let (course, err) = &forecast.failures[0];
        assert_eq!(course.code, "MAT2002");
        assert!(matches!(err, ForecastError::InvalidCourseState { .. }));
    }

    #[test]
    fn stale_report_is_served_when_recompute_fails() {
        let store = seeded_store();
        let course_id = add_course(&store, "MAT2002", Uuid::new_v4(), aggregate(10, 8));
        let cache = cache_over(&store);
        cache.recompute(course_id, date(2026, 9, 1)).unwrap();

        store.set_pattern(course_id, WeeklyPattern::default());
        cache.mark_stale(course_id).unwrap();

        let report = cache.report(course_id, date(2026, 9, 1)).unwrap().unwrap();
        assert!(report.stale);
        assert_eq!(report.future_sessions, 9);
    }

    #[test]
    fn attendance_event_recomputes_eagerly() {
        let store = seeded_store();
        let course_id = add_course(&store, "MAT2002", Uuid::new_v4(), aggregate(10, 8));
        let cache = cache_over(&store);

        cache
            .on_event(&InvalidationEvent::AttendanceRecorded {
                course_id,
                today: date(2026, 9, 1),
            })
            .unwrap();
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Fresh);

        cache.on_event(&InvalidationEvent::ScheduleChanged { course_id }).unwrap();
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Stale);

        cache.on_event(&InvalidationEvent::CourseDeleted { course_id }).unwrap();
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Absent);
    }

    #[test]
    fn emptied_history_drops_the_report() {
        let store = seeded_store();
        let course_id = add_course(&store, "MAT2002", Uuid::new_v4(), aggregate(10, 8));
        let cache = cache_over(&store);
        cache.recompute(course_id, date(2026, 9, 1)).unwrap();

        store.set_history(course_id, AttendanceHistory::Aggregate { conducted: 0, attended: 0 });
        cache
            .on_event(&InvalidationEvent::AttendanceRecorded {
                course_id,
                today: date(2026, 9, 1),
            })
            .unwrap();
        assert_eq!(cache.state(course_id).unwrap().as_str(), "absent");
    }

    /// Fails every lookup for one course while it is marked broken.
    struct FlakyHistories {
        inner: Arc<MemoryStore>,
        broken: parking_lot::Mutex<Option<Uuid>>,
    }

    impl FlakyHistories {
        fn new(inner: Arc<MemoryStore>, broken: Option<Uuid>) -> Self {
            FlakyHistories {
                inner,
                broken: parking_lot::Mutex::new(broken),
            }
        }
    }

    impl AttendanceHistoryStore for FlakyHistories {
        fn history(&self, course_id: Uuid) -> Result<Option<AttendanceHistory>, StoreError> {
            if *self.broken.lock() == Some(course_id) {
                return Err(StoreError::Unavailable("attendance shard offline".to_string()));
            }
            self.inner.history(course_id)
        }
    }

    #[test]
    fn failed_attendance_recompute_is_reported_and_leaves_the_report_stale() {
        let store = seeded_store();
        let course_id = add_course(&store, "MAT2002", Uuid::new_v4(), aggregate(10, 8));
        let histories = Arc::new(FlakyHistories::new(store.clone(), None));
        let cache = ReportCache::new(
            store.clone(),
            store.clone(),
            histories.clone(),
            store.clone(),
            ForecastPolicy::default(),
        );
        cache.recompute(course_id, date(2026, 9, 1)).unwrap();

        store.set_history(course_id, AttendanceHistory::Aggregate { conducted: 20, attended: 5 });
        *histories.broken.lock() = Some(course_id);
        let result = cache.on_event(&InvalidationEvent::AttendanceRecorded {
            course_id,
            today: date(2026, 9, 1),
        });
        assert!(matches!(result, Err(ForecastError::ComputationFailure { .. })));
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Stale);

        *histories.broken.lock() = None;
        let report = cache.report(course_id, date(2026, 9, 1)).unwrap().unwrap();
        assert_eq!((report.total_conducted, report.attended), (20, 5));
        assert_eq!(cache.state(course_id).unwrap(), ReportState::Fresh);
    }

    #[tokio::test]
    async fn sweep_isolates_failing_courses() {
        let store = seeded_store();
        let student = Uuid::new_v4();
        let healthy = add_course(&store, "CSE1001", student, aggregate(10, 8));
        let broken = add_course(&store, "MAT2002", student, aggregate(10, 8));
        add_course(&store, "PHY1001", student, None);
        let dated = add_course(
            &store,
            "ENG1001",
            student,
            Some(AttendanceHistory::Dated {
                records: BTreeMap::from([(date(2026, 9, 1), true)]),
            }),
        );

        let histories = Arc::new(FlakyHistories::new(store.clone(), Some(broken)));
        let cache = Arc::new(ReportCache::new(
            store.clone(),
            store.clone(),
            histories,
            store.clone(),
            ForecastPolicy {
                lookback_months: 6,
                sweep_workers: 2,
            },
        ));

        let summary = sweep(cache.clone(), date(2026, 9, 1)).await.unwrap();
        assert_eq!(summary.recomputed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_courses, vec![broken]);

        assert_eq!(cache.state(healthy).unwrap(), ReportState::Fresh);
        assert_eq!(cache.state(dated).unwrap(), ReportState::Fresh);
        assert_eq!(cache.state(broken).unwrap(), ReportState::Absent);
    }
}
