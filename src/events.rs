//! Change notifications that keep cached reports honest.
//!
//! Writers publish after their change is applied; listeners run in
//! subscription order on the publishing thread. A failing listener does not
//! stop the others, and the first failure is handed back to the writer.

use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::ForecastError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationEvent {
    CalendarReplaced {
        calendar_id: i64,
        generation: u64,
    },
    HolidaysChanged {
        generation: u64,
        added: usize,
        removed: usize,
    },
    ScheduleChanged {
        course_id: Uuid,
    },
    AttendanceRecorded {
        course_id: Uuid,
        today: NaiveDate,
    },
    CourseDeleted {
        course_id: Uuid,
    },
}

impl InvalidationEvent {
    /// Calendar-wide events touch every course.
    pub fn course_id(&self) -> Option<Uuid> {
        match self {
            InvalidationEvent::CalendarReplaced { .. } | InvalidationEvent::HolidaysChanged { .. } => None,
            InvalidationEvent::ScheduleChanged { course_id }
            | InvalidationEvent::AttendanceRecorded { course_id, .. }
            | InvalidationEvent::CourseDeleted { course_id } => Some(*course_id),
        }
    }
}

pub trait InvalidationListener: Send + Sync {
    fn on_event(&self, event: &InvalidationEvent) -> Result<(), ForecastError>;
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        self.listeners.write().push(listener);
    }

    pub fn publish(&self, event: InvalidationEvent) -> Result<(), ForecastError> {
        let listeners = self.listeners.read().clone();
        debug!(?event, listeners = listeners.len(), "Publishing invalidation event");
        let mut first_failure = None;
        for listener in listeners {
            if let Err(err) = listener.on_event(&event) {
                error!(course_id = ?event.course_id(), error = %err, "Invalidation listener failed");
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}
