//! CSV imports for holidays and per-date attendance marks.

use std::collections::BTreeMap;
use std::io::Read;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::store::ScheduleStore;

#[derive(Debug, Deserialize)]
struct HolidayRow {
    date: NaiveDate,
    reason: String,
}

/// `date,reason` rows.
pub fn read_holidays<R: Read>(reader: R) -> anyhow::Result<Vec<(NaiveDate, String)>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut holidays = Vec::new();
    for result in reader.deserialize::<HolidayRow>() {
        let row = result?;
        holidays.push((row.date, row.reason.trim().to_string()));
    }
    Ok(holidays)
}

#[derive(Debug, Deserialize)]
struct MarkRow {
    student_id: Uuid,
    course_code: String,
    date: NaiveDate,
    attended: bool,
}

#[derive(Debug, Default)]
pub struct MarkImport {
    pub marks: BTreeMap<Uuid, BTreeMap<NaiveDate, bool>>,
    /// Rows naming a course the student is not enrolled in.
    pub unmatched: usize,
}

/// `student_id,course_code,date,attended` rows, grouped by course. A later
/// row for the same course and date wins.
pub fn read_marks<R: Read>(reader: R, schedules: &dyn ScheduleStore) -> anyhow::Result<MarkImport> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut import = MarkImport::default();
    let mut enrolments: BTreeMap<(Uuid, String), Uuid> = BTreeMap::new();

    for result in reader.deserialize::<MarkRow>() {
        let row = result?;
        let code = row.course_code.trim().to_string();
        let key = (row.student_id, code);

        let course_id = match enrolments.get(&key) {
            Some(course_id) => Some(*course_id),
            None => {
                let found = schedules
                    .courses_for_student(row.student_id)?
                    .into_iter()
                    .find(|course| course.code == key.1)
                    .map(|course| course.id);
                if let Some(course_id) = found {
                    enrolments.insert(key.clone(), course_id);
                }
                found
            }
        };

        match course_id {
            Some(course_id) => {
                import.marks.entry(course_id).or_default().insert(row.date, row.attended);
            }
            None => {
                warn!(student_id = %key.0, code = %key.1, date = %row.date, "No matching course, mark skipped");
                import.unmatched += 1;
            }
        }
    }

    Ok(import)
}
