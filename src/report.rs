use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::cache::StudentForecast;
use crate::eligibility::{ForecastStatus, MilestoneEligibility, ThresholdForecast};
use crate::models::AttendanceReport;
use crate::projector::ClassDate;

pub fn count_by_status(reports: &[AttendanceReport]) -> BTreeMap<ForecastStatus, usize> {
    let mut counts = BTreeMap::new();
    for report in reports {
        *counts.entry(report.status()).or_insert(0) += 1;
    }
    counts
}

fn threshold_line(forecast: &ThresholdForecast) -> String {
    match forecast.status {
        ForecastStatus::Safe => format!(
            "{}% {}: can skip {} more",
            forecast.threshold.percent(),
            forecast.status.as_str(),
            forecast.max_skip
        ),
        ForecastStatus::AtRisk => format!(
            "{}% {}: attend {} more, can skip {}",
            forecast.threshold.percent(),
            forecast.status.as_str(),
            forecast.min_required,
            forecast.max_skip
        ),
        ForecastStatus::Impossible => format!(
            "{}% {}: out of reach this semester",
            forecast.threshold.percent(),
            forecast.status.as_str()
        ),
    }
}

fn milestone_line(eligibility: &MilestoneEligibility) -> String {
    if eligibility.eligible {
        format!(
            "{}% eligible: attend {} more, can skip {} (projected {:.0}%)",
            eligibility.threshold.percent(),
            eligibility.additional_needed,
            eligibility.max_skip,
            eligibility.projected_percentage
        )
    } else {
        format!(
            "{}% not reachable (best case {:.0}%)",
            eligibility.threshold.percent(),
            eligibility.projected_percentage
        )
    }
}

pub fn build_report(student_id: Uuid, today: NaiveDate, forecast: &StudentForecast) -> String {
    let reports = &forecast.reports;
    let mut output = String::new();

    let _ = writeln!(output, "# Attendance Forecast");
    let _ = writeln!(output, "Generated for student {} on {}", student_id, today);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");

    if reports.is_empty() && forecast.failures.is_empty() {
        let _ = writeln!(output, "No courses with recorded attendance.");
        return output;
    }

    for (status, count) in count_by_status(reports) {
        let _ = writeln!(output, "- {}: {} courses", status.as_str(), count);
    }

    for report in reports {
        let _ = writeln!(output);
        let _ = writeln!(output, "## {}", report.course_code);
        let _ = writeln!(
            output,
            "- Attended {} of {} ({:.2}%), {} sessions remaining",
            report.attended, report.total_conducted, report.current_percentage, report.future_sessions
        );
        let _ = writeln!(output, "- {}", threshold_line(&report.standard));
        let _ = writeln!(output, "- {}", threshold_line(&report.relaxed));

        match &report.milestone {
            Some(milestone) => {
                let _ = writeln!(
                    output,
                    "- Next milestone {} ({} to {}), {} sessions before it",
                    milestone.kind, milestone.start, milestone.end, milestone.future_sessions
                );
                let _ = writeln!(output, "  - {}", milestone_line(&milestone.standard));
                let _ = writeln!(output, "  - {}", milestone_line(&milestone.relaxed));
            }
            None => {
                let _ = writeln!(output, "- No upcoming milestone");
            }
        }

        if report.stale {
            let _ = writeln!(
                output,
                "- Computed {} and could not be refreshed",
                report.computed_at.format("%Y-%m-%d %H:%M UTC")
            );
        }
    }

    if !forecast.failures.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "## Not Forecast");
        for (course, err) in &forecast.failures {
            let _ = writeln!(output, "- {}: {}", course.code, err);
        }
    }

    output
}

pub fn class_date_lines(dates: &[ClassDate]) -> Vec<String> {
    dates
        .iter()
        .map(|entry| {
            let mark = match entry.attended {
                Some(true) => "present",
                Some(false) => "absent",
                None => "unmarked",
            };
            format!("{} {} x{} {}", entry.date, entry.weekday, entry.sessions, mark)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Utc, Weekday};

    use super::*;
    use crate::calendar::tests::date;
    use crate::cache::StudentForecast;
use crate::eligibility::{assess_milestone, assess_overall, Tally, Threshold};
    use crate::error::ForecastError;
    use crate::models::{Course, MilestoneForecast, MilestoneKind};

    fn report(code: &str, conducted: u32, attended: u32, future: u32) -> AttendanceReport {
        let tally = Tally::new(conducted, attended).unwrap();
        AttendanceReport {
            course_id: Uuid::new_v4(),
            student_id: Uuid::nil(),
            course_code: code.to_string(),
            calendar_generation: 1,
            total_conducted: conducted,
            attended,
            current_percentage: tally.current_percentage(),
            future_sessions: future,
            standard: assess_overall(tally, future, Threshold::Standard),
            relaxed: assess_overall(tally, future, Threshold::Relaxed),
            milestone: Some(MilestoneForecast {
                kind: MilestoneKind::Cat2,
                start: date(2026, 10, 6),
                end: date(2026, 10, 10),
                future_sessions: 3,
                standard: assess_milestone(tally, 3, Threshold::Standard),
                relaxed: assess_milestone(tally, 3, Threshold::Relaxed),
            }),
            stale: false,
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn statuses_are_counted() {
        let reports = vec![
            report("CSE1001", 10, 9, 0),
            report("MAT2002", 10, 8, 5),
            report("PHY1001", 10, 9, 0),
        ];
        let counts = count_by_status(&reports);
        assert_eq!(counts[&ForecastStatus::Safe], 2);
        assert_eq!(counts[&ForecastStatus::AtRisk], 1);
        assert!(!counts.contains_key(&ForecastStatus::Impossible));
    }

    #[test]
    fn report_lists_each_course() {
        let forecast = StudentForecast {
            reports: vec![report("MAT2002", 10, 8, 5), report("PHY1001", 10, 6, 5)],
            failures: Vec::new(),
        };
        let markdown = build_report(Uuid::nil(), date(2026, 9, 20), &forecast);

        assert!(markdown.starts_with("# Attendance Forecast"));
        assert!(markdown.contains("## MAT2002"));
        assert!(markdown.contains("- Attended 8 of 10 (80.00%), 5 sessions remaining"));
        assert!(markdown.contains("75% AT_RISK: attend 4 more, can skip 1"));
        assert!(markdown.contains("75% IMPOSSIBLE: out of reach this semester"));
        assert!(markdown.contains("Next milestone CAT-2 (2026-10-06 to 2026-10-10)"));
    }

    #[test]
    fn empty_report_says_so() {
        let markdown = build_report(Uuid::nil(), date(2026, 9, 20), &StudentForecast::default());
        assert!(markdown.contains("No courses with recorded attendance."));
    }

    #[test]
    fn courses_without_a_forecast_are_listed() {
        let course = Course {
            id: Uuid::new_v4(),
            student_id: Uuid::nil(),
            code: "ENG1001".to_string(),
            name: "Technical English".to_string(),
            start_date: None,
        };
        let err = ForecastError::InvalidCourseState {
            course_id: course.id,
            reason: "no weekly schedule",
        };
        let forecast = StudentForecast {
            reports: Vec::new(),
            failures: vec![(course, err)],
        };
        let markdown = build_report(Uuid::nil(), date(2026, 9, 20), &forecast);
        assert!(!markdown.contains("No courses with recorded attendance."));
        assert!(markdown.contains("## Not Forecast"));
        assert!(markdown.contains("- ENG1001: course "));
        assert!(markdown.contains("cannot be forecast: no weekly schedule"));
    }

    #[test]
    fn class_dates_render_marks() {
        let lines = class_date_lines(&[ClassDate {
            date: date(2026, 9, 1),
            weekday: Weekday::Tue,
            sessions: 2,
            attended: Some(false),
        }]);
        assert_eq!(lines, vec!["2026-09-01 Tue x2 absent".to_string()]);
    }
}
