//! Threshold and eligibility math. No I/O.
//!
//! Two rounding policies live here side by side. The semester-wide status
//! works on the exact requirement `T * (conducted + future) - attended` and
//! rounds it up to whole sessions. Milestone eligibility instead searches for
//! the smallest attended count whose percentage, rounded up to a whole
//! percent, reaches the threshold. The two can disagree by a session near
//! the boundary; both are kept as they are.
//!
//! Thresholds are whole percentages, so all comparisons run on integers
//! scaled by 100.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::{AcademicCalendar, Milestone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    /// 75%.
    Standard,
    /// 65%, granted on medical or similar grounds.
    Relaxed,
}

impl Threshold {
    pub fn percent(self) -> u32 {
        match self {
            Threshold::Standard => 75,
            Threshold::Relaxed => 65,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForecastStatus {
    Impossible,
    AtRisk,
    Safe,
}

impl ForecastStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ForecastStatus::Impossible => "IMPOSSIBLE",
            ForecastStatus::AtRisk => "AT_RISK",
            ForecastStatus::Safe => "SAFE",
        }
    }
}

/// Sessions conducted and attended so far. Never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    conducted: u32,
    attended: u32,
}

impl Tally {
    /// `None` when nothing has been conducted yet or the counts are inconsistent.
    pub fn new(conducted: u32, attended: u32) -> Option<Self> {
        (conducted > 0 && attended <= conducted).then_some(Tally {
            conducted,
            attended,
        })
    }

    pub fn conducted(&self) -> u32 {
        self.conducted
    }

    pub fn attended(&self) -> u32 {
        self.attended
    }

    pub fn current_percentage(&self) -> f64 {
        f64::from(self.attended) / f64::from(self.conducted) * 100.0
    }
}

/// Semester-wide outlook at one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdForecast {
    pub threshold: Threshold,
    pub status: ForecastStatus,
    /// Further sessions to attend. `future + 1` when out of reach.
    pub min_required: u32,
    pub max_skip: u32,
}

pub fn assess_overall(tally: Tally, future: u32, threshold: Threshold) -> ThresholdForecast {
    let percent = i64::from(threshold.percent());
    let attended = i64::from(tally.attended);
    let future_sessions = i64::from(future);
    let total = i64::from(tally.conducted) + future_sessions;

    // need * 100
    let scaled_need = percent * total - 100 * attended;
    let (status, min_required) = if scaled_need <= 0 {
        (ForecastStatus::Safe, 0)
    } else if scaled_need > 100 * future_sessions {
        (ForecastStatus::Impossible, future.saturating_add(1))
    } else {
        let sessions = (scaled_need + 99) / 100;
        (ForecastStatus::AtRisk, to_count(sessions))
    };

    let scaled_slack = 100 * (attended + future_sessions) - percent * total;
    let max_skip = to_count(scaled_slack.div_euclid(100));

    ThresholdForecast {
        threshold,
        status,
        min_required,
        max_skip,
    }
}

/// Outlook towards a single milestone at one threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MilestoneEligibility {
    pub threshold: Threshold,
    /// Further sessions to attend before the milestone. `future + 1` when no
    /// attended count reaches the threshold.
    pub additional_needed: u32,
    pub max_skip: u32,
    pub eligible: bool,
    /// Rounded-up percentage after attending `additional_needed` sessions,
    /// capped at what the remaining sessions allow.
    pub projected_percentage: f64,
}

/// Rounded-up whole percentage of `attended` over `total`.
fn ceil_percent(attended: u32, total: u32) -> u32 {
    let scaled = u64::from(attended) * 100;
    let total = u64::from(total);
    u32::try_from(scaled.div_ceil(total)).unwrap_or(u32::MAX)
}

pub fn assess_milestone(tally: Tally, future_until: u32, threshold: Threshold) -> MilestoneEligibility {
    let total = tally.conducted.saturating_add(future_until);
    let first = tally.attended;
    let last = tally.attended.saturating_add(future_until);

    let reached = (first..=last).find(|candidate| ceil_percent(*candidate, total) >= threshold.percent());
    let additional_needed = match reached {
        Some(candidate) => candidate - first,
        None => future_until.saturating_add(1),
    };

    let eligible = additional_needed <= future_until;
    let attainable = additional_needed.min(future_until);
    MilestoneEligibility {
        threshold,
        additional_needed,
        max_skip: future_until.saturating_sub(additional_needed),
        eligible,
        projected_percentage: f64::from(ceil_percent(first + attainable, total)),
    }
}

/// The first milestone, in CAT-1, CAT-2, FAT order, that starts after `today`.
pub fn upcoming_milestone(calendar: &AcademicCalendar, today: NaiveDate) -> Option<&Milestone> {
    crate::models::MilestoneKind::PRIORITY
        .iter()
        .filter_map(|kind| calendar.milestone(*kind))
        .find(|milestone| milestone.start > today)
}

fn to_count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}
