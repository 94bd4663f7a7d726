//! Signal extractors: pure aggregation over observation slices.
//!
//! Every extractor is deterministic and order-independent; the same
//! observations in any order produce the same window. Nothing here touches
//! the store or the clock beyond the `now` passed in.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use crate::types::{
    Observation, ObservationKind, CONCERNING_MOODS, EXERCISE_SUBTYPES, POSITIVE_MOODS,
    SOCIAL_SUBTYPES,
};

/// Majority vote over the window's mood labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoodTrend {
    Positive,
    Stable,
    Concerning,
}

impl MoodTrend {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoodTrend::Positive => "positive",
            MoodTrend::Stable => "stable",
            MoodTrend::Concerning => "concerning",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityWindow {
    pub sessions_by_subtype: BTreeMap<String, u32>,
    pub total_sessions: u32,
    /// Sessions whose subtype counts as physical exercise.
    pub exercise_sessions: u32,
    pub total_active_minutes: f64,
    /// Distinct UTC calendar days with at least one activity.
    pub active_days: u32,
}

#[derive(Debug, Clone)]
pub struct MoodWindow {
    pub counts_by_label: BTreeMap<String, u32>,
    pub entries: u32,
    pub positive: u32,
    pub concerning: u32,
    /// None when the window has no mood entries.
    pub mean_energy: Option<f64>,
    pub trend: MoodTrend,
}

#[derive(Debug, Clone)]
pub struct SocialWindow {
    pub social_count: u32,
    /// Whole days since the most recent social observation, relative to
    /// `now`. None when the window has no social observation at all.
    pub days_since_last_social: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ExpenseWindow {
    pub total: f64,
    pub by_category: BTreeMap<String, f64>,
    /// Today's spend minus yesterday's (UTC days).
    pub day_over_day: f64,
}

/// All four windows over the same observation slice, computed once per
/// detector run.
#[derive(Debug, Clone)]
pub struct SignalWindows {
    pub window_days: u32,
    pub activity: ActivityWindow,
    pub mood: MoodWindow,
    pub social: SocialWindow,
    pub expense: ExpenseWindow,
}

fn in_window(obs: &Observation, now: DateTime<Utc>, window_days: u32) -> bool {
    let cutoff = now - Duration::days(window_days as i64);
    obs.timestamp >= cutoff && obs.timestamp <= now
}

pub fn activity_window(
    observations: &[Observation],
    now: DateTime<Utc>,
    window_days: u32,
) -> ActivityWindow {
    let mut window = ActivityWindow::default();
    let mut days = BTreeSet::new();

    for obs in observations {
        if obs.kind != ObservationKind::Activity || !in_window(obs, now, window_days) {
            continue;
        }
        *window.sessions_by_subtype.entry(obs.subtype.clone()).or_insert(0) += 1;
        window.total_sessions += 1;
        window.total_active_minutes += obs.value;
        if EXERCISE_SUBTYPES.contains(&obs.subtype.as_str()) {
            window.exercise_sessions += 1;
        }
        days.insert(obs.timestamp.date_naive());
    }

    window.active_days = days.len() as u32;
    window
}

pub fn mood_window(
    observations: &[Observation],
    now: DateTime<Utc>,
    window_days: u32,
) -> MoodWindow {
    let mut counts_by_label: BTreeMap<String, u32> = BTreeMap::new();
    let mut entries = 0u32;
    let mut positive = 0u32;
    let mut concerning = 0u32;
    let mut energy_sum = 0.0;

    for obs in observations {
        if obs.kind != ObservationKind::Mood || !in_window(obs, now, window_days) {
            continue;
        }
        *counts_by_label.entry(obs.subtype.clone()).or_insert(0) += 1;
        entries += 1;
        energy_sum += obs.value;
        if POSITIVE_MOODS.contains(&obs.subtype.as_str()) {
            positive += 1;
        } else if CONCERNING_MOODS.contains(&obs.subtype.as_str()) {
            concerning += 1;
        }
    }

    let trend = match positive.cmp(&concerning) {
        std::cmp::Ordering::Greater => MoodTrend::Positive,
        std::cmp::Ordering::Less => MoodTrend::Concerning,
        std::cmp::Ordering::Equal => MoodTrend::Stable,
    };

    MoodWindow {
        counts_by_label,
        entries,
        positive,
        concerning,
        mean_energy: if entries > 0 {
            Some(energy_sum / entries as f64)
        } else {
            None
        },
        trend,
    }
}

pub fn social_window(
    observations: &[Observation],
    now: DateTime<Utc>,
    window_days: u32,
) -> SocialWindow {
    let mut social_count = 0u32;
    let mut last_social: Option<DateTime<Utc>> = None;

    for obs in observations {
        if obs.kind != ObservationKind::Activity
            || !in_window(obs, now, window_days)
            || !SOCIAL_SUBTYPES.contains(&obs.subtype.as_str())
        {
            continue;
        }
        social_count += 1;
        if last_social.map_or(true, |t| obs.timestamp > t) {
            last_social = Some(obs.timestamp);
        }
    }

    SocialWindow {
        social_count,
        days_since_last_social: last_social.map(|t| (now - t).num_days().max(0) as u32),
    }
}

pub fn expense_window(
    observations: &[Observation],
    now: DateTime<Utc>,
    window_days: u32,
) -> ExpenseWindow {
    let mut window = ExpenseWindow::default();
    let today = now.date_naive();
    let yesterday = today - Duration::days(1);
    let mut today_total = 0.0;
    let mut yesterday_total = 0.0;

    for obs in observations {
        if obs.kind != ObservationKind::Expense || !in_window(obs, now, window_days) {
            continue;
        }
        window.total += obs.value;
        *window.by_category.entry(obs.subtype.clone()).or_insert(0.0) += obs.value;
        let day = obs.timestamp.date_naive();
        if day == today {
            today_total += obs.value;
        } else if day == yesterday {
            yesterday_total += obs.value;
        }
    }

    window.day_over_day = today_total - yesterday_total;
    window
}

/// Compute all windows in one pass over the slice boundary.
pub fn extract(
    observations: &[Observation],
    now: DateTime<Utc>,
    window_days: u32,
) -> SignalWindows {
    SignalWindows {
        window_days,
        activity: activity_window(observations, now, window_days),
        mood: mood_window(observations, now, window_days),
        social: social_window(observations, now, window_days),
        expense: expense_window(observations, now, window_days),
    }
}
