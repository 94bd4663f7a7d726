//! Pattern detector: a registry of independent threshold rules.
//!
//! Rules are pure functions from signal windows to an optional Concern. Each
//! rule fires on its own; one run can produce several Concerns. The detector
//! never touches the store, which keeps a run idempotent and makes rules
//! trivially testable against synthetic windows.

use chrono::Utc;

use crate::config::EngineConfig;
use crate::signals::{MoodTrend, SignalWindows};
use crate::types::{Concern, ConcernType, Insight, Urgency};

/// Function signature for a detection rule.
pub type RuleFn = fn(&SignalWindows, &EngineConfig) -> Option<Concern>;

#[derive(Clone)]
pub struct RuleEntry {
    pub name: String,
    pub rule: RuleFn,
}

/// Ordered rule registry. Order affects only the output listing, never
/// whether a rule fires.
#[derive(Clone, Default)]
pub struct PatternDetector {
    rules: Vec<RuleEntry>,
}

impl PatternDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, rule: RuleFn) {
        self.rules.push(RuleEntry {
            name: name.to_string(),
            rule,
        });
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Evaluate every rule against the windows. All matching rules fire.
    pub fn run(&self, windows: &SignalWindows, config: &EngineConfig) -> Vec<Concern> {
        let mut concerns = Vec::new();
        for entry in &self.rules {
            if let Some(concern) = (entry.rule)(windows, config) {
                log::info!(
                    "Rule '{}' fired: {} ({})",
                    entry.name,
                    concern.concern_type,
                    concern.urgency
                );
                concerns.push(concern);
            }
        }
        concerns
    }
}

/// Build the detector with the five canonical rules registered.
pub fn default_detector() -> PatternDetector {
    let mut detector = PatternDetector::new();
    detector.register("low_activity", rule_low_activity);
    detector.register("social_isolation", rule_social_isolation);
    detector.register("negative_mood", rule_negative_mood);
    detector.register("low_energy", rule_low_energy);
    detector.register("routine_inconsistency", rule_routine_inconsistency);
    detector
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn rule_low_activity(windows: &SignalWindows, config: &EngineConfig) -> Option<Concern> {
    let sessions = windows.activity.exercise_sessions;
    if sessions >= config.min_exercise_sessions {
        return None;
    }
    Some(Concern {
        concern_type: ConcernType::LowActivity,
        evidence_days: windows.window_days,
        urgency: Urgency::Medium,
        message: format!(
            "Only {} exercise session{} in the last {} days",
            sessions,
            if sessions == 1 { "" } else { "s" },
            windows.window_days
        ),
        suggested_action: "Suggest a short walk or gentle stretching today".to_string(),
        detected_at: Utc::now(),
    })
}

fn rule_social_isolation(windows: &SignalWindows, config: &EngineConfig) -> Option<Concern> {
    // No social observation at all counts as the full window
    let days = windows
        .social
        .days_since_last_social
        .unwrap_or(windows.window_days);
    if days < config.isolation_days {
        return None;
    }
    Some(Concern {
        concern_type: ConcernType::SocialIsolation,
        evidence_days: days,
        urgency: Urgency::Medium,
        message: format!("No social contact recorded in {} days", days),
        suggested_action: "Suggest calling a friend or family member".to_string(),
        detected_at: Utc::now(),
    })
}

fn rule_negative_mood(windows: &SignalWindows, config: &EngineConfig) -> Option<Concern> {
    let concerning = windows.mood.concerning;
    if concerning < config.negative_mood_count {
        return None;
    }
    Some(Concern {
        concern_type: ConcernType::NegativeMood,
        evidence_days: windows.window_days,
        urgency: Urgency::Medium,
        message: format!(
            "{} difficult mood entries in the last {} days",
            concerning, windows.window_days
        ),
        suggested_action: "Check in gently and suggest a favorite activity".to_string(),
        detected_at: Utc::now(),
    })
}

fn rule_low_energy(windows: &SignalWindows, config: &EngineConfig) -> Option<Concern> {
    let mean = windows.mood.mean_energy?;
    if mean >= config.low_energy_mean {
        return None;
    }
    Some(Concern {
        concern_type: ConcernType::LowEnergy,
        evidence_days: windows.window_days,
        urgency: Urgency::High,
        message: format!(
            "Average energy level {:.1} over the last {} days",
            mean, windows.window_days
        ),
        suggested_action: "Ask about sleep and consider mentioning it to family".to_string(),
        detected_at: Utc::now(),
    })
}

fn rule_routine_inconsistency(windows: &SignalWindows, config: &EngineConfig) -> Option<Concern> {
    let active_days = windows.activity.active_days;
    if active_days >= config.min_active_days {
        return None;
    }
    Some(Concern {
        concern_type: ConcernType::RoutineInconsistency,
        evidence_days: windows.window_days,
        urgency: Urgency::Low,
        message: format!(
            "Active on only {} of the last {} days",
            active_days, windows.window_days
        ),
        suggested_action: "Encourage a small daily routine, like a morning walk".to_string(),
        detected_at: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Insights
// ---------------------------------------------------------------------------

/// Positive observations surfaced alongside concerns. Insights never
/// escalate or produce notifications.
pub fn generate_insights(windows: &SignalWindows) -> Vec<Insight> {
    let mut insights = Vec::new();

    if windows.activity.total_sessions >= 5 {
        insights.push(Insight {
            message: format!(
                "Active {} times this week, keep it up!",
                windows.activity.total_sessions
            ),
        });
    }

    if windows.mood.trend == MoodTrend::Positive {
        insights.push(Insight {
            message: "Mood has been mostly positive this week".to_string(),
        });
    }

    if windows.social.social_count >= 3 {
        insights.push(Insight {
            message: format!(
                "{} social activities this week, wonderful!",
                windows.social.social_count
            ),
        });
    }

    insights
}
