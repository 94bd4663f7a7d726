//! Core domain types shared across the engine.
//!
//! Everything here is plain data: the detector, dispatcher, and scheduler
//! exchange these values but never hide behavior inside them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Urgency
// =============================================================================

/// Urgency level. Totally ordered: Low < Medium < High < Critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Urgency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Urgency::Low),
            "medium" => Ok(Urgency::Medium),
            "high" => Ok(Urgency::High),
            "critical" => Ok(Urgency::Critical),
            _ => Err(format!("Unknown urgency: {}", s)),
        }
    }
}

// =============================================================================
// Observations
// =============================================================================

/// Kind of a recorded observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationKind {
    Activity,
    Mood,
    Expense,
}

impl ObservationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::Activity => "activity",
            ObservationKind::Mood => "mood",
            ObservationKind::Expense => "expense",
        }
    }
}

impl std::str::FromStr for ObservationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activity" => Ok(ObservationKind::Activity),
            "mood" => Ok(ObservationKind::Mood),
            "expense" => Ok(ObservationKind::Expense),
            _ => Err(format!("Unknown observation kind: {}", s)),
        }
    }
}

/// A single timestamped user data point. Immutable once recorded.
///
/// Interpretation by kind:
/// - activity: `subtype` = activity type (walking, social, ...), `value` = duration minutes
/// - mood: `subtype` = mood label (happy, sad, ...), `value` = energy level 1-10
/// - expense: `subtype` = category, `value` = amount
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub user_id: String,
    pub kind: ObservationKind,
    pub subtype: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Mood labels counted as positive when voting on the weekly trend.
pub const POSITIVE_MOODS: &[&str] = &["happy", "content", "energetic", "grateful"];

/// Mood labels counted as concerning when voting on the weekly trend.
pub const CONCERNING_MOODS: &[&str] = &["sad", "anxious", "lonely", "tired"];

/// Activity subtypes that count as social contact.
pub const SOCIAL_SUBTYPES: &[&str] = &["social", "phone_call"];

/// Activity subtypes that count as physical exercise.
pub const EXERCISE_SUBTYPES: &[&str] = &["walking", "exercise"];

// =============================================================================
// Concerns and insights
// =============================================================================

/// Detected behavioral deviation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcernType {
    LowActivity,
    SocialIsolation,
    NegativeMood,
    LowEnergy,
    RoutineInconsistency,
    Inactivity,
}

impl ConcernType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcernType::LowActivity => "low_activity",
            ConcernType::SocialIsolation => "social_isolation",
            ConcernType::NegativeMood => "negative_mood",
            ConcernType::LowEnergy => "low_energy",
            ConcernType::RoutineInconsistency => "routine_inconsistency",
            ConcernType::Inactivity => "inactivity",
        }
    }
}

impl std::fmt::Display for ConcernType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConcernType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low_activity" => Ok(ConcernType::LowActivity),
            "social_isolation" => Ok(ConcernType::SocialIsolation),
            "negative_mood" => Ok(ConcernType::NegativeMood),
            "low_energy" => Ok(ConcernType::LowEnergy),
            "routine_inconsistency" => Ok(ConcernType::RoutineInconsistency),
            "inactivity" => Ok(ConcernType::Inactivity),
            _ => Err(format!("Unknown concern type: {}", s)),
        }
    }
}

/// A detected behavioral deviation, valid for one detector run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Concern {
    #[serde(rename = "type")]
    pub concern_type: ConcernType,
    /// Length of the evidence window in days. Always multi-day.
    pub evidence_days: u32,
    pub urgency: Urgency,
    pub message: String,
    pub suggested_action: String,
    pub detected_at: DateTime<Utc>,
}

/// A positive observation surfaced alongside concerns. Never escalates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub message: String,
}

// =============================================================================
// Notifications and alerts
// =============================================================================

/// Notification category, mirroring the delivery surface grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Wellness,
    Reminder,
    Greeting,
    Health,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Wellness => "wellness",
            Category::Reminder => "reminder",
            Category::Greeting => "greeting",
            Category::Health => "health",
        }
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wellness" => Ok(Category::Wellness),
            "reminder" => Ok(Category::Reminder),
            "greeting" => Ok(Category::Greeting),
            "health" => Ok(Category::Health),
            _ => Err(format!("Unknown category: {}", s)),
        }
    }
}

/// A user-facing message produced by the dispatcher.
///
/// `read` is terminal (no un-reading); `repeat_count` counts dedup hits on
/// the same `(user_id, type, calendar_day)` key while the row is unread.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub message: String,
    pub urgency: Urgency,
    pub category: Category,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub repeat_count: i64,
}

/// A family-facing escalation of a sustained concern.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub user_id: String,
    pub message: String,
    pub urgency: Urgency,
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
}

// =============================================================================
// Scheduled tasks
// =============================================================================

/// Proactive task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    MorningGreeting,
    AfternoonCheckin,
    MedicationReminder,
    AppointmentReminder,
    InactivityCheck,
    WellnessSummary,
    PatternScan,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::MorningGreeting => "morning_greeting",
            TaskKind::AfternoonCheckin => "afternoon_checkin",
            TaskKind::MedicationReminder => "medication_reminder",
            TaskKind::AppointmentReminder => "appointment_reminder",
            TaskKind::InactivityCheck => "inactivity_check",
            TaskKind::WellnessSummary => "wellness_summary",
            TaskKind::PatternScan => "pattern_scan",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "morning_greeting" => Ok(TaskKind::MorningGreeting),
            "afternoon_checkin" => Ok(TaskKind::AfternoonCheckin),
            "medication_reminder" => Ok(TaskKind::MedicationReminder),
            "appointment_reminder" => Ok(TaskKind::AppointmentReminder),
            "inactivity_check" => Ok(TaskKind::InactivityCheck),
            "wellness_summary" => Ok(TaskKind::WellnessSummary),
            "pattern_scan" => Ok(TaskKind::PatternScan),
            _ => Err(format!("Unknown task kind: {}", s)),
        }
    }
}

/// Recurrence rule for a scheduled task.
///
/// Stored in SQLite as text: `interval:60` or `daily:08:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cadence {
    /// Fixed interval in minutes, evaluated in UTC.
    Interval { minutes: u32 },
    /// Daily at a local wall-clock time, evaluated in each user's timezone.
    DailyAt { hour: u8, minute: u8 },
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Interval { minutes } => write!(f, "interval:{}", minutes),
            Cadence::DailyAt { hour, minute } => write!(f, "daily:{:02}:{:02}", hour, minute),
        }
    }
}

impl std::str::FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(mins) = s.strip_prefix("interval:") {
            let minutes: u32 = mins
                .parse()
                .map_err(|_| format!("Invalid interval cadence: {}", s))?;
            if minutes == 0 {
                return Err(format!("Interval cadence must be positive: {}", s));
            }
            return Ok(Cadence::Interval { minutes });
        }
        if let Some(hm) = s.strip_prefix("daily:") {
            let (h, m) = hm
                .split_once(':')
                .ok_or_else(|| format!("Invalid daily cadence: {}", s))?;
            let hour: u8 = h
                .parse()
                .map_err(|_| format!("Invalid daily cadence: {}", s))?;
            let minute: u8 = m
                .parse()
                .map_err(|_| format!("Invalid daily cadence: {}", s))?;
            if hour > 23 || minute > 59 {
                return Err(format!("Daily cadence out of range: {}", s));
            }
            return Ok(Cadence::DailyAt { hour, minute });
        }
        Err(format!("Unknown cadence: {}", s))
    }
}

/// A persisted scheduled task. Mutated only by the scheduler via
/// atomic claim-and-advance on `next_run_at`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub kind: TaskKind,
    pub cadence: Cadence,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub failure_count: i64,
}

// =============================================================================
// Users and appointments
// =============================================================================

/// Minimal user profile consumed by the scheduler. Managed externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    /// IANA timezone name, e.g. "Asia/Kolkata".
    pub timezone: String,
    pub active: bool,
}

/// A scheduled appointment for the reminder task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub at: DateTime<Utc>,
    pub location: Option<String>,
    pub status: String,
    pub reminded_day_before: bool,
    pub reminded_two_hours: bool,
}

// =============================================================================
// Agent-facing payloads
// =============================================================================

/// Weekly aggregate summary returned by `analyze_patterns`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternSummary {
    pub activities_this_week: usize,
    pub moods_logged: usize,
    pub active_days: usize,
}

/// Full result of a pattern analysis run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternReport {
    pub insights: Vec<Insight>,
    pub concerns: Vec<Concern>,
    pub summary: PatternSummary,
}

/// Today's rollup for the agent's daily-summary read path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub date: String,
    pub mood_trend: String,
    pub activities_count: usize,
    pub total_active_minutes: f64,
    pub expenses_total: f64,
}
