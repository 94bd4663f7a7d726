//! Agent-facing surface.
//!
//! The conversational layer talks to the engine exclusively through this
//! facade: analysis and read paths, plus a manual tick for hosts that drive
//! the schedule themselves. Write access to observations is a thin append.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::clock;
use crate::config::EngineConfig;
use crate::db::SharedDb;
use crate::detector::{default_detector, generate_insights, PatternDetector};
use crate::dispatch::{DeliveryChannel, Dispatcher};
use crate::error::EngineError;
use crate::scheduler::Scheduler;
use crate::signals;
use crate::types::{
    Alert, DailySummary, Notification, Observation, ObservationKind, PatternReport,
    PatternSummary, UserProfile,
};

pub struct Engine {
    db: SharedDb,
    config: EngineConfig,
    detector: PatternDetector,
    scheduler: Scheduler,
}

impl Engine {
    pub fn new(db: SharedDb, config: EngineConfig) -> Self {
        Self::with_channels(db, config, Vec::new())
    }

    /// Build an engine with external delivery channels on top of the
    /// always-present log channel.
    pub fn with_channels(
        db: SharedDb,
        config: EngineConfig,
        channels: Vec<Arc<dyn DeliveryChannel>>,
    ) -> Self {
        let mut dispatcher = Dispatcher::new(db.clone(), config.clone());
        for channel in channels {
            dispatcher.add_channel(channel);
        }
        let scheduler = Scheduler::new(db.clone(), config.clone(), Arc::new(dispatcher));
        Self {
            db,
            config,
            detector: default_detector(),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn require_user(&self, user_id: &str) -> Result<UserProfile, EngineError> {
        self.db
            .lock()
            .get_user(user_id)?
            .ok_or_else(|| EngineError::UnknownUser(user_id.to_string()))
    }

    /// Append an observation for a user.
    pub fn record_observation(&self, observation: &Observation) -> Result<String, EngineError> {
        self.require_user(&observation.user_id)?;
        self.db.lock().insert_observation(observation)
    }

    /// Run the detector over the user's recent window and return concerns,
    /// insights, and the aggregate summary. Read-only: no notifications are
    /// created and sustain streaks are untouched.
    pub fn analyze_patterns(&self, user_id: &str) -> Result<PatternReport, EngineError> {
        self.require_user(user_id)?;
        let now = Utc::now();
        let observations = {
            let db = self.db.lock();
            db.get_observations(
                user_id,
                None,
                now - Duration::days(self.config.window_days as i64),
            )?
        };
        let windows = signals::extract(&observations, now, self.config.window_days);
        let concerns = self.detector.run(&windows, &self.config);
        let insights = generate_insights(&windows);

        Ok(PatternReport {
            insights,
            concerns,
            summary: PatternSummary {
                activities_this_week: windows.activity.total_sessions as usize,
                moods_logged: windows.mood.entries as usize,
                active_days: windows.activity.active_days as usize,
            },
        })
    }

    /// Notifications for a user, newest first.
    pub fn get_notifications(
        &self,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Notification>, EngineError> {
        self.require_user(user_id)?;
        self.db.lock().get_notifications(user_id, unread_only)
    }

    /// Mark a notification read. Idempotent; read is terminal.
    pub fn dismiss_notification(&self, id: &str) -> Result<(), EngineError> {
        self.db.lock().mark_notification_read(id)
    }

    /// Family-facing alert history for the last `days`.
    pub fn get_alert_history(&self, user_id: &str, days: u32) -> Result<Vec<Alert>, EngineError> {
        self.require_user(user_id)?;
        self.db.lock().get_alerts(user_id, days)
    }

    pub fn acknowledge_alert(&self, id: &str) -> Result<(), EngineError> {
        self.db.lock().acknowledge_alert(id)
    }

    /// Today's rollup in the user's local day.
    pub fn get_daily_summary(&self, user_id: &str) -> Result<DailySummary, EngineError> {
        let user = self.require_user(user_id)?;
        let tz = clock::parse_tz(&user.timezone)?;
        let now = Utc::now();
        let today = clock::local_day(tz, now);

        let recent = {
            let db = self.db.lock();
            db.get_observations(user_id, None, now - Duration::hours(24))?
        };
        let todays: Vec<Observation> = recent
            .into_iter()
            .filter(|o| clock::local_day(tz, o.timestamp) == today)
            .collect();

        let windows = signals::extract(&todays, now, 1);
        Ok(DailySummary {
            date: today,
            mood_trend: windows.mood.trend.as_str().to_string(),
            activities_count: windows.activity.total_sessions as usize,
            total_active_minutes: windows.activity.total_active_minutes,
            expenses_total: windows.expense.total,
        })
    }

    /// Manual tick: claim and run everything due at `now`.
    pub async fn run_due_tasks(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        self.scheduler.run_due_tasks(now).await
    }

    /// Register the task roster. Safe to call on every startup.
    pub fn seed_roster(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.scheduler.seed_roster(now)
    }
}

// Re-exported here so hosts can ingest without reaching into the db module.
pub use crate::db::NotificationWrite;
pub use crate::types::Category;
