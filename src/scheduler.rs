//! Proactive task scheduler.
//!
//! A single loop wakes every `tick_seconds`, claims due tasks with an atomic
//! compare-and-swap on `next_run_at`, and runs each task's handler for every
//! active user behind a bounded semaphore. The claim both wins the task and
//! advances its schedule, so a second claimer (or a second `run_due_tasks`
//! call at the same instant) finds nothing due. Per-user failures are logged
//! and counted on the task; they never stop the loop.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::clock;
use crate::config::EngineConfig;
use crate::db::{EscalationRow, SharedDb};
use crate::detector::{default_detector, generate_insights, PatternDetector};
use crate::dispatch::Dispatcher;
use crate::error::{with_retry, EngineError};
use crate::escalation::EscalationPolicy;
use crate::signals;
use crate::types::{
    Cadence, Category, ConcernType, Observation, ObservationKind, ScheduledTask, TaskKind,
    Urgency, UserProfile,
};

/// The full task roster with default cadences.
pub const TASK_ROSTER: &[(TaskKind, Cadence)] = &[
    (TaskKind::MorningGreeting, Cadence::DailyAt { hour: 8, minute: 0 }),
    (TaskKind::AfternoonCheckin, Cadence::DailyAt { hour: 14, minute: 0 }),
    (TaskKind::MedicationReminder, Cadence::Interval { minutes: 60 }),
    (TaskKind::AppointmentReminder, Cadence::Interval { minutes: 60 }),
    (TaskKind::InactivityCheck, Cadence::Interval { minutes: 120 }),
    (TaskKind::WellnessSummary, Cadence::DailyAt { hour: 18, minute: 0 }),
    (TaskKind::PatternScan, Cadence::DailyAt { hour: 10, minute: 0 }),
];

/// Cloning is cheap: the store, dispatcher, and worker pool are shared
/// handles. `execute_task` clones itself into each spawned user handler.
#[derive(Clone)]
pub struct Scheduler {
    db: SharedDb,
    config: EngineConfig,
    detector: PatternDetector,
    policy: EscalationPolicy,
    dispatcher: Arc<Dispatcher>,
    worker_permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(db: SharedDb, config: EngineConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let worker_permits = Arc::new(Semaphore::new(config.max_concurrent_users));
        Self {
            policy: EscalationPolicy::new(&config),
            detector: default_detector(),
            db,
            config,
            dispatcher,
            worker_permits,
        }
    }

    /// Register the roster. Existing rows keep their schedule, so a restart
    /// never re-fires or resets anything.
    pub fn seed_roster(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let users = self.db.lock().get_active_users()?;
        for (kind, cadence) in TASK_ROSTER {
            let first_run = self.next_occurrence(*cadence, now, &users);
            self.db.lock().seed_task(*kind, *cadence, first_run)?;
        }
        Ok(())
    }

    /// The scheduler loop. Each tick completes (all in-flight handlers are
    /// awaited) before the shutdown signal is honored.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let tick = std::time::Duration::from_secs(self.config.tick_seconds);
        log::info!("Scheduler loop started (tick every {:?})", tick);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {
                    log::info!("Scheduler loop stopping");
                    break;
                }
            }

            let now = Utc::now();
            match self.run_due_tasks(now).await {
                Ok(ran) if ran > 0 => log::info!("Tick ran {} task(s)", ran),
                Ok(_) => {}
                Err(e) => log::error!("Tick failed: {}", e),
            }
        }
    }

    /// One manual tick: claim and execute everything due at `now`, then
    /// drain deferred deliveries. Returns the number of tasks executed.
    /// Calling this twice with the same `now` runs each due task once.
    pub async fn run_due_tasks(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let due = {
            let db = self.db.clone();
            with_retry("due task query", move || db.lock().due_tasks(now)).await?
        };

        let mut ran = 0;
        for task in due {
            // A transient user-query failure skips this task, not the tick
            let users = {
                let db = self.db.clone();
                match with_retry("active user query", move || db.lock().get_active_users()).await {
                    Ok(users) => users,
                    Err(e) => {
                        log::error!("Skipping task {} this tick: {}", task.kind, e);
                        continue;
                    }
                }
            };
            let new_next = self.next_occurrence(task.cadence, now, &users);

            let claimed = self
                .db
                .lock()
                .claim_task(&task.id, task.next_run_at, new_next)?;
            if !claimed {
                // Another worker won this occurrence
                continue;
            }

            self.execute_task(&task, users, now).await;
            ran += 1;
        }

        let flushed = self.dispatcher.flush_deferred(now).await?;
        if flushed > 0 {
            log::info!("Delivered {} deferred notification(s)", flushed);
        }

        Ok(ran)
    }

    /// Run one claimed task for every user it applies to, in parallel behind
    /// the worker semaphore. All handlers are awaited before returning.
    async fn execute_task(&self, task: &ScheduledTask, users: Vec<UserProfile>, now: DateTime<Utc>) {
        let mut set = JoinSet::new();

        for user in users {
            if !self.applies_at(task, &user, now) {
                continue;
            }
            let scheduler = self.clone();
            let permits = Arc::clone(&self.worker_permits);
            let kind = task.kind;
            set.spawn(async move {
                // Semaphore closed only at shutdown
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Err(EngineError::TransientStore("worker pool closed".to_string()));
                };
                scheduler.execute_for_user(kind, &user, now).await
            });
        }

        let mut failures = 0u32;
        while let Some(result) = set.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::warn!("Task {} failed for one user: {}", task.kind, e);
                    failures += 1;
                }
                Err(e) => {
                    log::error!("Task {} handler panicked: {}", task.kind, e);
                    failures += 1;
                }
            }
        }

        let record = if failures > 0 {
            self.db.lock().record_task_failure(&task.id, now)
        } else {
            self.db.lock().record_task_success(&task.id, now)
        };
        if let Err(e) = record {
            log::error!("Failed to record result for task {}: {}", task.kind, e);
        }
    }

    /// Whether a claimed daily task is due for this particular user at `now`.
    /// Users in other timezones whose wall time has not arrived are skipped;
    /// their occurrence is the task's new `next_run_at`.
    fn applies_at(&self, task: &ScheduledTask, user: &UserProfile, now: DateTime<Utc>) -> bool {
        let Cadence::DailyAt { hour, minute } = task.cadence else {
            return true;
        };
        let Ok(tz) = clock::parse_tz(&user.timezone) else {
            // Let the handler surface the timezone error
            return true;
        };
        let occurrence =
            clock::next_local_occurrence(tz, task.next_run_at - Duration::seconds(1), hour, minute);
        occurrence <= now
    }

    /// The next `next_run_at` for a cadence: wall clock plus the interval, or
    /// the earliest upcoming local occurrence across active users.
    fn next_occurrence(
        &self,
        cadence: Cadence,
        now: DateTime<Utc>,
        users: &[UserProfile],
    ) -> DateTime<Utc> {
        match cadence {
            // Missed cycles are skipped, not replayed
            Cadence::Interval { minutes } => now + Duration::minutes(minutes as i64),
            Cadence::DailyAt { hour, minute } => users
                .iter()
                .filter_map(|u| clock::parse_tz(&u.timezone).ok())
                .map(|tz| clock::next_local_occurrence(tz, now, hour, minute))
                .min()
                .unwrap_or_else(|| {
                    clock::next_local_occurrence(chrono_tz::UTC, now, hour, minute)
                }),
        }
    }

    // =========================================================================
    // Task handlers
    // =========================================================================

    pub(crate) async fn execute_for_user(
        &self,
        kind: TaskKind,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        match kind {
            TaskKind::MorningGreeting => self.morning_greeting(user, now).await,
            TaskKind::AfternoonCheckin => self.afternoon_checkin(user, now).await,
            TaskKind::MedicationReminder => self.medication_reminder(user, now).await,
            TaskKind::AppointmentReminder => self.appointment_reminder(user, now).await,
            TaskKind::InactivityCheck => self.inactivity_check(user, now).await,
            TaskKind::WellnessSummary => self.wellness_summary(user, now).await,
            TaskKind::PatternScan => self.pattern_scan(user, now).await,
        }
    }

    async fn morning_greeting(
        &self,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.dispatcher
            .notify(
                user,
                "morning_greeting",
                &format!(
                    "Good morning, {}! What would you like to do today?",
                    user.name
                ),
                Urgency::Low,
                Category::Greeting,
                now,
            )
            .await?;
        Ok(())
    }

    /// Only reaches out when nothing has been logged yet today.
    async fn afternoon_checkin(
        &self,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let tz = clock::parse_tz(&user.timezone)?;
        let today = clock::local_day(tz, now);

        let recent = {
            let db = self.db.clone();
            let user_id = user.id.clone();
            with_retry("activity query", move || {
                db.lock().get_observations(
                    &user_id,
                    Some(ObservationKind::Activity),
                    now - Duration::hours(24),
                )
            })
            .await?
        };
        let logged_today = recent
            .iter()
            .any(|o| clock::local_day(tz, o.timestamp) == today);
        if logged_today {
            return Ok(());
        }

        self.dispatcher
            .notify(
                user,
                "afternoon_checkin",
                &format!(
                    "Hi {}, how is your day going? Anything you'd like to log?",
                    user.name
                ),
                Urgency::Low,
                Category::Greeting,
                now,
            )
            .await?;
        Ok(())
    }

    /// Hourly task; only the configured medication hours produce anything.
    /// Each hour is its own notification type so the 9:00 and 14:00 doses do
    /// not dedup into one row.
    async fn medication_reminder(
        &self,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let tz = clock::parse_tz(&user.timezone)?;
        let hour = clock::local_hour(tz, now);
        if !self.config.medication_hours.contains(&hour) {
            return Ok(());
        }

        self.dispatcher
            .notify(
                user,
                &format!("medication_reminder_{:02}", hour),
                &format!("{}, it's time for your medication.", user.name),
                Urgency::Medium,
                Category::Health,
                now,
            )
            .await?;
        Ok(())
    }

    /// Two reminder stages per appointment: the day before and within two
    /// hours. Each stage is sent once; the flags make re-runs no-ops.
    async fn appointment_reminder(
        &self,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let upcoming = {
            let db = self.db.clone();
            let user_id = user.id.clone();
            with_retry("appointment query", move || {
                db.lock().upcoming_appointments(&user_id, now + Duration::hours(25))
            })
            .await?
        };

        for appt in upcoming {
            let until = appt.at - now;
            if until < Duration::zero() {
                continue;
            }

            if until <= Duration::hours(2) && !appt.reminded_two_hours {
                let when = appt.at.format("%H:%M UTC");
                self.dispatcher
                    .notify(
                        user,
                        &format!("appointment_soon_{}", appt.id),
                        &format!(
                            "Your appointment '{}' is coming up at {}{}",
                            appt.title,
                            when,
                            appt.location
                                .as_deref()
                                .map(|l| format!(" ({})", l))
                                .unwrap_or_default()
                        ),
                        Urgency::High,
                        Category::Reminder,
                        now,
                    )
                    .await?;
                self.db.lock().mark_appointment_reminded(&appt.id, false)?;
            } else if until <= Duration::hours(24) && !appt.reminded_day_before {
                self.dispatcher
                    .notify(
                        user,
                        &format!("appointment_tomorrow_{}", appt.id),
                        &format!("Reminder: '{}' is tomorrow.", appt.title),
                        Urgency::Medium,
                        Category::Reminder,
                        now,
                    )
                    .await?;
                self.db.lock().mark_appointment_reminded(&appt.id, true)?;
            }
        }
        Ok(())
    }

    /// A quiet stretch gets a gentle nudge; a full day of silence goes
    /// straight to family. The 24h alert skips sustain counting (the blackout
    /// itself is the qualifying window) but fires once per blackout: the
    /// escalation row latches until data returns.
    async fn inactivity_check(
        &self,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let last = {
            let db = self.db.clone();
            let user_id = user.id.clone();
            with_retry("last observation query", move || {
                db.lock().last_observation_at(&user_id)
            })
            .await?
        };
        // No data at all means a brand-new user, not an emergency
        let Some(last) = last else {
            return Ok(());
        };

        let state_key = ConcernType::Inactivity.as_str();
        let gap = now - last;
        if gap >= Duration::hours(self.config.inactivity_critical_hours) {
            let latched = self.db.lock().get_escalation(&user.id, state_key)?;
            if latched.escalated {
                // Family already knows about this blackout
                return Ok(());
            }
            let alert = self.db.lock().create_alert(
                &user.id,
                &format!(
                    "{} has not logged anything in over {} hours",
                    user.name,
                    gap.num_hours()
                ),
                Urgency::Critical,
                "health",
            )?;
            self.db.lock().set_escalation(
                &user.id,
                state_key,
                EscalationRow {
                    streak: 0,
                    escalated: true,
                },
            )?;
            self.dispatcher.dispatch_alert(user, &alert).await;
        } else {
            // Data came back since the last blackout: arm for the next one
            let latched = self.db.lock().get_escalation(&user.id, state_key)?;
            if latched.escalated {
                self.db.lock().set_escalation(
                    &user.id,
                    state_key,
                    EscalationRow {
                        streak: 0,
                        escalated: false,
                    },
                )?;
            }
            if gap >= Duration::hours(self.config.inactivity_gentle_hours) {
                self.dispatcher
                    .notify(
                        user,
                        "inactivity_check",
                        &format!(
                            "Hi {}, haven't heard from you in a while. How are you doing?",
                            user.name
                        ),
                        Urgency::Medium,
                        Category::Health,
                        now,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Detector-window observation query with bounded retry.
    async fn window_observations(
        &self,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<Vec<Observation>, EngineError> {
        let db = self.db.clone();
        let user_id = user.id.clone();
        let since = now - Duration::days(self.config.window_days as i64);
        with_retry("observation query", move || {
            db.lock().get_observations(&user_id, None, since)
        })
        .await
    }

    /// Sunday-only weekly rollup, delivered to family as a low-urgency Alert
    /// (visible through the alert history, no channel fan-out).
    async fn wellness_summary(
        &self,
        user: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let tz = clock::parse_tz(&user.timezone)?;
        if now.with_timezone(&tz).weekday() != Weekday::Sun {
            return Ok(());
        }

        let observations = self.window_observations(user, now).await?;
        let windows = signals::extract(&observations, now, self.config.window_days);

        let goal = self.config.weekly_active_minutes_goal;
        let minutes = windows.activity.total_active_minutes;
        let goal_note = if minutes >= goal {
            format!("{:.0} active minutes, meeting the {:.0}-minute guideline", minutes, goal)
        } else {
            format!("{:.0} of the recommended {:.0} active minutes", minutes, goal)
        };

        self.db.lock().create_alert(
            &user.id,
            &format!(
                "Weekly summary for {}: mood {}, {} activities, {}.",
                user.name,
                windows.mood.trend.as_str(),
                windows.activity.total_sessions,
                goal_note
            ),
            Urgency::Low,
            "wellness_summary",
        )?;
        Ok(())
    }

    /// The full pipeline: extract windows, run the rules, notify each
    /// Concern, and feed the run through the escalation policy.
    async fn pattern_scan(&self, user: &UserProfile, now: DateTime<Utc>) -> Result<(), EngineError> {
        let observations = self.window_observations(user, now).await?;
        let windows = signals::extract(&observations, now, self.config.window_days);
        let concerns = self.detector.run(&windows, &self.config);
        log::info!(
            "Pattern scan for {}: {} concern(s), {} insight(s)",
            user.id,
            concerns.len(),
            generate_insights(&windows).len()
        );

        for concern in &concerns {
            self.dispatcher.notify_concern(user, concern, now).await?;
        }

        let alerts = {
            let db = self.db.lock();
            self.policy.evaluate(&db, user, &concerns)?
        };
        for alert in &alerts {
            self.dispatcher.dispatch_alert(user, alert).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::CompanionDb;
    use crate::types::{Appointment, Observation};
    use chrono::TimeZone;
    use parking_lot::Mutex;

    fn setup_with_tz(timezone: &str) -> (Arc<Scheduler>, SharedDb, UserProfile) {
        let db: SharedDb = Arc::new(Mutex::new(test_db()));
        let user = UserProfile {
            id: "margaret".to_string(),
            name: "Margaret".to_string(),
            timezone: timezone.to_string(),
            active: true,
        };
        db.lock().upsert_user(&user).expect("user");

        let config = EngineConfig::default();
        let dispatcher = Arc::new(Dispatcher::new(db.clone(), config.clone()));
        let scheduler = Arc::new(Scheduler::new(db.clone(), config, dispatcher));
        (scheduler, db, user)
    }

    fn setup() -> (Arc<Scheduler>, SharedDb, UserProfile) {
        setup_with_tz("UTC")
    }

    fn insert_obs(db: &CompanionDb, user_id: &str, kind: ObservationKind, subtype: &str, value: f64, at: DateTime<Utc>) {
        db.insert_observation(&Observation {
            user_id: user_id.to_string(),
            kind,
            subtype: subtype.to_string(),
            value,
            timestamp: at,
        })
        .expect("insert observation");
    }

    fn noon() -> DateTime<Utc> {
        // A Tuesday
        Utc.with_ymd_and_hms(2026, 8, 25, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_run_due_tasks_twice_runs_each_task_once() {
        let (scheduler, db, _user) = setup();
        // The 08:00 occurrence is due; the tick arrives 30 seconds later
        let now = Utc.with_ymd_and_hms(2026, 8, 25, 8, 0, 30).unwrap();
        db.lock()
            .seed_task(
                TaskKind::MorningGreeting,
                Cadence::DailyAt { hour: 8, minute: 0 },
                Utc.with_ymd_and_hms(2026, 8, 25, 8, 0, 0).unwrap(),
            )
            .expect("seed");

        assert_eq!(scheduler.run_due_tasks(now).await.expect("first"), 1);
        assert_eq!(scheduler.run_due_tasks(now).await.expect("second"), 0);

        let rows = db.lock().get_notifications("margaret", false).expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].repeat_count, 0);
    }

    #[tokio::test]
    async fn test_claim_advances_past_now() {
        let (scheduler, db, _user) = setup();
        let now = noon();
        db.lock()
            .seed_task(
                TaskKind::InactivityCheck,
                Cadence::Interval { minutes: 120 },
                now - Duration::minutes(1),
            )
            .expect("seed");

        scheduler.run_due_tasks(now).await.expect("tick");

        let task = &db.lock().get_scheduled_tasks().expect("query")[0];
        assert_eq!(task.next_run_at, now + Duration::minutes(120));
        assert_eq!(task.failure_count, 0);
        assert!(task.last_run_at.is_some());
    }

    #[tokio::test]
    async fn test_bad_timezone_counts_as_failure_not_crash() {
        let (scheduler, db, _user) = setup_with_tz("Not/AZone");
        let now = noon();
        db.lock()
            .seed_task(
                TaskKind::MedicationReminder,
                Cadence::Interval { minutes: 60 },
                now - Duration::minutes(1),
            )
            .expect("seed");

        // The tick itself succeeds; the failure lands on the task counter
        assert_eq!(scheduler.run_due_tasks(now).await.expect("tick"), 1);
        let task = &db.lock().get_scheduled_tasks().expect("query")[0];
        assert_eq!(task.failure_count, 1);
    }

    #[tokio::test]
    async fn test_daily_task_skips_users_whose_wall_time_has_not_arrived() {
        let (scheduler, db, _user) = setup(); // margaret, UTC
        let kolkata = UserProfile {
            id: "arun".to_string(),
            name: "Arun".to_string(),
            timezone: "Asia/Kolkata".to_string(),
            active: true,
        };
        db.lock().upsert_user(&kolkata).expect("user");

        // 08:00 UTC on Aug 25: morning for margaret, 13:30 in Kolkata
        // (Arun's 08:00 occurrence for this claim is tomorrow)
        let now = Utc.with_ymd_and_hms(2026, 8, 25, 8, 0, 30).unwrap();
        db.lock()
            .seed_task(
                TaskKind::MorningGreeting,
                Cadence::DailyAt { hour: 8, minute: 0 },
                Utc.with_ymd_and_hms(2026, 8, 25, 8, 0, 0).unwrap(),
            )
            .expect("seed");

        scheduler.run_due_tasks(now).await.expect("tick");

        assert_eq!(db.lock().get_notifications("margaret", false).expect("q").len(), 1);
        assert!(db.lock().get_notifications("arun", false).expect("q").is_empty());

        // The new next_run_at is Arun's upcoming 02:30 UTC occurrence
        let task = &db.lock().get_scheduled_tasks().expect("query")[0];
        assert_eq!(
            task.next_run_at,
            Utc.with_ymd_and_hms(2026, 8, 26, 2, 30, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_medication_reminder_only_at_configured_hours() {
        let (scheduler, db, user) = setup();

        let at_14 = Utc.with_ymd_and_hms(2026, 8, 25, 14, 5, 0).unwrap();
        scheduler
            .execute_for_user(TaskKind::MedicationReminder, &user, at_14)
            .await
            .expect("handler");
        let rows = db.lock().get_notifications("margaret", false).expect("q");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].notification_type, "medication_reminder_14");

        let at_15 = Utc.with_ymd_and_hms(2026, 8, 25, 15, 5, 0).unwrap();
        scheduler
            .execute_for_user(TaskKind::MedicationReminder, &user, at_15)
            .await
            .expect("handler");
        assert_eq!(db.lock().get_notifications("margaret", false).expect("q").len(), 1);
    }

    #[tokio::test]
    async fn test_afternoon_checkin_skipped_when_active_today() {
        let (scheduler, db, user) = setup();
        let now = noon();

        insert_obs(&db.lock(), "margaret", ObservationKind::Activity, "walking", 30.0, now - Duration::hours(2));
        scheduler
            .execute_for_user(TaskKind::AfternoonCheckin, &user, now)
            .await
            .expect("handler");
        assert!(db.lock().get_notifications("margaret", false).expect("q").is_empty());
    }

    #[tokio::test]
    async fn test_afternoon_checkin_fires_when_quiet() {
        let (scheduler, db, user) = setup();
        let now = noon();

        scheduler
            .execute_for_user(TaskKind::AfternoonCheckin, &user, now)
            .await
            .expect("handler");
        let rows = db.lock().get_notifications("margaret", false).expect("q");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].notification_type, "afternoon_checkin");
    }

    #[tokio::test]
    async fn test_inactivity_thresholds() {
        let (scheduler, db, user) = setup();
        let now = noon();

        // Fresh data: nothing happens
        insert_obs(&db.lock(), "margaret", ObservationKind::Mood, "content", 6.0, now - Duration::hours(1));
        scheduler
            .execute_for_user(TaskKind::InactivityCheck, &user, now)
            .await
            .expect("handler");
        assert!(db.lock().get_notifications("margaret", false).expect("q").is_empty());
        assert!(db.lock().get_alerts("margaret", 7).expect("q").is_empty());

        // 5 hours quiet: gentle check-in
        scheduler
            .execute_for_user(TaskKind::InactivityCheck, &user, now + Duration::hours(6))
            .await
            .expect("handler");
        let rows = db.lock().get_notifications("margaret", false).expect("q");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].notification_type, "inactivity_check");
        assert!(db.lock().get_alerts("margaret", 7).expect("q").is_empty());

        // 30 hours quiet: critical family alert, no sustain counting
        scheduler
            .execute_for_user(TaskKind::InactivityCheck, &user, now + Duration::hours(30))
            .await
            .expect("handler");
        let alerts = db.lock().get_alerts("margaret", 7).expect("q");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].urgency, Urgency::Critical);
    }

    #[tokio::test]
    async fn test_single_blackout_alerts_family_once() {
        let (scheduler, db, user) = setup();
        let start = noon();
        insert_obs(&db.lock(), "margaret", ObservationKind::Mood, "content", 6.0, start);

        // Three 2-hourly runs into the same 30h blackout
        for offset in [30, 32, 34] {
            scheduler
                .execute_for_user(TaskKind::InactivityCheck, &user, start + Duration::hours(offset))
                .await
                .expect("handler");
        }
        assert_eq!(db.lock().get_alerts("margaret", 7).expect("q").len(), 1);

        // Data returns, then a second blackout begins
        insert_obs(&db.lock(), "margaret", ObservationKind::Mood, "content", 6.0, start + Duration::hours(35));
        scheduler
            .execute_for_user(TaskKind::InactivityCheck, &user, start + Duration::hours(36))
            .await
            .expect("handler");
        assert_eq!(db.lock().get_alerts("margaret", 7).expect("q").len(), 1);

        scheduler
            .execute_for_user(TaskKind::InactivityCheck, &user, start + Duration::hours(60))
            .await
            .expect("handler");
        assert_eq!(db.lock().get_alerts("margaret", 7).expect("q").len(), 2);
    }

    #[tokio::test]
    async fn test_one_failing_task_does_not_block_the_tick() {
        let (scheduler, db, _user) = setup_with_tz("Not/AZone");
        let now = noon();
        db.lock()
            .seed_task(
                TaskKind::MedicationReminder,
                Cadence::Interval { minutes: 60 },
                now - Duration::minutes(2),
            )
            .expect("seed");
        db.lock()
            .seed_task(
                TaskKind::InactivityCheck,
                Cadence::Interval { minutes: 120 },
                now - Duration::minutes(1),
            )
            .expect("seed");

        // The timezone failure is scoped to the medication task
        assert_eq!(scheduler.run_due_tasks(now).await.expect("tick"), 2);

        let tasks = db.lock().get_scheduled_tasks().expect("query");
        let medication = tasks
            .iter()
            .find(|t| t.kind == TaskKind::MedicationReminder)
            .expect("medication task");
        let inactivity = tasks
            .iter()
            .find(|t| t.kind == TaskKind::InactivityCheck)
            .expect("inactivity task");
        assert_eq!(medication.failure_count, 1);
        assert_eq!(inactivity.failure_count, 0);
    }

    #[tokio::test]
    async fn test_inactivity_skips_users_with_no_data() {
        let (scheduler, db, user) = setup();
        scheduler
            .execute_for_user(TaskKind::InactivityCheck, &user, noon())
            .await
            .expect("handler");
        assert!(db.lock().get_alerts("margaret", 7).expect("q").is_empty());
    }

    #[tokio::test]
    async fn test_appointment_reminder_stages_fire_once() {
        let (scheduler, db, user) = setup();
        let now = noon();
        db.lock()
            .upsert_appointment(&Appointment {
                id: "appt-1".to_string(),
                user_id: "margaret".to_string(),
                title: "Doctor visit".to_string(),
                at: now + Duration::hours(20),
                location: Some("Clinic".to_string()),
                status: "scheduled".to_string(),
                reminded_day_before: false,
                reminded_two_hours: false,
            })
            .expect("appt");

        // Day-before stage
        scheduler
            .execute_for_user(TaskKind::AppointmentReminder, &user, now)
            .await
            .expect("handler");
        scheduler
            .execute_for_user(TaskKind::AppointmentReminder, &user, now + Duration::hours(1))
            .await
            .expect("handler");
        let rows = db.lock().get_notifications("margaret", false).expect("q");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].notification_type.starts_with("appointment_tomorrow"));

        // Two-hour stage, 19 hours later
        scheduler
            .execute_for_user(TaskKind::AppointmentReminder, &user, now + Duration::hours(19))
            .await
            .expect("handler");
        let rows = db.lock().get_notifications("margaret", false).expect("q");
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .any(|n| n.notification_type.starts_with("appointment_soon")));
    }

    #[tokio::test]
    async fn test_wellness_summary_alerts_family_on_sundays_only() {
        let (scheduler, db, user) = setup();

        let tuesday = Utc.with_ymd_and_hms(2026, 8, 25, 18, 0, 0).unwrap();
        scheduler
            .execute_for_user(TaskKind::WellnessSummary, &user, tuesday)
            .await
            .expect("handler");
        assert!(db.lock().get_alerts("margaret", 7).expect("q").is_empty());

        let sunday = Utc.with_ymd_and_hms(2026, 8, 23, 18, 0, 0).unwrap();
        insert_obs(&db.lock(), "margaret", ObservationKind::Activity, "walking", 40.0, sunday - Duration::days(1));
        scheduler
            .execute_for_user(TaskKind::WellnessSummary, &user, sunday)
            .await
            .expect("handler");
        let alerts = db.lock().get_alerts("margaret", 7).expect("q");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].urgency, Urgency::Low);
        assert_eq!(alerts[0].category, "wellness_summary");
        assert!(alerts[0].message.contains("Weekly summary"));
        // The family rollup is not a user-facing notification
        assert!(db.lock().get_notifications("margaret", false).expect("q").is_empty());
    }

    #[tokio::test]
    async fn test_pattern_scan_notifies_and_escalates() {
        let (scheduler, db, user) = setup();
        let now = noon();

        // A week of concerning data: low energy, negative moods, no exercise
        for day in 1..=4 {
            insert_obs(&db.lock(), "margaret", ObservationKind::Mood, "sad", 3.0, now - Duration::days(day));
        }

        scheduler
            .execute_for_user(TaskKind::PatternScan, &user, now)
            .await
            .expect("scan 1");
        let rows = db.lock().get_notifications("margaret", true).expect("q");
        let types: Vec<&str> = rows.iter().map(|n| n.notification_type.as_str()).collect();
        assert!(types.contains(&"negative_mood"));
        assert!(types.contains(&"low_energy"));
        assert!(db.lock().get_alerts("margaret", 7).expect("q").is_empty());

        scheduler
            .execute_for_user(TaskKind::PatternScan, &user, now)
            .await
            .expect("scan 2");
        assert!(db.lock().get_alerts("margaret", 7).expect("q").is_empty());

        scheduler
            .execute_for_user(TaskKind::PatternScan, &user, now)
            .await
            .expect("scan 3");
        // Sustained on the third consecutive run
        assert!(!db.lock().get_alerts("margaret", 7).expect("q").is_empty());
    }

    #[tokio::test]
    async fn test_seed_roster_registers_all_tasks() {
        let (scheduler, db, _user) = setup();
        scheduler.seed_roster(noon()).expect("seed");
        let tasks = db.lock().get_scheduled_tasks().expect("query");
        assert_eq!(tasks.len(), TASK_ROSTER.len());

        // Seeding again changes nothing
        scheduler.seed_roster(noon() + Duration::hours(3)).expect("re-seed");
        assert_eq!(db.lock().get_scheduled_tasks().expect("query").len(), TASK_ROSTER.len());
    }
}
