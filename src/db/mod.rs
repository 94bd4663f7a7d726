//! SQLite-backed engine state.
//!
//! The database lives at `~/.amble/companion.db` and holds everything the
//! engine persists: observations, notifications, alerts, escalation streaks,
//! the scheduled-task registry, user profiles, and appointments. All
//! timestamps are stored as RFC 3339 UTC text.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{
    Alert, Appointment, Cadence, Category, Notification, Observation, ObservationKind,
    ScheduledTask, TaskKind, Urgency, UserProfile,
};

/// Shared handle used by the dispatcher, scheduler, and read API. The
/// non-poisoning Mutex means a panicking task handler cannot wedge the store.
pub type SharedDb = std::sync::Arc<parking_lot::Mutex<CompanionDb>>;

/// Outcome of a deduplicating notification write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationWrite {
    /// A new row was inserted; delivery fan-out should happen.
    Created { id: String },
    /// An unread row for the same (user, type, local day) already existed;
    /// its repeat_count was incremented and no delivery should happen.
    Repeated { id: String, repeat_count: i64 },
}

/// Persisted sustain bookkeeping for one (user, concern type) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationRow {
    pub streak: u32,
    pub escalated: bool,
}

/// SQLite connection wrapper.
///
/// Intentionally NOT `Clone` or `Sync`; held behind a `parking_lot::Mutex`
/// so a panicking task handler cannot poison the shared handle.
pub struct CompanionDb {
    conn: Connection,
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_enum<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

impl CompanionDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Open (or create) the database at `~/.amble/companion.db` and apply the schema.
    pub fn open() -> Result<Self, EngineError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path. Useful for testing.
    pub fn open_at(path: PathBuf) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL for better concurrent read behavior
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        // All statements use IF NOT EXISTS, so this is idempotent
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self { conn })
    }

    fn db_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Configuration("Home directory not found".to_string()))?;
        Ok(home.join(".amble").join("companion.db"))
    }

    // =========================================================================
    // Observations
    // =========================================================================

    /// Append an observation. Observations are immutable once recorded.
    pub fn insert_observation(&self, obs: &Observation) -> Result<String, EngineError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO observations (id, user_id, kind, subtype, value, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                obs.user_id,
                obs.kind.as_str(),
                obs.subtype,
                obs.value,
                obs.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    /// Query observations for a user since a UTC instant, optionally filtered
    /// by kind, ordered oldest first.
    pub fn get_observations(
        &self,
        user_id: &str,
        kind: Option<ObservationKind>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Observation>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, kind, subtype, value, timestamp
             FROM observations
             WHERE user_id = ?1
               AND timestamp >= ?2
               AND (?3 IS NULL OR kind = ?3)
             ORDER BY timestamp ASC",
        )?;

        let kind_param = kind.map(|k| k.as_str());
        let rows = stmt.query_map(params![user_id, since.to_rfc3339(), kind_param], |row| {
            let kind_raw: String = row.get(1)?;
            let ts_raw: String = row.get(4)?;
            Ok(Observation {
                user_id: row.get(0)?,
                kind: parse_enum(1, &kind_raw)?,
                subtype: row.get(2)?,
                value: row.get(3)?,
                timestamp: parse_ts(4, &ts_raw)?,
            })
        })?;

        let mut observations = Vec::new();
        for row in rows {
            observations.push(row?);
        }
        Ok(observations)
    }

    /// Timestamp of the most recent observation for a user, if any.
    pub fn last_observation_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(timestamp) FROM observations WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        match raw {
            Some(ts) => Ok(Some(parse_ts(0, &ts)?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Deduplicating notification write.
    ///
    /// The partial unique index on `(user_id, type, created_day) WHERE read = 0`
    /// makes this a single atomic statement: a clash with an unread row
    /// increments its `repeat_count` instead of inserting.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_notification(
        &self,
        user_id: &str,
        notification_type: &str,
        message: &str,
        urgency: Urgency,
        category: Category,
        created_at: DateTime<Utc>,
        created_day: &str,
        deliver_after: Option<DateTime<Utc>>,
    ) -> Result<NotificationWrite, EngineError> {
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO notifications (
                id, user_id, type, message, urgency, category,
                created_at, created_day, read, repeat_count, delivered, deliver_after
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, 0, ?9)
             ON CONFLICT (user_id, type, created_day) WHERE read = 0
             DO UPDATE SET repeat_count = repeat_count + 1",
            params![
                id,
                user_id,
                notification_type,
                message,
                urgency.as_str(),
                category.as_str(),
                created_at.to_rfc3339(),
                created_day,
                deliver_after.map(|t| t.to_rfc3339()),
            ],
        )?;

        // The insert path leaves our fresh id in place; the conflict path keeps
        // the existing row's id, so a lookup tells the two apart.
        let (row_id, repeat_count): (String, i64) = self.conn.query_row(
            "SELECT id, repeat_count FROM notifications
             WHERE user_id = ?1 AND type = ?2 AND created_day = ?3 AND read = 0",
            params![user_id, notification_type, created_day],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if row_id == id {
            Ok(NotificationWrite::Created { id })
        } else {
            Ok(NotificationWrite::Repeated {
                id: row_id,
                repeat_count,
            })
        }
    }

    fn notification_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
        let urgency_raw: String = row.get(4)?;
        let category_raw: String = row.get(5)?;
        let ts_raw: String = row.get(6)?;
        Ok(Notification {
            id: row.get(0)?,
            user_id: row.get(1)?,
            notification_type: row.get(2)?,
            message: row.get(3)?,
            urgency: parse_enum(4, &urgency_raw)?,
            category: parse_enum(5, &category_raw)?,
            created_at: parse_ts(6, &ts_raw)?,
            read: row.get(7)?,
            repeat_count: row.get(8)?,
        })
    }

    const NOTIFICATION_COLS: &'static str =
        "id, user_id, type, message, urgency, category, created_at, read, repeat_count";

    /// Notifications for a user, newest first.
    pub fn get_notifications(
        &self,
        user_id: &str,
        unread_only: bool,
    ) -> Result<Vec<Notification>, EngineError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM notifications
             WHERE user_id = ?1 AND (?2 = 0 OR read = 0)
             ORDER BY created_at DESC",
            Self::NOTIFICATION_COLS
        ))?;

        let rows = stmt.query_map(params![user_id, unread_only], Self::notification_from_row)?;

        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    pub fn get_notification(&self, id: &str) -> Result<Option<Notification>, EngineError> {
        let result = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM notifications WHERE id = ?1",
                    Self::NOTIFICATION_COLS
                ),
                params![id],
                Self::notification_from_row,
            )
            .optional()?;
        Ok(result)
    }

    /// Mark a notification read. Idempotent; read is terminal.
    pub fn mark_notification_read(&self, id: &str) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE notifications SET read = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Notifications whose delivery has not happened yet and whose
    /// quiet-hours deferral (if any) has expired.
    pub fn pending_deliveries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Notification>, EngineError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM notifications
             WHERE delivered = 0
               AND (deliver_after IS NULL OR deliver_after <= ?1)
             ORDER BY created_at ASC",
            Self::NOTIFICATION_COLS
        ))?;

        let rows = stmt.query_map(params![now.to_rfc3339()], Self::notification_from_row)?;

        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    /// Record that delivery fan-out ran for a notification. Failed channels
    /// are not retried this way; the row itself is the retained record.
    pub fn mark_delivered(&self, id: &str) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE notifications SET delivered = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    pub fn create_alert(
        &self,
        user_id: &str,
        message: &str,
        urgency: Urgency,
        category: &str,
    ) -> Result<Alert, EngineError> {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            message: message.to_string(),
            urgency,
            category: category.to_string(),
            created_at: Utc::now(),
            acknowledged: false,
        };
        self.conn.execute(
            "INSERT INTO alerts (id, user_id, message, urgency, category, created_at, acknowledged)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                alert.id,
                alert.user_id,
                alert.message,
                alert.urgency.as_str(),
                alert.category,
                alert.created_at.to_rfc3339(),
            ],
        )?;
        Ok(alert)
    }

    /// Alerts for a user within the last `days`, newest first.
    pub fn get_alerts(&self, user_id: &str, days: u32) -> Result<Vec<Alert>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, message, urgency, category, created_at, acknowledged
             FROM alerts
             WHERE user_id = ?1
               AND created_at >= ?2
             ORDER BY created_at DESC",
        )?;

        let since = Utc::now() - chrono::Duration::days(days as i64);
        let rows = stmt.query_map(params![user_id, since.to_rfc3339()], |row| {
            let urgency_raw: String = row.get(3)?;
            let ts_raw: String = row.get(5)?;
            Ok(Alert {
                id: row.get(0)?,
                user_id: row.get(1)?,
                message: row.get(2)?,
                urgency: parse_enum(3, &urgency_raw)?,
                category: row.get(4)?,
                created_at: parse_ts(5, &ts_raw)?,
                acknowledged: row.get(6)?,
            })
        })?;

        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }

    pub fn acknowledge_alert(&self, id: &str) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE alerts SET acknowledged = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Escalation state
    // =========================================================================

    pub fn get_escalation(
        &self,
        user_id: &str,
        concern_type: &str,
    ) -> Result<EscalationRow, EngineError> {
        let row = self
            .conn
            .query_row(
                "SELECT streak, state FROM escalation_state
                 WHERE user_id = ?1 AND concern_type = ?2",
                params![user_id, concern_type],
                |row| {
                    let streak: u32 = row.get(0)?;
                    let state: String = row.get(1)?;
                    Ok(EscalationRow {
                        streak,
                        escalated: state == "escalated",
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or(EscalationRow {
            streak: 0,
            escalated: false,
        }))
    }

    pub fn set_escalation(
        &self,
        user_id: &str,
        concern_type: &str,
        row: EscalationRow,
    ) -> Result<(), EngineError> {
        let state = if row.escalated { "escalated" } else { "watching" };
        self.conn.execute(
            "INSERT INTO escalation_state (user_id, concern_type, streak, state, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (user_id, concern_type) DO UPDATE SET
                streak = excluded.streak,
                state = excluded.state,
                updated_at = excluded.updated_at",
            params![
                user_id,
                concern_type,
                row.streak,
                state,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // =========================================================================
    // Scheduled tasks
    // =========================================================================

    /// Register a task if it is not already present. Existing rows keep their
    /// `next_run_at` so a restart does not reset the schedule.
    pub fn seed_task(
        &self,
        kind: TaskKind,
        cadence: Cadence,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO scheduled_tasks (id, kind, cadence, next_run_at, failure_count)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![
                Uuid::new_v4().to_string(),
                kind.as_str(),
                cadence.to_string(),
                next_run_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledTask> {
        let kind_raw: String = row.get(1)?;
        let cadence_raw: String = row.get(2)?;
        let next_raw: String = row.get(3)?;
        let last_raw: Option<String> = row.get(4)?;
        Ok(ScheduledTask {
            id: row.get(0)?,
            kind: parse_enum(1, &kind_raw)?,
            cadence: parse_enum(2, &cadence_raw)?,
            next_run_at: parse_ts(3, &next_raw)?,
            last_run_at: match last_raw {
                Some(ts) => Some(parse_ts(4, &ts)?),
                None => None,
            },
            failure_count: row.get(5)?,
        })
    }

    pub fn get_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, cadence, next_run_at, last_run_at, failure_count
             FROM scheduled_tasks
             ORDER BY next_run_at ASC",
        )?;
        let rows = stmt.query_map([], Self::task_from_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Tasks whose `next_run_at` is at or before `now`.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, cadence, next_run_at, last_run_at, failure_count
             FROM scheduled_tasks
             WHERE next_run_at <= ?1
             ORDER BY next_run_at ASC",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], Self::task_from_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Atomic claim-and-advance. Succeeds only when `next_run_at` still holds
    /// its expected value, so two concurrent claimers cannot both win, and a
    /// successful claim strictly advances the task.
    pub fn claim_task(
        &self,
        id: &str,
        expected_next_run_at: DateTime<Utc>,
        new_next_run_at: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let changed = self.conn.execute(
            "UPDATE scheduled_tasks
             SET next_run_at = ?1
             WHERE id = ?2 AND next_run_at = ?3",
            params![
                new_next_run_at.to_rfc3339(),
                id,
                expected_next_run_at.to_rfc3339(),
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn record_task_success(
        &self,
        id: &str,
        ran_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE scheduled_tasks SET last_run_at = ?1, failure_count = 0 WHERE id = ?2",
            params![ran_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn record_task_failure(
        &self,
        id: &str,
        ran_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE scheduled_tasks
             SET last_run_at = ?1, failure_count = failure_count + 1
             WHERE id = ?2",
            params![ran_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub fn upsert_user(&self, user: &UserProfile) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT INTO users (id, name, timezone, active)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                timezone = excluded.timezone,
                active = excluded.active",
            params![user.id, user.name, user.timezone, user.active],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserProfile>, EngineError> {
        let result = self
            .conn
            .query_row(
                "SELECT id, name, timezone, active FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UserProfile {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        timezone: row.get(2)?,
                        active: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    pub fn get_active_users(&self) -> Result<Vec<UserProfile>, EngineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, timezone, active FROM users WHERE active = 1 ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(UserProfile {
                id: row.get(0)?,
                name: row.get(1)?,
                timezone: row.get(2)?,
                active: row.get(3)?,
            })
        })?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    // =========================================================================
    // Appointments
    // =========================================================================

    pub fn upsert_appointment(&self, appt: &Appointment) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT INTO appointments (
                id, user_id, title, at, location, status,
                reminded_day_before, reminded_two_hours
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (id) DO UPDATE SET
                title = excluded.title,
                at = excluded.at,
                location = excluded.location,
                status = excluded.status",
            params![
                appt.id,
                appt.user_id,
                appt.title,
                appt.at.to_rfc3339(),
                appt.location,
                appt.status,
                appt.reminded_day_before,
                appt.reminded_two_hours,
            ],
        )?;
        Ok(())
    }

    /// Scheduled appointments for a user up to a UTC instant, soonest first.
    pub fn upcoming_appointments(
        &self,
        user_id: &str,
        until: DateTime<Utc>,
    ) -> Result<Vec<Appointment>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, title, at, location, status,
                    reminded_day_before, reminded_two_hours
             FROM appointments
             WHERE user_id = ?1
               AND status = 'scheduled'
               AND at <= ?2
             ORDER BY at ASC",
        )?;
        let rows = stmt.query_map(params![user_id, until.to_rfc3339()], |row| {
            let at_raw: String = row.get(3)?;
            Ok(Appointment {
                id: row.get(0)?,
                user_id: row.get(1)?,
                title: row.get(2)?,
                at: parse_ts(3, &at_raw)?,
                location: row.get(4)?,
                status: row.get(5)?,
                reminded_day_before: row.get(6)?,
                reminded_two_hours: row.get(7)?,
            })
        })?;

        let mut appointments = Vec::new();
        for row in rows {
            appointments.push(row?);
        }
        Ok(appointments)
    }

    /// Flag one of the two reminder stages as sent.
    pub fn mark_appointment_reminded(
        &self,
        id: &str,
        day_before: bool,
    ) -> Result<(), EngineError> {
        let sql = if day_before {
            "UPDATE appointments SET reminded_day_before = 1 WHERE id = ?1"
        } else {
            "UPDATE appointments SET reminded_two_hours = 1 WHERE id = ?1"
        };
        self.conn.execute(sql, params![id])?;
        Ok(())
    }
}

// =============================================================================
// Test utilities
// =============================================================================


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;
    use chrono::Duration;

    fn obs(user_id: &str, kind: ObservationKind, subtype: &str, value: f64) -> Observation {
        Observation {
            user_id: user_id.to_string(),
            kind,
            subtype: subtype.to_string(),
            value,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        for table in [
            "observations",
            "notifications",
            "alerts",
            "escalation_state",
            "scheduled_tasks",
            "users",
            "appointments",
        ] {
            let count: i32 = db
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .unwrap_or_else(|_| panic!("{} table should exist", table));
            assert_eq!(count, 0);
        }
    }

    #[test]
    fn test_idempotent_schema_application() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("idempotent.db");

        let _db1 = CompanionDb::open_at(path.clone()).expect("first open");
        let _db2 = CompanionDb::open_at(path).expect("second open should not fail");
    }

    #[test]
    fn test_observations_filter_by_kind_and_time() {
        let db = test_db();
        db.insert_observation(&obs("margaret", ObservationKind::Activity, "walking", 30.0))
            .expect("insert");
        db.insert_observation(&obs("margaret", ObservationKind::Mood, "happy", 7.0))
            .expect("insert");

        let old = Observation {
            timestamp: Utc::now() - Duration::days(30),
            ..obs("margaret", ObservationKind::Activity, "walking", 20.0)
        };
        db.insert_observation(&old).expect("insert");

        let since = Utc::now() - Duration::days(7);
        let activities = db
            .get_observations("margaret", Some(ObservationKind::Activity), since)
            .expect("query");
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].subtype, "walking");

        let all = db.get_observations("margaret", None, since).expect("query");
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_last_observation_at() {
        let db = test_db();
        assert!(db.last_observation_at("margaret").expect("query").is_none());

        db.insert_observation(&obs("margaret", ObservationKind::Mood, "content", 6.0))
            .expect("insert");
        assert!(db.last_observation_at("margaret").expect("query").is_some());
    }

    #[test]
    fn test_notification_dedup_increments_repeat_count() {
        let db = test_db();
        let now = Utc::now();

        let first = db
            .upsert_notification(
                "margaret",
                "social_isolation",
                "No social contact in 4 days",
                Urgency::Medium,
                Category::Wellness,
                now,
                "2026-08-25",
                None,
            )
            .expect("first write");
        assert!(matches!(first, NotificationWrite::Created { .. }));

        let second = db
            .upsert_notification(
                "margaret",
                "social_isolation",
                "No social contact in 4 days",
                Urgency::Medium,
                Category::Wellness,
                now,
                "2026-08-25",
                None,
            )
            .expect("second write");
        assert!(matches!(
            second,
            NotificationWrite::Repeated {
                repeat_count: 1,
                ..
            }
        ));

        let rows = db.get_notifications("margaret", false).expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].repeat_count, 1);
    }

    #[test]
    fn test_read_row_falls_out_of_dedup_index() {
        let db = test_db();
        let now = Utc::now();

        let first = db
            .upsert_notification(
                "margaret",
                "low_energy",
                "Energy has been low",
                Urgency::High,
                Category::Wellness,
                now,
                "2026-08-25",
                None,
            )
            .expect("write");
        let id = match first {
            NotificationWrite::Created { id } => id,
            other => panic!("expected create, got {:?}", other),
        };
        db.mark_notification_read(&id).expect("mark read");

        // Same day, same type: a new row is allowed once the old one is read
        let second = db
            .upsert_notification(
                "margaret",
                "low_energy",
                "Energy has been low",
                Urgency::High,
                Category::Wellness,
                now,
                "2026-08-25",
                None,
            )
            .expect("write");
        assert!(matches!(second, NotificationWrite::Created { .. }));

        let rows = db.get_notifications("margaret", false).expect("query");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let db = test_db();
        let write = db
            .upsert_notification(
                "margaret",
                "greeting",
                "Good morning!",
                Urgency::Low,
                Category::Greeting,
                Utc::now(),
                "2026-08-25",
                None,
            )
            .expect("write");
        let id = match write {
            NotificationWrite::Created { id } => id,
            other => panic!("expected create, got {:?}", other),
        };

        db.mark_notification_read(&id).expect("first read");
        db.mark_notification_read(&id).expect("second read");

        let row = db.get_notification(&id).expect("query").expect("exists");
        assert!(row.read);
    }

    #[test]
    fn test_pending_deliveries_honor_deferral() {
        let db = test_db();
        let now = Utc::now();

        db.upsert_notification(
            "margaret",
            "greeting",
            "Good morning!",
            Urgency::Low,
            Category::Greeting,
            now,
            "2026-08-25",
            None,
        )
        .expect("immediate write");

        db.upsert_notification(
            "margaret",
            "negative_mood",
            "Checking in",
            Urgency::Medium,
            Category::Wellness,
            now,
            "2026-08-25",
            Some(now + Duration::hours(8)),
        )
        .expect("deferred write");

        let pending = db.pending_deliveries(now).expect("query");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].notification_type, "greeting");

        let later = db
            .pending_deliveries(now + Duration::hours(9))
            .expect("query");
        assert_eq!(later.len(), 2);

        db.mark_delivered(&pending[0].id).expect("mark delivered");
        let after = db.pending_deliveries(now).expect("query");
        assert_eq!(after.len(), 0);
    }

    #[test]
    fn test_alert_round_trip() {
        let db = test_db();
        let alert = db
            .create_alert(
                "margaret",
                "Sustained low energy",
                Urgency::High,
                "wellness",
            )
            .expect("create");
        assert!(!alert.acknowledged);

        let alerts = db.get_alerts("margaret", 7).expect("query");
        assert_eq!(alerts.len(), 1);

        db.acknowledge_alert(&alert.id).expect("ack");
        let alerts = db.get_alerts("margaret", 7).expect("query");
        assert!(alerts[0].acknowledged);
    }

    #[test]
    fn test_escalation_state_round_trip() {
        let db = test_db();

        let initial = db.get_escalation("margaret", "low_energy").expect("query");
        assert_eq!(initial.streak, 0);
        assert!(!initial.escalated);

        db.set_escalation(
            "margaret",
            "low_energy",
            EscalationRow {
                streak: 2,
                escalated: false,
            },
        )
        .expect("set");
        db.set_escalation(
            "margaret",
            "low_energy",
            EscalationRow {
                streak: 3,
                escalated: true,
            },
        )
        .expect("update");

        let row = db.get_escalation("margaret", "low_energy").expect("query");
        assert_eq!(row.streak, 3);
        assert!(row.escalated);
    }

    #[test]
    fn test_seed_task_keeps_existing_schedule() {
        let db = test_db();
        let first_run = Utc::now() + Duration::minutes(5);

        db.seed_task(
            TaskKind::MorningGreeting,
            Cadence::DailyAt { hour: 8, minute: 0 },
            first_run,
        )
        .expect("seed");

        // Re-seeding with a different time must not move the schedule
        db.seed_task(
            TaskKind::MorningGreeting,
            Cadence::DailyAt { hour: 8, minute: 0 },
            first_run + Duration::hours(5),
        )
        .expect("re-seed");

        let tasks = db.get_scheduled_tasks().expect("query");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].next_run_at.to_rfc3339(), first_run.to_rfc3339());
    }

    #[test]
    fn test_claim_task_cas() {
        let db = test_db();
        let due = Utc::now() - Duration::minutes(1);
        db.seed_task(
            TaskKind::PatternScan,
            Cadence::DailyAt {
                hour: 10,
                minute: 0,
            },
            due,
        )
        .expect("seed");

        let task = &db.due_tasks(Utc::now()).expect("due")[0];
        let next = Utc::now() + Duration::hours(24);

        assert!(db
            .claim_task(&task.id, task.next_run_at, next)
            .expect("first claim"));
        // A second claimer holding the stale expected value loses
        assert!(!db
            .claim_task(&task.id, task.next_run_at, next)
            .expect("second claim"));

        assert!(db.due_tasks(Utc::now()).expect("due").is_empty());
    }

    #[test]
    fn test_failure_count_tracking() {
        let db = test_db();
        db.seed_task(
            TaskKind::InactivityCheck,
            Cadence::Interval { minutes: 120 },
            Utc::now(),
        )
        .expect("seed");
        let id = db.get_scheduled_tasks().expect("query")[0].id.clone();

        db.record_task_failure(&id, Utc::now()).expect("failure");
        db.record_task_failure(&id, Utc::now()).expect("failure");
        assert_eq!(db.get_scheduled_tasks().expect("query")[0].failure_count, 2);

        db.record_task_success(&id, Utc::now()).expect("success");
        let task = &db.get_scheduled_tasks().expect("query")[0];
        assert_eq!(task.failure_count, 0);
        assert!(task.last_run_at.is_some());
    }

    #[test]
    fn test_users_and_appointments() {
        let db = test_db();
        db.upsert_user(&UserProfile {
            id: "margaret".to_string(),
            name: "Margaret".to_string(),
            timezone: "Europe/London".to_string(),
            active: true,
        })
        .expect("user");
        db.upsert_user(&UserProfile {
            id: "inactive".to_string(),
            name: "Gone".to_string(),
            timezone: "UTC".to_string(),
            active: false,
        })
        .expect("user");

        let active = db.get_active_users().expect("query");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "margaret");

        let appt = Appointment {
            id: "appt-1".to_string(),
            user_id: "margaret".to_string(),
            title: "Doctor visit".to_string(),
            at: Utc::now() + Duration::hours(20),
            location: Some("Clinic".to_string()),
            status: "scheduled".to_string(),
            reminded_day_before: false,
            reminded_two_hours: false,
        };
        db.upsert_appointment(&appt).expect("appt");

        let upcoming = db
            .upcoming_appointments("margaret", Utc::now() + Duration::hours(24))
            .expect("query");
        assert_eq!(upcoming.len(), 1);

        db.mark_appointment_reminded("appt-1", true).expect("mark");
        let upcoming = db
            .upcoming_appointments("margaret", Utc::now() + Duration::hours(24))
            .expect("query");
        assert!(upcoming[0].reminded_day_before);
        assert!(!upcoming[0].reminded_two_hours);
    }
}
