//! Notification dispatcher: dedup, quiet hours, channel fan-out.
//!
//! Creating a notification and delivering it are separate steps. The row is
//! written (or deduplicated) synchronously and is immediately visible to the
//! read API; fan-out to delivery channels happens afterwards, skipped during
//! quiet hours and drained once the window ends. A channel failure never
//! loses the notification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock;
use crate::config::EngineConfig;
use crate::db::{NotificationWrite, SharedDb};
use crate::error::EngineError;
use crate::types::{Alert, Category, Concern, Notification, Urgency, UserProfile};

/// A delivery surface. Implementations live outside the engine; the engine
/// only guarantees the call is bounded by a timeout and that failure is
/// logged, not propagated.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        user: &UserProfile,
        notification: &Notification,
    ) -> Result<(), EngineError>;

    async fn deliver_alert(&self, user: &UserProfile, alert: &Alert) -> Result<(), EngineError>;
}

/// Always-available local channel. Useful on its own for development and as
/// the floor under external channels.
pub struct LogChannel;

#[async_trait]
impl DeliveryChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(
        &self,
        user: &UserProfile,
        notification: &Notification,
    ) -> Result<(), EngineError> {
        log::info!(
            "[{}] to {}: {} ({})",
            notification.notification_type,
            user.name,
            notification.message,
            notification.urgency
        );
        Ok(())
    }

    async fn deliver_alert(&self, user: &UserProfile, alert: &Alert) -> Result<(), EngineError> {
        log::warn!(
            "[alert] family of {}: {} ({})",
            user.name,
            alert.message,
            alert.urgency
        );
        Ok(())
    }
}

pub struct Dispatcher {
    db: SharedDb,
    config: EngineConfig,
    channels: Vec<Arc<dyn DeliveryChannel>>,
}

impl Dispatcher {
    pub fn new(db: SharedDb, config: EngineConfig) -> Self {
        Self {
            db,
            config,
            channels: vec![Arc::new(LogChannel)],
        }
    }

    pub fn add_channel(&mut self, channel: Arc<dyn DeliveryChannel>) {
        self.channels.push(channel);
    }

    /// Create (or dedup) a notification and fan out delivery unless the
    /// user's local time is inside quiet hours.
    pub async fn notify(
        &self,
        user: &UserProfile,
        notification_type: &str,
        message: &str,
        urgency: Urgency,
        category: Category,
        now: DateTime<Utc>,
    ) -> Result<NotificationWrite, EngineError> {
        let tz = clock::parse_tz(&user.timezone)?;
        let quiet = self.config.in_quiet_hours(clock::local_hour(tz, now));
        let deliver_after = if quiet {
            Some(clock::next_local_occurrence(
                tz,
                now,
                self.config.quiet_end_hour,
                0,
            ))
        } else {
            None
        };

        let write = {
            let db = self.db.lock();
            db.upsert_notification(
                &user.id,
                notification_type,
                message,
                urgency,
                category,
                now,
                &clock::local_day(tz, now),
                deliver_after,
            )?
        };

        match &write {
            NotificationWrite::Created { id } if !quiet => {
                let notification = {
                    let db = self.db.lock();
                    db.get_notification(id)?
                };
                if let Some(notification) = notification {
                    self.fan_out(user, &notification).await;
                }
                self.db.lock().mark_delivered(id)?;
            }
            NotificationWrite::Created { id } => {
                log::info!(
                    "Notification {} created in quiet hours for {}, delivery deferred",
                    id,
                    user.id
                );
            }
            NotificationWrite::Repeated { id, repeat_count } => {
                log::debug!(
                    "Duplicate notification for {} folded into {} (repeat {})",
                    user.id,
                    id,
                    repeat_count
                );
            }
        }

        Ok(write)
    }

    /// Notification shape for a detected Concern.
    pub async fn notify_concern(
        &self,
        user: &UserProfile,
        concern: &Concern,
        now: DateTime<Utc>,
    ) -> Result<NotificationWrite, EngineError> {
        self.notify(
            user,
            concern.concern_type.as_str(),
            &format!("{}. {}", concern.message, concern.suggested_action),
            concern.urgency,
            Category::Wellness,
            now,
        )
        .await
    }

    /// Deliver notifications whose quiet-hours deferral has expired.
    /// Returns the number delivered.
    pub async fn flush_deferred(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let pending = {
            let db = self.db.lock();
            db.pending_deliveries(now)?
        };

        let mut delivered = 0;
        for notification in pending {
            let user = {
                let db = self.db.lock();
                db.get_user(&notification.user_id)?
            };
            let Some(user) = user else {
                log::warn!(
                    "Dropping pending delivery {} for unknown user {}",
                    notification.id,
                    notification.user_id
                );
                self.db.lock().mark_delivered(&notification.id)?;
                continue;
            };
            self.fan_out(&user, &notification).await;
            self.db.lock().mark_delivered(&notification.id)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Fan an Alert out to channels. Only high and critical Alerts leave the
    /// store; lower urgencies stay visible through the read API alone.
    pub async fn dispatch_alert(&self, user: &UserProfile, alert: &Alert) {
        if alert.urgency < Urgency::High {
            return;
        }
        let timeout = Duration::from_secs(self.config.delivery_timeout_seconds);
        for channel in &self.channels {
            let result = match tokio::time::timeout(timeout, channel.deliver_alert(user, alert))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(EngineError::Delivery {
                    channel: channel.name().to_string(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(EngineError::Delivery {
                    channel: channel.name().to_string(),
                    reason: format!("timed out after {:?}", timeout),
                }),
            };
            if let Err(e) = result {
                log::error!("Alert {} not delivered: {}", alert.id, e);
            }
        }
    }

    /// One channel call, bounded by the configured timeout. Failure and
    /// timeout both surface as [`EngineError::Delivery`].
    async fn deliver_one(
        &self,
        channel: &Arc<dyn DeliveryChannel>,
        user: &UserProfile,
        notification: &Notification,
    ) -> Result<(), EngineError> {
        let timeout = Duration::from_secs(self.config.delivery_timeout_seconds);
        match tokio::time::timeout(timeout, channel.deliver(user, notification)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Delivery {
                channel: channel.name().to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(EngineError::Delivery {
                channel: channel.name().to_string(),
                reason: format!("timed out after {:?}", timeout),
            }),
        }
    }

    async fn fan_out(&self, user: &UserProfile, notification: &Notification) {
        for channel in &self.channels {
            if let Err(e) = self.deliver_one(channel, user, notification).await {
                // Non-fatal: the row is retained, no same-tick retry
                log::error!("Delivery of {} failed: {}", notification.id, e);
            }
        }
    }
}
