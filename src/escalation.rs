//! Alert escalation policy.
//!
//! A Concern only reaches family once it has been sustained: detected with
//! urgency at or above medium on N consecutive detector runs. Streaks are
//! persisted per (user, concern type) so a daemon restart does not reset
//! sustain counting. Once escalated, no further Alert is created until the
//! evidence clears and a fresh qualifying window completes.

use crate::config::EngineConfig;
use crate::db::{CompanionDb, EscalationRow};
use crate::error::EngineError;
use crate::types::{Alert, Concern, ConcernType, Urgency, UserProfile};

/// Concern types subject to sustain counting. Inactivity is excluded: a 24h
/// data blackout is already a full qualifying window and the scheduler
/// escalates it directly.
const TRACKED: &[ConcernType] = &[
    ConcernType::LowActivity,
    ConcernType::SocialIsolation,
    ConcernType::NegativeMood,
    ConcernType::LowEnergy,
    ConcernType::RoutineInconsistency,
];

#[derive(Clone)]
pub struct EscalationPolicy {
    runs_required: u32,
}

impl EscalationPolicy {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            runs_required: config.escalation_runs,
        }
    }

    /// Feed one detector run's output through the state machine.
    ///
    /// Returns the Alerts created by this run (at most one per concern type).
    pub fn evaluate(
        &self,
        db: &CompanionDb,
        user: &UserProfile,
        concerns: &[Concern],
    ) -> Result<Vec<Alert>, EngineError> {
        let mut alerts = Vec::new();

        for concern_type in TRACKED {
            let hit = concerns
                .iter()
                .find(|c| c.concern_type == *concern_type && c.urgency >= Urgency::Medium);

            let row = db.get_escalation(&user.id, concern_type.as_str())?;

            match hit {
                Some(concern) => {
                    let streak = row.streak + 1;
                    let mut escalated = row.escalated;
                    if streak >= self.runs_required && !row.escalated {
                        let alert = db.create_alert(
                            &user.id,
                            &format!(
                                "{} has a sustained concern: {} (seen on {} consecutive check-ins)",
                                user.name, concern.message, streak
                            ),
                            concern.urgency,
                            "wellness",
                        )?;
                        log::warn!(
                            "Escalated {} for user {} after {} runs",
                            concern_type,
                            user.id,
                            streak
                        );
                        alerts.push(alert);
                        escalated = true;
                    }
                    db.set_escalation(
                        &user.id,
                        concern_type.as_str(),
                        EscalationRow { streak, escalated },
                    )?;
                }
                None => {
                    // Evidence cleared: back to watching, fresh window required
                    if row.streak > 0 || row.escalated {
                        db.set_escalation(
                            &user.id,
                            concern_type.as_str(),
                            EscalationRow {
                                streak: 0,
                                escalated: false,
                            },
                        )?;
                    }
                }
            }
        }

        Ok(alerts)
    }
}
