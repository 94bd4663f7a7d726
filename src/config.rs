//! Engine configuration stored in ~/.amble/config.json
//!
//! Every field has a serde default so an empty `{}` file (or a missing one)
//! yields a fully working configuration. `validate()` runs once at startup;
//! a validation failure is the only fatal error in the system.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Scheduler wake interval in seconds.
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    /// Consecutive qualifying detector runs before a Concern becomes an Alert.
    #[serde(default = "default_escalation_runs")]
    pub escalation_runs: u32,

    /// Detector evidence window in days.
    #[serde(default = "default_window_days")]
    pub window_days: u32,

    /// Maximum concurrently executing per-user task handlers.
    #[serde(default = "default_max_concurrent_users")]
    pub max_concurrent_users: usize,

    /// Per-channel delivery timeout in seconds.
    #[serde(default = "default_delivery_timeout_seconds")]
    pub delivery_timeout_seconds: u64,

    /// Local hours at which the medication reminder fires.
    #[serde(default = "default_medication_hours")]
    pub medication_hours: Vec<u8>,

    /// Quiet hours in local time. Notifications created during this window
    /// are visible immediately but delivery fan-out waits for the window end.
    #[serde(default = "default_quiet_start_hour")]
    pub quiet_start_hour: u8,
    #[serde(default = "default_quiet_end_hour")]
    pub quiet_end_hour: u8,

    // Detector thresholds, 7-day window
    #[serde(default = "default_min_exercise_sessions")]
    pub min_exercise_sessions: u32,
    #[serde(default = "default_isolation_days")]
    pub isolation_days: u32,
    #[serde(default = "default_negative_mood_count")]
    pub negative_mood_count: u32,
    #[serde(default = "default_low_energy_mean")]
    pub low_energy_mean: f64,
    #[serde(default = "default_min_active_days")]
    pub min_active_days: u32,

    /// Inactivity thresholds in hours.
    #[serde(default = "default_inactivity_gentle_hours")]
    pub inactivity_gentle_hours: i64,
    #[serde(default = "default_inactivity_critical_hours")]
    pub inactivity_critical_hours: i64,

    /// WHO-style weekly active-minutes guideline for the wellness summary.
    #[serde(default = "default_weekly_active_minutes_goal")]
    pub weekly_active_minutes_goal: f64,
}

fn default_tick_seconds() -> u64 {
    60
}

fn default_escalation_runs() -> u32 {
    3
}

fn default_window_days() -> u32 {
    7
}

fn default_max_concurrent_users() -> usize {
    8
}

fn default_delivery_timeout_seconds() -> u64 {
    5
}

fn default_medication_hours() -> Vec<u8> {
    vec![9, 14, 20]
}

fn default_quiet_start_hour() -> u8 {
    22
}

fn default_quiet_end_hour() -> u8 {
    7
}

fn default_min_exercise_sessions() -> u32 {
    3
}

fn default_isolation_days() -> u32 {
    3
}

fn default_negative_mood_count() -> u32 {
    3
}

fn default_low_energy_mean() -> f64 {
    4.0
}

fn default_min_active_days() -> u32 {
    4
}

fn default_inactivity_gentle_hours() -> i64 {
    4
}

fn default_inactivity_critical_hours() -> i64 {
    24
}

fn default_weekly_active_minutes_goal() -> f64 {
    150.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        // An empty JSON object picks up every field default
        serde_json::from_str("{}").expect("default config must deserialize")
    }
}

impl EngineConfig {
    /// Default on-disk location: ~/.amble/config.json
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".amble").join("config.json"))
    }

    /// Load from the default path. A missing file yields defaults; a present
    /// but malformed file is a startup failure.
    pub fn load() -> Result<Self, EngineError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
            EngineError::Configuration(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.tick_seconds == 0 {
            return Err(EngineError::Configuration(
                "tickSeconds must be positive".to_string(),
            ));
        }
        if self.escalation_runs == 0 {
            return Err(EngineError::Configuration(
                "escalationRuns must be positive".to_string(),
            ));
        }
        if self.window_days == 0 {
            return Err(EngineError::Configuration(
                "windowDays must be positive".to_string(),
            ));
        }
        if self.max_concurrent_users == 0 {
            return Err(EngineError::Configuration(
                "maxConcurrentUsers must be positive".to_string(),
            ));
        }
        if self.quiet_start_hour > 23 || self.quiet_end_hour > 23 {
            return Err(EngineError::Configuration(
                "quiet hours must be 0-23".to_string(),
            ));
        }
        if let Some(h) = self.medication_hours.iter().find(|h| **h > 23) {
            return Err(EngineError::Configuration(format!(
                "medicationHours entry out of range: {}",
                h
            )));
        }
        if self.inactivity_gentle_hours >= self.inactivity_critical_hours {
            return Err(EngineError::Configuration(
                "inactivityGentleHours must be below inactivityCriticalHours".to_string(),
            ));
        }
        Ok(())
    }

    /// True when the given local hour falls inside quiet hours. The window
    /// wraps midnight (default 22:00-07:00); the end hour is exclusive.
    pub fn in_quiet_hours(&self, local_hour: u8) -> bool {
        if self.quiet_start_hour <= self.quiet_end_hour {
            local_hour >= self.quiet_start_hour && local_hour < self.quiet_end_hour
        } else {
            local_hour >= self.quiet_start_hour || local_hour < self.quiet_end_hour
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_yields_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tick_seconds, 60);
        assert_eq!(config.escalation_runs, 3);
        assert_eq!(config.medication_hours, vec![9, 14, 20]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"escalationRuns": 2, "quietStartHour": 21}"#).unwrap();
        assert_eq!(config.escalation_runs, 2);
        assert_eq!(config.quiet_start_hour, 21);
        assert_eq!(config.quiet_end_hour, 7);
    }

    #[test]
    fn test_validate_rejects_zero_escalation_runs() {
        let config = EngineConfig {
            escalation_runs: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_medication_hour() {
        let config = EngineConfig {
            medication_hours: vec![9, 25],
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let config = EngineConfig::default();
        assert!(config.in_quiet_hours(22));
        assert!(config.in_quiet_hours(23));
        assert!(config.in_quiet_hours(0));
        assert!(config.in_quiet_hours(6));
        assert!(!config.in_quiet_hours(7));
        assert!(!config.in_quiet_hours(12));
        assert!(!config.in_quiet_hours(21));
    }
}
