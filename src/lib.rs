//! Amble core: behavioral-pattern detection and proactive notifications.
//!
//! The engine watches a user's recorded observations (activities, moods,
//! expenses), detects behavioral deviations, escalates sustained concerns to
//! family-facing alerts, and drives scheduled check-ins and reminders. Hosts
//! embed it through [`api::Engine`] and implement
//! [`dispatch::DeliveryChannel`] for their delivery surfaces.

pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod escalation;
pub mod scheduler;
pub mod signals;
pub mod types;

pub use api::Engine;
pub use config::EngineConfig;
pub use error::EngineError;
