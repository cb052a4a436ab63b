//! Deterministic alert rules over the position stream.
//!
//! The engine is fed once per fresh sample and returns the alerts active for
//! that sample. Alerts are re-derived every call and never accumulate; rules
//! are independent and evaluated in a fixed order (stop, arrival, speeding),
//! so more than one can fire for the same sample.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AlertConfig;
use crate::location::{Coordinates, LocationSample, haversine_km};
use crate::lookup::RouteSummary;

/// Which rule produced an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StopDetected,
    DestinationReached,
    HighSpeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Success,
    Danger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// State carried between evaluations.
#[derive(Debug, Clone, Default)]
pub struct AlertEngineState {
    /// Last evaluated sample. No rule reads it yet; path-deviation checks
    /// will compare against it.
    pub last_position: Option<LocationSample>,
    /// Start of the current uninterrupted stop, if any.
    pub stop_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct AlertEngine {
    thresholds: AlertConfig,
    state: AlertEngineState,
}

impl AlertEngine {
    pub fn new(thresholds: AlertConfig) -> Self {
        Self {
            thresholds,
            state: AlertEngineState::default(),
        }
    }

    pub fn state(&self) -> &AlertEngineState {
        &self.state
    }

    /// Evaluate against the wall clock.
    pub fn evaluate(
        &mut self,
        position: &LocationSample,
        route: Option<&RouteSummary>,
        destination: Option<Coordinates>,
    ) -> Vec<Alert> {
        self.evaluate_at(position, route, destination, Utc::now())
    }

    /// Evaluate with an explicit "now", used for stop timing and alert stamps.
    pub fn evaluate_at(
        &mut self,
        position: &LocationSample,
        // route geometry is not consulted by any rule yet
        _route: Option<&RouteSummary>,
        destination: Option<Coordinates>,
        now: DateTime<Utc>,
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let speed = position.speed_or_zero();

        if let Some(alert) = self.check_stop(speed, now) {
            alerts.push(alert);
        }

        if let Some(destination) = destination {
            let distance = haversine_km(position.coordinates(), destination);
            if distance < self.thresholds.arrival_radius_km {
                alerts.push(Alert {
                    id: AlertKind::DestinationReached,
                    level: AlertLevel::Success,
                    message: "Arrived at Destination".to_string(),
                    timestamp: now,
                });
            }
        }

        if speed > self.thresholds.high_speed {
            alerts.push(Alert {
                id: AlertKind::HighSpeed,
                level: AlertLevel::Danger,
                message: format!(
                    "High Speed Detected (>{}km/h)",
                    self.thresholds.high_speed
                ),
                timestamp: now,
            });
        }

        if !alerts.is_empty() {
            debug!(count = alerts.len(), "Alerts active");
        }

        self.state.last_position = Some(position.clone());
        alerts
    }

    fn check_stop(&mut self, speed: f64, now: DateTime<Utc>) -> Option<Alert> {
        if speed >= self.thresholds.stop_speed {
            self.state.stop_started_at = None;
            return None;
        }

        let Some(started) = self.state.stop_started_at else {
            self.state.stop_started_at = Some(now);
            return None;
        };

        let minutes = (now - started).num_milliseconds() as f64 / 60_000.0;
        if minutes > self.thresholds.stop_minutes {
            Some(Alert {
                id: AlertKind::StopDetected,
                level: AlertLevel::Warning,
                message: format!("Stationary for {:.0} min", minutes.round()),
                timestamp: now,
            })
        } else {
            None
        }
    }
}
