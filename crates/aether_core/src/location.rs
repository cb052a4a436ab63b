//! Position samples, great-circle distance and per-sample classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for haversine distances, in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Both components are finite and inside the WGS84 ranges.
    ///
    /// Zero is a valid latitude and longitude.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

impl From<(f64, f64)> for Coordinates {
    fn from((lat, lng): (f64, f64)) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle distance in kilometres.
///
/// Returns `f64::INFINITY` when either point is not a usable coordinate, so
/// distance thresholds can never be met by garbage input.
pub fn haversine_km(from: Coordinates, to: Coordinates) -> f64 {
    if !from.is_valid() || !to.is_valid() {
        return f64::INFINITY;
    }

    let lat1_rad = from.lat * DEG_TO_RAD;
    let lat2_rad = to.lat * DEG_TO_RAD;
    let delta_lat = (to.lat - from.lat) * DEG_TO_RAD;
    let delta_lng = (to.lng - from.lng) * DEG_TO_RAD;

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// One raw reading from the geolocation source. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    /// Speed as reported by the source; absent when the device cannot tell.
    #[serde(default)]
    pub speed: Option<f64>,
    /// Horizontal accuracy radius in metres.
    pub accuracy: f64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, speed: Option<f64>, accuracy: f64) -> Self {
        Self {
            latitude,
            longitude,
            speed,
            accuracy,
            timestamp: Utc::now(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }

    /// Speed with an absent reading treated as standing still.
    pub fn speed_or_zero(&self) -> f64 {
        self.speed.unwrap_or(0.0)
    }
}

/// Coarse GPS quality bucket derived from the accuracy radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    #[default]
    High,
    Medium,
    Low,
}

impl AccuracyTier {
    /// `high` below `high_m`, `medium` below `medium_m`, else `low`.
    pub fn classify(accuracy_m: f64, high_m: f64, medium_m: f64) -> Self {
        if accuracy_m < high_m {
            Self::High
        } else if accuracy_m < medium_m {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

/// Direction of speed change between consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedTrend {
    Accel,
    Decel,
    #[default]
    Stable,
}

impl SpeedTrend {
    pub fn between(previous: f64, current: f64, delta: f64) -> Self {
        if current > previous + delta {
            Self::Accel
        } else if current < previous - delta {
            Self::Decel
        } else {
            Self::Stable
        }
    }
}
