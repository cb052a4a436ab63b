use std::fmt;

use serde::{Deserialize, Serialize};

use crate::alerts::Alert;
use crate::error::SensorError;
use crate::id::{AgentId, RoomId};
use crate::location::{AccuracyTier, Coordinates, LocationSample, SpeedTrend};
use crate::lookup::RouteSummary;

use super::presence::AgentPresence;

/// Where the link to the relay stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    #[default]
    Disconnected,
    Connecting,
    /// Connected but no room joined yet.
    Connected,
    Joined,
}

/// Participant state as a whole: link phase plus room activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    JoinedIdle,
    JoinedActive,
}

impl SessionState {
    pub fn from_parts(phase: LinkPhase, session_active: bool) -> Self {
        match (phase, session_active) {
            (LinkPhase::Disconnected, _) => Self::Disconnected,
            (LinkPhase::Connecting, _) => Self::Connecting,
            (LinkPhase::Connected, _) => Self::Connected,
            (LinkPhase::Joined, false) => Self::JoinedIdle,
            (LinkPhase::Joined, true) => Self::JoinedActive,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::JoinedIdle => "joined (idle)",
            Self::JoinedActive => "joined (session active)",
        };
        f.write_str(label)
    }
}

/// Delivery health, recomputed on every poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Live,
    Recovering,
    #[default]
    Offline,
}

impl ConnectionState {
    pub fn derive(connected: bool, buffered: usize) -> Self {
        if !connected {
            Self::Offline
        } else if buffered > 0 {
            Self::Recovering
        } else {
            Self::Live
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => f.write_str("live"),
            Self::Recovering => f.write_str("recovering"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationMode {
    /// Follows the tracked agent on every presence update.
    Pursuit,
    /// Fixed point chosen by search or directly.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub coordinates: Coordinates,
    pub mode: DestinationMode,
}

impl Destination {
    pub fn pursuit(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            mode: DestinationMode::Pursuit,
        }
    }

    pub fn manual(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            mode: DestinationMode::Manual,
        }
    }
}

/// User-visible conditions raised by the session. Never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionNotice {
    /// The tracked agent vanished from the room.
    TargetLost { agent_id: AgentId },
    DestinationNotFound { query: String },
    /// A lookup service could not be reached or answered garbage.
    LookupFailed { service: String, details: String },
    SensorFault { error: SensorError },
}

impl fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TargetLost { agent_id } => {
                write!(f, "Target lost signal (Disconnected): {}", agent_id)
            }
            Self::DestinationNotFound { query } => write!(f, "Location not found: {}", query),
            Self::LookupFailed { service, details } => {
                write!(f, "{} unavailable: {}", service, details)
            }
            Self::SensorFault { error } => write!(f, "Location sensor: {}", error),
        }
    }
}

/// How a fresh sample left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Buffered,
}

/// Outcome of feeding one sample.
#[derive(Debug, Clone)]
pub struct PositionReport {
    pub accuracy: AccuracyTier,
    pub trend: SpeedTrend,
    pub alerts: Vec<Alert>,
    pub delivery: Delivery,
}

/// Read model of a session for map and status consumers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub connection: ConnectionState,
    pub room_id: Option<RoomId>,
    pub self_id: Option<AgentId>,
    pub members: Vec<AgentPresence>,
    pub session_active: bool,
    pub tracking: Option<AgentId>,
    pub destination: Option<Destination>,
    pub route: Option<RouteSummary>,
    pub position: Option<LocationSample>,
    /// Samples handled so far; distinguishes samples that share a timestamp.
    pub positions_seen: u64,
    pub accuracy: AccuracyTier,
    pub trend: SpeedTrend,
    pub alerts: Vec<Alert>,
    pub buffered: usize,
    pub share_link: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            connection: ConnectionState::Offline,
            room_id: None,
            self_id: None,
            members: Vec::new(),
            session_active: false,
            tracking: None,
            destination: None,
            route: None,
            position: None,
            positions_seen: 0,
            accuracy: AccuracyTier::default(),
            trend: SpeedTrend::default(),
            alerts: Vec::new(),
            buffered: 0,
            share_link: None,
        }
    }
}
