//! Bidirectional event channel between a participant and the room relay.
//!
//! The transport itself (socket implementation, reconnect policy) lives
//! outside this crate; the core only needs connectivity, identity and a
//! fire-and-forget `emit`. Inbound traffic arrives as [`InboundEvent`]s on
//! whatever queue the transport feeds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::id::{AgentId, RoomId};
use crate::location::LocationSample;

/// Payload of `update-location`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    /// Capture time of the sample, preserved when replayed from the buffer.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl From<&LocationSample> for LocationUpdate {
    fn from(sample: &LocationSample) -> Self {
        Self {
            lat: sample.latitude,
            lng: sample.longitude,
            speed: sample.speed,
            timestamp: sample.timestamp,
        }
    }
}

/// Payload of `agent-active`: what other members see of us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceBroadcast {
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub velocity: Option<f64>,
    pub room: RoomId,
    #[serde(rename = "isTracking")]
    pub is_tracking: bool,
}

/// Events a participant sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum OutboundEvent {
    JoinRoom(RoomId),
    StartTracking { room: RoomId },
    UpdateLocation(LocationUpdate),
    AgentActive(PresenceBroadcast),
}

impl OutboundEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => "join-room",
            Self::StartTracking { .. } => "start-tracking",
            Self::UpdateLocation(_) => "update-location",
            Self::AgentActive(_) => "agent-active",
        }
    }
}

/// Raw room snapshot as broadcast by the relay: participant id to presence
/// record. Records are untrusted until parsed.
pub type RoomSnapshot = BTreeMap<String, serde_json::Value>;

/// Events a participant receives.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected,
    Disconnected,
    /// Someone in the room started tracking.
    TrackStarted,
    AgentUpdate(RoomSnapshot),
}

/// Transport handle used by the session and the transmission buffer.
pub trait EventChannel: Send + Sync {
    /// Identity assigned by the transport for the current connection.
    fn connection_id(&self) -> Option<AgentId>;

    fn is_connected(&self) -> bool;

    /// Queue an event for delivery. Does not wait for acknowledgement.
    fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError>;

    /// Close the connection for good.
    fn disconnect(&self);
}
