//! Room membership as seen from one participant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::channel::RoomSnapshot;
use crate::id::{AgentId, RoomId};
use crate::location::Coordinates;

/// Latest known state of another participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPresence {
    pub agent_id: AgentId,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: Option<f64>,
    pub display_name: String,
    pub is_tracking_someone: bool,
    pub last_seen: DateTime<Utc>,
}

impl AgentPresence {
    /// Parse one raw snapshot record.
    ///
    /// Numeric, in-range `lat`/`lng` are required; anything else about the
    /// record is optional. Returns `None` for records that do not conform.
    pub fn parse(agent_id: &str, raw: &Value, received_at: DateTime<Utc>) -> Option<Self> {
        let record = raw.as_object()?;
        let lat = record.get("lat")?.as_f64()?;
        let lng = record.get("lng")?.as_f64()?;
        if !Coordinates::new(lat, lng).is_valid() {
            return None;
        }

        let speed = record
            .get("speed")
            .and_then(Value::as_f64)
            .or_else(|| record.get("velocity").and_then(Value::as_f64));
        let display_name = record
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        let is_tracking_someone = record
            .get("isTracking")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let last_seen = record
            .get("timestamp")
            .and_then(Value::as_i64)
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(received_at);

        Some(Self {
            agent_id: AgentId::new(agent_id),
            latitude: lat,
            longitude: lng,
            speed,
            display_name,
            is_tracking_someone,
            last_seen,
        })
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

/// What a snapshot changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Entries accepted into the member mapping.
    pub accepted: usize,
    /// Non-conforming entries that were discarded.
    pub dropped: usize,
    /// At least one other member reports tracking someone.
    pub remote_tracking: bool,
}

/// Local replica of a room.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoomSession {
    room_id: Option<RoomId>,
    members: BTreeMap<AgentId, AgentPresence>,
    session_active: bool,
}

impl RoomSession {
    pub fn new(room_id: Option<RoomId>) -> Self {
        Self {
            room_id,
            ..Self::default()
        }
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub(crate) fn set_room_id(&mut self, room_id: RoomId) {
        self.room_id = Some(room_id);
    }

    /// Other members, keyed by agent id.
    pub fn members(&self) -> &BTreeMap<AgentId, AgentPresence> {
        &self.members
    }

    pub fn member(&self, agent_id: &AgentId) -> Option<&AgentPresence> {
        self.members.get(agent_id)
    }

    pub fn session_active(&self) -> bool {
        self.session_active
    }

    /// Mark tracking as started somewhere in the room. Never reverts.
    pub fn activate(&mut self) {
        self.session_active = true;
    }

    /// Replace the member mapping with a fresh snapshot, leaving out `local`.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &RoomSnapshot,
        local: Option<&AgentId>,
        received_at: DateTime<Utc>,
    ) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        let mut members = BTreeMap::new();

        for (key, raw) in snapshot {
            if local.is_some_and(|me| me.as_str() == key) {
                continue;
            }
            match AgentPresence::parse(key, raw, received_at) {
                Some(presence) => {
                    outcome.remote_tracking |= presence.is_tracking_someone;
                    members.insert(presence.agent_id.clone(), presence);
                }
                None => {
                    debug!(agent = %key, "Dropped malformed presence record");
                    outcome.dropped += 1;
                }
            }
        }

        outcome.accepted = members.len();
        self.members = members;
        if outcome.remote_tracking {
            self.activate();
        }
        outcome
    }
}
