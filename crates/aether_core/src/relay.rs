//! In-process room relay.
//!
//! A best-effort stand-in for the socket server: each link gets a fresh
//! connection id whenever it (re)connects, rooms hold the last
//! `agent-active` record per member, and every change is pushed to the
//! room as a full snapshot. Nothing is retained once a member leaves.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::channel::{EventChannel, InboundEvent, LocationUpdate, OutboundEvent, RoomSnapshot};
use crate::error::ChannelError;
use crate::id::{AgentId, RoomId};

struct Peer {
    outbox: mpsc::UnboundedSender<InboundEvent>,
    room: Option<RoomId>,
}

#[derive(Default)]
struct HubState {
    peers: HashMap<AgentId, Peer>,
    rooms: HashMap<RoomId, BTreeMap<AgentId, Value>>,
    location_updates: Vec<(AgentId, LocationUpdate)>,
}

impl HubState {
    fn snapshot(&self, room: &RoomId) -> RoomSnapshot {
        self.rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, record)| (id.to_string(), record.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn broadcast(&self, room: &RoomId, event: InboundEvent) {
        for peer in self.peers.values() {
            if peer.room.as_ref() == Some(room) {
                // receivers that went away just miss the event
                let _ = peer.outbox.send(event.clone());
            }
        }
    }

    fn remove_peer(&mut self, id: &AgentId) {
        let Some(peer) = self.peers.remove(id) else {
            return;
        };
        if let Some(room) = peer.room {
            let removed = self
                .rooms
                .get_mut(&room)
                .and_then(|members| members.remove(id))
                .is_some();
            if removed {
                let snapshot = self.snapshot(&room);
                self.broadcast(&room, InboundEvent::AgentUpdate(snapshot));
            }
            if self.rooms.get(&room).is_some_and(|m| m.is_empty()) {
                self.rooms.remove(&room);
            }
        }
    }
}

/// Shared relay; cheap to clone.
#[derive(Clone, Default)]
pub struct RelayHub {
    state: Arc<Mutex<HubState>>,
}

impl std::fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RelayHub")
            .field("peers", &state.peers.len())
            .field("rooms", &state.rooms.len())
            .finish()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connected link. `Connected` is already queued on the receiver.
    pub fn connect(&self) -> (Arc<RelayLink>, mpsc::UnboundedReceiver<InboundEvent>) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let link = Arc::new(RelayLink {
            hub: self.clone(),
            outbox,
            status: Mutex::new(LinkStatus::Down),
        });
        link.restore();
        (link, inbox)
    }

    /// Current raw records of a room.
    pub fn room_snapshot(&self, room: &RoomId) -> RoomSnapshot {
        self.state.lock().snapshot(room)
    }

    /// Drain the `update-location` payloads received so far, in arrival order.
    pub fn take_location_updates(&self) -> Vec<(AgentId, LocationUpdate)> {
        std::mem::take(&mut self.state.lock().location_updates)
    }

    fn register(&self, id: AgentId, outbox: mpsc::UnboundedSender<InboundEvent>) {
        self.state
            .lock()
            .peers
            .insert(id, Peer { outbox, room: None });
    }

    fn unregister(&self, id: &AgentId) {
        self.state.lock().remove_peer(id);
    }

    fn deliver(&self, from: &AgentId, event: OutboundEvent) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        match event {
            OutboundEvent::JoinRoom(room) => {
                let peer = state
                    .peers
                    .get_mut(from)
                    .ok_or(ChannelError::NotConnected)?;
                peer.room = Some(room.clone());
                let outbox = peer.outbox.clone();
                debug!(agent = %from, room = %room, "Peer joined room");

                let snapshot = state.snapshot(&room);
                if !snapshot.is_empty() {
                    let _ = outbox.send(InboundEvent::AgentUpdate(snapshot));
                }
            }
            OutboundEvent::StartTracking { room } => {
                debug!(agent = %from, room = %room, "Tracking started in room");
                state.broadcast(&room, InboundEvent::TrackStarted);
            }
            OutboundEvent::UpdateLocation(update) => {
                trace!(agent = %from, "Location update");
                state.location_updates.push((from.clone(), update));
            }
            OutboundEvent::AgentActive(presence) => {
                let room = presence.room.clone();
                let record = serde_json::to_value(&presence)
                    .map_err(|e| ChannelError::Closed(format!("unencodable presence: {}", e)))?;

                let peer = state
                    .peers
                    .get_mut(from)
                    .ok_or(ChannelError::NotConnected)?;
                peer.room = Some(room.clone());

                state
                    .rooms
                    .entry(room.clone())
                    .or_default()
                    .insert(from.clone(), record);
                let snapshot = state.snapshot(&room);
                state.broadcast(&room, InboundEvent::AgentUpdate(snapshot));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkStatus {
    Up(AgentId),
    Down,
    Closed,
}

/// One participant's connection to a [`RelayHub`].
pub struct RelayLink {
    hub: RelayHub,
    outbox: mpsc::UnboundedSender<InboundEvent>,
    status: Mutex<LinkStatus>,
}

impl std::fmt::Debug for RelayLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayLink")
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl RelayLink {
    /// Simulate a network drop. The member leaves its room; the link can be
    /// restored later under a new connection id.
    pub fn drop_link(&self) {
        let previous = {
            let mut status = self.status.lock();
            match std::mem::replace(&mut *status, LinkStatus::Down) {
                LinkStatus::Up(id) => id,
                other => {
                    *status = other;
                    return;
                }
            }
        };
        self.hub.unregister(&previous);
        debug!(agent = %previous, "Link dropped");
        let _ = self.outbox.send(InboundEvent::Disconnected);
    }

    /// Reconnect after [`drop_link`](Self::drop_link). No-op when up or closed.
    pub fn restore(&self) {
        let id = {
            let mut status = self.status.lock();
            if *status != LinkStatus::Down {
                return;
            }
            let id = AgentId::new(uuid::Uuid::new_v4().simple().to_string());
            *status = LinkStatus::Up(id.clone());
            id
        };
        self.hub.register(id.clone(), self.outbox.clone());
        debug!(agent = %id, "Link up");
        let _ = self.outbox.send(InboundEvent::Connected);
    }
}

impl EventChannel for RelayLink {
    fn connection_id(&self) -> Option<AgentId> {
        match &*self.status.lock() {
            LinkStatus::Up(id) => Some(id.clone()),
            _ => None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(*self.status.lock(), LinkStatus::Up(_))
    }

    fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        let id = match &*self.status.lock() {
            LinkStatus::Up(id) => id.clone(),
            LinkStatus::Down => return Err(ChannelError::NotConnected),
            LinkStatus::Closed => return Err(ChannelError::Closed("link closed".into())),
        };
        self.hub.deliver(&id, event)
    }

    fn disconnect(&self) {
        self.drop_link();
        *self.status.lock() = LinkStatus::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PresenceBroadcast;
    use chrono::Utc;

    fn presence(room: &RoomId, lat: f64) -> OutboundEvent {
        OutboundEvent::AgentActive(PresenceBroadcast {
            lat,
            lng: 1.0,
            speed: Some(2.0),
            timestamp: Utc::now(),
            name: "Web User".into(),
            velocity: Some(2.0),
            room: room.clone(),
            is_tracking: false,
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<InboundEvent>) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_connect_queues_connected() {
        let hub = RelayHub::new();
        let (link, mut rx) = hub.connect();
        assert!(link.is_connected());
        assert!(link.connection_id().is_some());
        assert_eq!(drain(&mut rx), vec![InboundEvent::Connected]);
    }

    #[test]
    fn test_presence_is_broadcast_to_room() {
        let hub = RelayHub::new();
        let room = RoomId::new("r");
        let (a, mut a_rx) = hub.connect();
        let (b, mut b_rx) = hub.connect();
        a.emit(OutboundEvent::JoinRoom(room.clone())).unwrap();
        b.emit(OutboundEvent::JoinRoom(room.clone())).unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.emit(presence(&room, 3.0)).unwrap();
        let a_id = a.connection_id().unwrap();
        for rx in [&mut a_rx, &mut b_rx] {
            match drain(rx).as_slice() {
                [InboundEvent::AgentUpdate(snapshot)] => {
                    assert_eq!(snapshot[a_id.as_str()]["lat"], 3.0);
                    assert_eq!(snapshot[a_id.as_str()]["isTracking"], false);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_late_joiner_gets_current_snapshot() {
        let hub = RelayHub::new();
        let room = RoomId::new("r");
        let (a, _a_rx) = hub.connect();
        a.emit(presence(&room, 1.0)).unwrap();

        let (b, mut b_rx) = hub.connect();
        b.emit(OutboundEvent::JoinRoom(room)).unwrap();
        let events = drain(&mut b_rx);
        assert!(matches!(events.last(), Some(InboundEvent::AgentUpdate(s)) if s.len() == 1));
    }

    #[test]
    fn test_drop_removes_member_and_restore_gets_new_id() {
        let hub = RelayHub::new();
        let room = RoomId::new("r");
        let (a, mut a_rx) = hub.connect();
        let (b, mut b_rx) = hub.connect();
        b.emit(OutboundEvent::JoinRoom(room.clone())).unwrap();
        a.emit(presence(&room, 1.0)).unwrap();
        let first_id = a.connection_id().unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.drop_link();
        assert!(!a.is_connected());
        assert_eq!(a.emit(presence(&room, 2.0)), Err(ChannelError::NotConnected));
        assert_eq!(drain(&mut a_rx), vec![InboundEvent::Disconnected]);
        match drain(&mut b_rx).as_slice() {
            [InboundEvent::AgentUpdate(snapshot)] => assert!(snapshot.is_empty()),
            other => panic!("unexpected {:?}", other),
        }

        a.restore();
        assert_eq!(drain(&mut a_rx), vec![InboundEvent::Connected]);
        assert_ne!(a.connection_id(), Some(first_id));
    }

    #[test]
    fn test_start_tracking_reaches_room() {
        let hub = RelayHub::new();
        let room = RoomId::new("r");
        let (a, _a_rx) = hub.connect();
        let (b, mut b_rx) = hub.connect();
        let (c, mut c_rx) = hub.connect();
        b.emit(OutboundEvent::JoinRoom(room.clone())).unwrap();
        c.emit(OutboundEvent::JoinRoom(RoomId::new("elsewhere"))).unwrap();
        drain(&mut b_rx);
        drain(&mut c_rx);

        a.emit(OutboundEvent::JoinRoom(room.clone())).unwrap();
        a.emit(OutboundEvent::StartTracking { room }).unwrap();
        assert_eq!(drain(&mut b_rx), vec![InboundEvent::TrackStarted]);
        assert!(drain(&mut c_rx).is_empty());
    }

    #[test]
    fn test_disconnect_is_final() {
        let hub = RelayHub::new();
        let (a, _rx) = hub.connect();
        a.disconnect();
        a.restore();
        assert!(!a.is_connected());
        assert!(matches!(
            a.emit(OutboundEvent::JoinRoom(RoomId::new("r"))),
            Err(ChannelError::Closed(_))
        ));
    }
}
