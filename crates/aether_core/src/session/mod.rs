//! Room protocol for one local participant.
//!
//! [`TrackingSession`] owns everything mutable about a participant: the
//! transmission buffer, the alert engine, the replicated room and the
//! tracking target. It is driven by plain method calls, one event at a time;
//! the async [`Tracker`](crate::tracker::Tracker) serializes the event
//! sources onto it.
//!
//! Link phases move `Disconnected -> Connecting -> Connected -> Joined`.
//! Room activation is tracked separately and only ever turns on, so the
//! externally visible [`SessionState`] is derived from both.

mod presence;
mod state;

pub use presence::{AgentPresence, Reconciliation, RoomSession};
pub use state::{
    ConnectionState, Delivery, Destination, DestinationMode, LinkPhase, PositionReport,
    SessionNotice, SessionSnapshot, SessionState,
};

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertEngine};
use crate::buffer::TransmissionBuffer;
use crate::channel::{
    EventChannel, InboundEvent, LocationUpdate, OutboundEvent, PresenceBroadcast, RoomSnapshot,
};
use crate::config::{ParticipantConfig, SessionConfig, TrackerConfig};
use crate::error::{LookupError, SensorError};
use crate::id::{AgentId, RoomId};
use crate::location::{AccuracyTier, Coordinates, LocationSample, SpeedTrend};
use crate::lookup::RouteSummary;

pub struct TrackingSession {
    participant: ParticipantConfig,
    tuning: SessionConfig,
    channel: Arc<dyn EventChannel>,
    buffer: TransmissionBuffer,
    engine: AlertEngine,

    phase: LinkPhase,
    room: RoomSession,
    self_id: Option<AgentId>,
    tracking: Option<AgentId>,
    destination: Option<Destination>,
    route: Option<RouteSummary>,

    position: Option<LocationSample>,
    positions_seen: u64,
    accuracy: AccuracyTier,
    trend: SpeedTrend,
    alerts: Vec<Alert>,
    connection: ConnectionState,
    notices: Vec<SessionNotice>,
}

impl std::fmt::Debug for TrackingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingSession")
            .field("phase", &self.phase)
            .field("room", &self.room.room_id())
            .field("tracking", &self.tracking)
            .field("buffer", &self.buffer)
            .field("connection", &self.connection)
            .finish()
    }
}

impl TrackingSession {
    pub fn new(
        config: &TrackerConfig,
        channel: Arc<dyn EventChannel>,
        buffer: TransmissionBuffer,
    ) -> Self {
        Self {
            participant: config.participant.clone(),
            tuning: config.session.clone(),
            channel,
            buffer,
            engine: AlertEngine::new(config.alerts.clone()),
            phase: LinkPhase::Disconnected,
            room: RoomSession::new(config.participant.room.clone()),
            self_id: None,
            tracking: None,
            destination: None,
            route: None,
            position: None,
            positions_seen: 0,
            accuracy: AccuracyTier::default(),
            trend: SpeedTrend::default(),
            alerts: Vec::new(),
            connection: ConnectionState::Offline,
            notices: Vec::new(),
        }
    }

    /// Dispatch one inbound channel event.
    pub fn handle(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Connected => self.on_connected(),
            InboundEvent::Disconnected => self.on_disconnected(),
            InboundEvent::TrackStarted => self.on_track_started(),
            InboundEvent::AgentUpdate(snapshot) => self.on_agent_update(&snapshot),
        }
    }

    /// The transport is dialing.
    pub fn begin_connect(&mut self) {
        if self.phase == LinkPhase::Disconnected {
            self.phase = LinkPhase::Connecting;
        }
    }

    /// Channel came up: flush what was buffered, then (re)join the room.
    pub fn on_connected(&mut self) {
        self.phase = LinkPhase::Connected;
        self.self_id = self.channel.connection_id();

        let flushed = self.buffer.flush(Some(self.channel.as_ref()));
        if flushed > 0 {
            info!(count = flushed, "Replayed buffered samples on connect");
        }

        let room_id = match self.room.room_id() {
            Some(room_id) => room_id.clone(),
            None => match &self.self_id {
                Some(me) => {
                    let room_id = RoomId::from_connection(me);
                    self.room.set_room_id(room_id.clone());
                    room_id
                }
                None => {
                    warn!("Connected without a connection id, cannot create a room");
                    self.refresh_connection_state();
                    return;
                }
            },
        };

        match self.channel.emit(OutboundEvent::JoinRoom(room_id.clone())) {
            Ok(()) => {
                self.phase = LinkPhase::Joined;
                info!(room = %room_id, "Joined room");
            }
            Err(e) => warn!(room = %room_id, "Join request failed: {}", e),
        }
        self.refresh_connection_state();
    }

    /// Channel went away. Room and tracking state are kept for the reconnect.
    pub fn on_disconnected(&mut self) {
        if self.phase != LinkPhase::Disconnected {
            info!("Channel disconnected, buffering samples");
        }
        self.phase = LinkPhase::Disconnected;
        self.connection = ConnectionState::Offline;
    }

    /// Feed one fresh sample from the geolocation source.
    pub fn on_position(&mut self, sample: LocationSample) -> PositionReport {
        let speed = sample.speed_or_zero();
        self.accuracy = AccuracyTier::classify(
            sample.accuracy,
            self.tuning.accuracy_high_m,
            self.tuning.accuracy_medium_m,
        );
        self.trend = match &self.position {
            Some(previous) => {
                SpeedTrend::between(previous.speed_or_zero(), speed, self.tuning.trend_delta)
            }
            None => SpeedTrend::Stable,
        };

        // stop timing follows capture time so replays behave like live runs
        self.alerts = self.engine.evaluate_at(
            &sample,
            self.route.as_ref(),
            self.destination.map(|d| d.coordinates),
            sample.timestamp,
        );

        let delivery = self.transmit(&sample);
        debug!(
            lat = sample.latitude,
            lng = sample.longitude,
            speed,
            accuracy = ?self.accuracy,
            delivery = ?delivery,
            "Position sample"
        );
        self.position = Some(sample);
        self.positions_seen += 1;

        PositionReport {
            accuracy: self.accuracy,
            trend: self.trend,
            alerts: self.alerts.clone(),
            delivery,
        }
    }

    fn transmit(&mut self, sample: &LocationSample) -> Delivery {
        let joined_room = match (self.phase, self.room.room_id()) {
            (LinkPhase::Joined, Some(room_id)) if self.channel.is_connected() => {
                Some(room_id.clone())
            }
            _ => None,
        };

        let Some(room_id) = joined_room else {
            self.buffer.enqueue(sample.clone());
            if !self.channel.is_connected() {
                self.connection = ConnectionState::Offline;
            }
            return Delivery::Buffered;
        };

        self.buffer.flush(Some(self.channel.as_ref()));

        let update = OutboundEvent::UpdateLocation(LocationUpdate::from(sample));
        if let Err(e) = self.channel.emit(update) {
            debug!("Live emit failed, buffering: {}", e);
            self.buffer.enqueue(sample.clone());
            self.connection = ConnectionState::Offline;
            return Delivery::Buffered;
        }

        let presence = PresenceBroadcast {
            lat: sample.latitude,
            lng: sample.longitude,
            speed: sample.speed,
            timestamp: sample.timestamp,
            name: self.participant.display_name().to_string(),
            velocity: sample.speed,
            room: room_id,
            is_tracking: self.tracking.is_some(),
        };
        if let Err(e) = self.channel.emit(OutboundEvent::AgentActive(presence)) {
            debug!("Presence broadcast failed: {}", e);
        }
        Delivery::Sent
    }

    /// Report a geolocation failure. The source keeps its own retry policy.
    pub fn on_sensor_error(&mut self, error: SensorError) {
        warn!("Geolocation error: {}", error);
        self.notices.push(SessionNotice::SensorFault { error });
    }

    /// Follow `agent_id`. Returns false when that agent is not in the room.
    pub fn start_tracking(&mut self, agent_id: &AgentId) -> bool {
        let Some(target) = self.room.member(agent_id) else {
            warn!(agent = %agent_id, "Cannot track an agent outside the room");
            return false;
        };
        self.destination = Some(Destination::pursuit(target.coordinates()));
        self.tracking = Some(agent_id.clone());
        self.room.activate();

        match self.room.room_id() {
            Some(room_id) if self.channel.is_connected() => {
                let event = OutboundEvent::StartTracking {
                    room: room_id.clone(),
                };
                if let Err(e) = self.channel.emit(event) {
                    warn!("start-tracking not delivered: {}", e);
                }
            }
            // peers still learn it from our next presence broadcast
            _ => debug!("start-tracking deferred, channel not ready"),
        }

        info!(agent = %agent_id, "Tracking started");
        true
    }

    /// Stop following. The last pursuit point stays as a fixed destination.
    pub fn stop_tracking(&mut self) {
        if let Some(agent_id) = self.tracking.take() {
            info!(agent = %agent_id, "Tracking stopped");
        }
        if let Some(destination) = self.destination.as_mut() {
            destination.mode = DestinationMode::Manual;
        }
    }

    /// Set a fixed destination, leaving pursuit mode.
    pub fn set_destination(&mut self, coordinates: Coordinates) {
        self.tracking = None;
        self.route = None;
        self.destination = Some(Destination::manual(coordinates));
    }

    pub fn clear_destination(&mut self) {
        self.tracking = None;
        self.route = None;
        self.destination = None;
    }

    /// Apply the answer to a destination search.
    ///
    /// Only a hit changes state. A miss raises `DestinationNotFound` and a
    /// service failure raises `LookupFailed`; neither touches tracking or
    /// the current destination.
    pub fn apply_search_result(
        &mut self,
        query: &str,
        result: Result<Option<Coordinates>, LookupError>,
    ) -> Option<Coordinates> {
        match result {
            Ok(Some(coordinates)) => {
                info!(query, lat = coordinates.lat, lng = coordinates.lng, "Destination found");
                self.set_destination(coordinates);
                Some(coordinates)
            }
            Ok(None) => {
                info!(query, "Destination not found");
                self.notices.push(SessionNotice::DestinationNotFound {
                    query: query.to_string(),
                });
                None
            }
            Err(e) => {
                warn!(query, "Geocoding failed: {}", e);
                self.notices.push(SessionNotice::LookupFailed {
                    service: "geocoder".to_string(),
                    details: e.to_string(),
                });
                None
            }
        }
    }

    /// Endpoints for a route refresh: current position to destination.
    pub fn route_request(&self) -> Option<(Coordinates, Coordinates)> {
        let from = self.position.as_ref()?.coordinates();
        let to = self.destination?.coordinates;
        Some((from, to))
    }

    pub fn apply_route_result(&mut self, result: Result<RouteSummary, LookupError>) {
        match result {
            Ok(route) => {
                debug!(
                    distance_km = route.distance_km,
                    duration_min = route.duration_min,
                    "Route refreshed"
                );
                self.route = Some(route);
            }
            Err(e) => {
                warn!("Routing failed: {}", e);
                self.notices.push(SessionNotice::LookupFailed {
                    service: "router".to_string(),
                    details: e.to_string(),
                });
            }
        }
    }

    /// Someone in the room started tracking.
    pub fn on_track_started(&mut self) {
        if !self.room.session_active() {
            info!("Session activated by room signal");
        }
        self.room.activate();
    }

    /// Reconcile a full room snapshot.
    pub fn on_agent_update(&mut self, snapshot: &RoomSnapshot) {
        let local = self.self_id.clone().or_else(|| self.channel.connection_id());
        let was_active = self.room.session_active();
        let outcome = self.room.apply_snapshot(snapshot, local.as_ref(), Utc::now());

        if outcome.dropped > 0 {
            warn!(dropped = outcome.dropped, "Ignored malformed presence entries");
        }
        if outcome.remote_tracking && !was_active {
            info!("Session activated by a tracking member");
        }

        let Some(target) = self.tracking.clone() else {
            return;
        };
        match self.room.member(&target) {
            Some(presence) => {
                self.destination = Some(Destination::pursuit(presence.coordinates()));
            }
            None => {
                warn!(agent = %target, "Tracked agent left the room");
                self.tracking = None;
                if let Some(destination) = self.destination.as_mut() {
                    destination.mode = DestinationMode::Manual;
                }
                self.notices.push(SessionNotice::TargetLost { agent_id: target });
            }
        }
    }

    /// Recompute the connection state from the channel and buffer.
    pub fn refresh_connection_state(&mut self) -> ConnectionState {
        self.connection =
            ConnectionState::derive(self.channel.is_connected(), self.buffer.count());
        self.connection
    }

    /// Drain notices raised since the last call.
    pub fn take_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Close the channel for good.
    pub fn teardown(&mut self) {
        self.channel.disconnect();
        self.on_disconnected();
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_parts(self.phase, self.room.session_active())
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn room(&self) -> &RoomSession {
        &self.room
    }

    pub fn tracking(&self) -> Option<&AgentId> {
        self.tracking.as_ref()
    }

    pub fn destination(&self) -> Option<Destination> {
        self.destination
    }

    pub fn route(&self) -> Option<&RouteSummary> {
        self.route.as_ref()
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn buffer(&self) -> &TransmissionBuffer {
        &self.buffer
    }

    /// Link other participants can open to join this room.
    pub fn share_link(&self) -> Option<String> {
        let room_id = self.room.room_id()?;
        Some(format!(
            "{}/pathfinder?room={}",
            self.participant.share_base_url.trim_end_matches('/'),
            room_id
        ))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            connection: self.connection,
            room_id: self.room.room_id().cloned(),
            self_id: self.self_id.clone(),
            members: self.room.members().values().cloned().collect(),
            session_active: self.room.session_active(),
            tracking: self.tracking.clone(),
            destination: self.destination,
            route: self.route.clone(),
            position: self.position.clone(),
            positions_seen: self.positions_seen,
            accuracy: self.accuracy,
            trend: self.trend,
            alerts: self.alerts.clone(),
            buffered: self.buffer.count(),
            share_link: self.share_link(),
        }
    }
}
