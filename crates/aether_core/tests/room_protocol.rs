//! Integration tests for sessions talking to each other through the relay.
//!
//! Sessions are driven synchronously: every test pumps the inbound queue of
//! each participant by hand so the interleaving is deterministic.

use std::sync::Arc;

use aether_core::buffer::{QueueStore, SledQueueStore};
use aether_core::channel::InboundEvent;
use aether_core::config::TrackerConfig;
use aether_core::relay::{RelayHub, RelayLink};
use aether_core::session::{ConnectionState, Delivery, SessionNotice, SessionState};
use aether_core::{EventChannel, LocationSample, RoomId, TrackingSession, TransmissionBuffer};
use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

struct Participant {
    link: Arc<RelayLink>,
    inbox: UnboundedReceiver<InboundEvent>,
    session: TrackingSession,
}

impl Participant {
    fn join(hub: &RelayHub, config: TrackerConfig) -> Self {
        Self::join_with(hub, config, TransmissionBuffer::in_memory(500))
    }

    fn join_with(hub: &RelayHub, config: TrackerConfig, buffer: TransmissionBuffer) -> Self {
        let (link, inbox) = hub.connect();
        let channel: Arc<dyn EventChannel> = link.clone();
        let mut participant = Self {
            link,
            inbox,
            session: TrackingSession::new(&config, channel, buffer),
        };
        participant.session.begin_connect();
        participant.pump();
        participant
    }

    /// Apply every queued inbound event.
    fn pump(&mut self) {
        while let Ok(event) = self.inbox.try_recv() {
            self.session.handle(event);
        }
    }

    fn room(&self) -> RoomId {
        self.session.room().room_id().cloned().expect("joined a room")
    }

    fn id(&self) -> aether_core::AgentId {
        self.link.connection_id().expect("connected")
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn sample(n: i64) -> LocationSample {
    LocationSample::new(48.0 + n as f64 * 0.001, 2.0, Some(n as f64), 10.0)
        .at(t0() + Duration::seconds(n))
}

fn guest_config(room: RoomId) -> TrackerConfig {
    let mut config = TrackerConfig::default();
    config.participant.room = Some(room);
    config
}

#[test]
fn reconnect_replays_buffer_in_order_and_rejoins() {
    let hub = RelayHub::new();
    let mut agent = Participant::join(&hub, TrackerConfig::default());
    assert_eq!(agent.session.state(), SessionState::JoinedIdle);
    let room = agent.room();

    assert_eq!(agent.session.on_position(sample(0)).delivery, Delivery::Sent);
    hub.take_location_updates();

    agent.link.drop_link();
    agent.pump();
    assert_eq!(agent.session.state(), SessionState::Disconnected);

    for n in 1..=3 {
        assert_eq!(agent.session.on_position(sample(n)).delivery, Delivery::Buffered);
    }
    assert_eq!(agent.session.buffer().count(), 3);
    assert_eq!(agent.session.refresh_connection_state(), ConnectionState::Offline);
    assert!(hub.take_location_updates().is_empty());

    agent.link.restore();
    agent.pump();

    let replayed: Vec<_> = hub
        .take_location_updates()
        .into_iter()
        .map(|(_, update)| update.speed)
        .collect();
    assert_eq!(replayed, vec![Some(1.0), Some(2.0), Some(3.0)]);
    assert!(agent.session.buffer().is_empty());
    assert_eq!(agent.room(), room);
    assert_eq!(agent.session.state(), SessionState::JoinedIdle);
    assert_eq!(agent.session.refresh_connection_state(), ConnectionState::Live);

    // presence lands in the first room under the new connection id
    agent.session.on_position(sample(4));
    let snapshot = hub.room_snapshot(&room);
    assert!(snapshot.contains_key(agent.id().as_str()));
}

#[test]
fn guest_sees_host_and_tracking_activates_room() {
    let hub = RelayHub::new();
    let mut host = Participant::join(&hub, TrackerConfig::default());
    let mut guest = Participant::join(&hub, guest_config(host.room()));

    host.session.on_position(sample(1));
    guest.pump();
    host.pump();

    let host_id = host.id();
    let seen = guest.session.room().member(&host_id).expect("host visible");
    assert_eq!(seen.display_name, "Web User");
    assert!((seen.latitude - 48.001).abs() < 1e-9);
    // the host does not list itself
    assert!(host.session.room().members().is_empty());

    assert!(guest.session.start_tracking(&host_id));
    assert_eq!(guest.session.state(), SessionState::JoinedActive);

    host.pump();
    assert_eq!(host.session.state(), SessionState::JoinedActive);
}

#[test]
fn tracking_flag_in_presence_activates_late_joiner() {
    let hub = RelayHub::new();
    let mut host = Participant::join(&hub, TrackerConfig::default());
    let mut follower = Participant::join(&hub, guest_config(host.room()));

    host.session.on_position(sample(1));
    follower.pump();
    follower.session.start_tracking(&host.id());
    follower.session.on_position(sample(2));

    // joins after the track-started signal went out
    let mut late = Participant::join(&hub, guest_config(host.room()));
    assert_eq!(late.session.state(), SessionState::JoinedActive);
    late.pump();
    assert_eq!(late.session.room().members().len(), 2);
}

#[test]
fn target_dropping_off_raises_target_lost_once() {
    let hub = RelayHub::new();
    let mut host = Participant::join(&hub, TrackerConfig::default());
    let mut guest = Participant::join(&hub, guest_config(host.room()));
    host.session.on_position(sample(1));
    guest.pump();

    let host_id = host.id();
    guest.session.start_tracking(&host_id);
    guest.session.take_notices();

    host.link.drop_link();
    guest.pump();
    // another snapshot without the host changes nothing further
    guest.session.on_position(sample(2));
    guest.pump();

    assert_eq!(guest.session.tracking(), None);
    assert_eq!(
        guest.session.take_notices(),
        vec![SessionNotice::TargetLost { agent_id: host_id }]
    );
    assert_eq!(guest.session.state(), SessionState::JoinedActive);
}

#[test]
fn pursuit_destination_follows_target_updates() {
    let hub = RelayHub::new();
    let mut host = Participant::join(&hub, TrackerConfig::default());
    let mut guest = Participant::join(&hub, guest_config(host.room()));
    host.session.on_position(sample(1));
    guest.pump();
    guest.session.start_tracking(&host.id());

    host.session.on_position(sample(5));
    guest.pump();
    let destination = guest.session.destination().expect("pursuit destination");
    assert!((destination.coordinates.lat - 48.005).abs() < 1e-9);
}

#[test]
fn buffer_survives_restart_on_sled() {
    let dir = TempDir::new().unwrap();
    let config = TrackerConfig::default();
    let hub = RelayHub::new();

    {
        let store: Arc<dyn QueueStore> =
            Arc::new(SledQueueStore::open(dir.path(), &config.buffer.key).unwrap());
        let mut agent =
            Participant::join_with(&hub, config.clone(), TransmissionBuffer::open(store, 500));
        agent.link.drop_link();
        agent.pump();
        agent.session.on_position(sample(1));
        agent.session.on_position(sample(2));
        agent.link.disconnect();
    }

    let store: Arc<dyn QueueStore> =
        Arc::new(SledQueueStore::open(dir.path(), &config.buffer.key).unwrap());
    assert_eq!(store.load().unwrap().len(), 2);

    hub.take_location_updates();
    let agent =
        Participant::join_with(&hub, config, TransmissionBuffer::open(store.clone(), 500));
    assert!(agent.session.buffer().is_empty());
    let speeds: Vec<_> = hub
        .take_location_updates()
        .into_iter()
        .map(|(_, u)| u.speed)
        .collect();
    assert_eq!(speeds, vec![Some(1.0), Some(2.0)]);
    assert!(store.load().unwrap().is_empty());
}
