//! Core of Aether: offline-resilient location sharing for tracking rooms.
//!
//! A participant streams position samples into a [`TrackingSession`]. While
//! the event channel is up, samples go straight to the room; while it is
//! down they wait in a durable [`TransmissionBuffer`] and are replayed on
//! reconnect. Every sample also runs through the [`AlertEngine`], and room
//! snapshots from the relay keep the local view of other members, session
//! activation and the tracking target in sync.
//!
//! [`Tracker`] wraps a session in a single-writer tokio task fed by the
//! geolocation stream, channel events, a connection poll and user commands.

pub mod alerts;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod error;
pub mod id;
pub mod location;
pub mod lookup;
pub mod relay;
pub mod session;
pub mod tracker;

pub use alerts::{Alert, AlertEngine, AlertKind, AlertLevel};
pub use buffer::{BufferedSample, MemoryQueueStore, QueueStore, SledQueueStore, TransmissionBuffer};
pub use channel::{EventChannel, InboundEvent, OutboundEvent};
pub use config::TrackerConfig;
pub use error::{CoreError, Result};
pub use id::{AgentId, RoomId};
pub use location::{Coordinates, LocationSample, haversine_km};
pub use relay::{RelayHub, RelayLink};
pub use session::{ConnectionState, SessionNotice, SessionSnapshot, SessionState, TrackingSession};
pub use tracker::{Services, Tracker, TrackerCommand, TrackerHandle};

/// Common imports for driving a session.
pub mod prelude {
    pub use crate::{
        AgentId, Alert, AlertKind, ConnectionState, Coordinates, CoreError, EventChannel,
        InboundEvent, LocationSample, OutboundEvent, RelayHub, Result, RoomId, Services,
        SessionNotice, SessionSnapshot, SessionState, Tracker, TrackerConfig, TrackerHandle,
        TrackingSession, TransmissionBuffer,
    };
}
