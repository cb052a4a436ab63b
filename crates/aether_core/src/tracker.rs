//! Single-writer task driving a [`TrackingSession`].
//!
//! Geolocation samples, inbound channel events, the connection poll and
//! user commands are independent sources; the tracker task is the only code
//! that touches the session, so handlers never overlap. Lookups run on their
//! own tasks and report back through an internal queue.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

use crate::channel::InboundEvent;
use crate::error::{CoreError, LookupError, SensorError};
use crate::id::AgentId;
use crate::location::{Coordinates, LocationSample};
use crate::lookup::{Geocoder, RouteSummary, Router};
use crate::session::{SessionNotice, SessionSnapshot, TrackingSession};
use crate::Result;

const NOTICE_CAPACITY: usize = 64;

/// Requests accepted by a running tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerCommand {
    StartTracking(AgentId),
    StopTracking,
    SetDestination(Coordinates),
    ClearDestination,
    SearchDestination(String),
    RefreshRoute,
    Shutdown,
}

/// Optional lookup collaborators.
#[derive(Clone, Default)]
pub struct Services {
    pub geocoder: Option<Arc<dyn Geocoder>>,
    pub router: Option<Arc<dyn Router>>,
}

enum LookupReply {
    Geocoded {
        query: String,
        result: std::result::Result<Option<Coordinates>, LookupError>,
    },
    Routed(std::result::Result<RouteSummary, LookupError>),
}

pub struct Tracker;

impl Tracker {
    /// Start driving `session` on the current runtime.
    ///
    /// `inbound` is the queue the transport feeds with channel events.
    pub fn spawn<S>(
        session: TrackingSession,
        positions: S,
        inbound: mpsc::UnboundedReceiver<InboundEvent>,
        services: Services,
        poll_interval: Duration,
    ) -> TrackerHandle
    where
        S: Stream<Item = std::result::Result<LocationSample, SensorError>> + Send + Unpin + 'static,
    {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(session.snapshot());
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        let driver = Driver {
            session,
            services,
            snapshots: snapshot_tx,
            notices: notice_tx.clone(),
        };
        let task = tokio::spawn(driver.run(positions, inbound, commands_rx, poll_interval));

        TrackerHandle {
            commands: commands_tx,
            snapshots: snapshot_rx,
            notices: notice_tx,
            task,
        }
    }
}

struct Driver {
    session: TrackingSession,
    services: Services,
    snapshots: watch::Sender<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
}

impl Driver {
    async fn run<S>(
        mut self,
        mut positions: S,
        mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
        mut commands: mpsc::UnboundedReceiver<TrackerCommand>,
        poll_interval: Duration,
    ) -> TrackingSession
    where
        S: Stream<Item = std::result::Result<LocationSample, SensorError>> + Send + Unpin,
    {
        let (lookup_tx, mut lookup_rx) = mpsc::unbounded_channel();
        let mut poll = tokio::time::interval(poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut positions_open = true;
        let mut inbound_open = true;

        self.session.begin_connect();
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(TrackerCommand::Shutdown) => break,
                    Some(command) => self.apply(command, &lookup_tx),
                },
                sample = positions.next(), if positions_open => match sample {
                    Some(Ok(sample)) => {
                        self.session.on_position(sample);
                    }
                    Some(Err(error)) => self.session.on_sensor_error(error),
                    None => {
                        info!("Geolocation stream ended");
                        positions_open = false;
                    }
                },
                event = inbound.recv(), if inbound_open => match event {
                    Some(event) => self.session.handle(event),
                    None => {
                        debug!("Inbound channel closed");
                        inbound_open = false;
                        self.session.on_disconnected();
                    }
                },
                Some(reply) = lookup_rx.recv() => match reply {
                    LookupReply::Geocoded { query, result } => {
                        self.session.apply_search_result(&query, result);
                    }
                    LookupReply::Routed(result) => self.session.apply_route_result(result),
                },
                _ = poll.tick() => {
                    self.session.refresh_connection_state();
                }
            }
            self.publish();
        }

        // stop the subscription and close the channel together
        drop(positions);
        self.session.teardown();
        self.publish();
        info!("Tracker stopped");
        self.session
    }

    fn apply(&mut self, command: TrackerCommand, lookups: &mpsc::UnboundedSender<LookupReply>) {
        match command {
            TrackerCommand::StartTracking(agent_id) => {
                self.session.start_tracking(&agent_id);
            }
            TrackerCommand::StopTracking => self.session.stop_tracking(),
            TrackerCommand::SetDestination(coordinates) => {
                self.session.set_destination(coordinates)
            }
            TrackerCommand::ClearDestination => self.session.clear_destination(),
            TrackerCommand::SearchDestination(query) => {
                let query = query.trim().to_string();
                if query.is_empty() {
                    return;
                }
                let Some(geocoder) = self.services.geocoder.clone() else {
                    warn!("No geocoder configured, search ignored");
                    return;
                };
                let reply = lookups.clone();
                tokio::spawn(async move {
                    let result = geocoder.lookup(&query).await;
                    let _ = reply.send(LookupReply::Geocoded { query, result });
                });
            }
            TrackerCommand::RefreshRoute => {
                let Some((from, to)) = self.session.route_request() else {
                    debug!("Route refresh skipped, no position or destination");
                    return;
                };
                let Some(router) = self.services.router.clone() else {
                    warn!("No router configured, route refresh ignored");
                    return;
                };
                let reply = lookups.clone();
                tokio::spawn(async move {
                    let result = router.route(from, to).await;
                    let _ = reply.send(LookupReply::Routed(result));
                });
            }
            TrackerCommand::Shutdown => {}
        }
    }

    fn publish(&mut self) {
        for notice in self.session.take_notices() {
            // no subscribers is fine
            let _ = self.notices.send(notice);
        }
        self.snapshots.send_replace(self.session.snapshot());
    }
}

/// Control and observation side of a running tracker.
pub struct TrackerHandle {
    commands: mpsc::UnboundedSender<TrackerCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    task: JoinHandle<TrackingSession>,
}

impl TrackerHandle {
    pub fn send(&self, command: TrackerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CoreError::TrackerStopped)
    }

    pub fn start_tracking(&self, agent_id: AgentId) -> Result<()> {
        self.send(TrackerCommand::StartTracking(agent_id))
    }

    pub fn stop_tracking(&self) -> Result<()> {
        self.send(TrackerCommand::StopTracking)
    }

    pub fn set_destination(&self, coordinates: Coordinates) -> Result<()> {
        self.send(TrackerCommand::SetDestination(coordinates))
    }

    pub fn search_destination(&self, query: impl Into<String>) -> Result<()> {
        self.send(TrackerCommand::SearchDestination(query.into()))
    }

    pub fn refresh_route(&self) -> Result<()> {
        self.send(TrackerCommand::RefreshRoute)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Notices raised after this call.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let snapshot = self
            .snapshots
            .wait_for(predicate)
            .await
            .map_err(|_| CoreError::TrackerStopped)?;
        Ok(snapshot.clone())
    }

    /// Stop the tracker and hand back the final session.
    pub async fn shutdown(self) -> Result<TrackingSession> {
        // the task may already be gone; joining tells us either way
        let _ = self.commands.send(TrackerCommand::Shutdown);
        self.task.await.map_err(|e| {
            warn!("Tracker task failed: {}", e);
            CoreError::TrackerStopped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::TransmissionBuffer;
    use crate::channel::EventChannel;
    use crate::config::TrackerConfig;
    use crate::relay::RelayHub;
    use crate::session::SessionState;
    use async_trait::async_trait;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    struct FixedGeocoder(Option<Coordinates>);

    #[async_trait]
    impl Geocoder for FixedGeocoder {
        async fn lookup(
            &self,
            _query: &str,
        ) -> std::result::Result<Option<Coordinates>, LookupError> {
            Ok(self.0)
        }
    }

    type SampleTx = mpsc::UnboundedSender<std::result::Result<LocationSample, SensorError>>;

    fn spawn_on(hub: &RelayHub, services: Services) -> (TrackerHandle, SampleTx) {
        let (link, inbound) = hub.connect();
        let channel: Arc<dyn EventChannel> = link;
        let session = TrackingSession::new(
            &TrackerConfig::default(),
            channel,
            TransmissionBuffer::in_memory(500),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Tracker::spawn(
            session,
            UnboundedReceiverStream::new(rx),
            inbound,
            services,
            Duration::from_millis(50),
        );
        (handle, tx)
    }

    #[tokio::test]
    async fn test_tracker_joins_and_publishes() {
        let hub = RelayHub::new();
        let (mut handle, samples) = spawn_on(&hub, Services::default());

        let joined = handle
            .wait_for(|s| s.state == SessionState::JoinedIdle)
            .await
            .unwrap();
        assert!(joined.room_id.is_some());

        samples
            .send(Ok(LocationSample::new(1.0, 2.0, Some(3.0), 4.0)))
            .unwrap();
        let moved = handle.wait_for(|s| s.position.is_some()).await.unwrap();
        assert_eq!(moved.buffered, 0);
        assert_eq!(hub.take_location_updates().len(), 1);

        let session = handle.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_sensor_errors_become_notices() {
        let hub = RelayHub::new();
        let (handle, samples) = spawn_on(&hub, Services::default());
        let mut notices = handle.subscribe_notices();

        samples.send(Err(SensorError::Timeout)).unwrap();
        let notice = notices.recv().await.unwrap();
        assert_eq!(
            notice,
            SessionNotice::SensorFault {
                error: SensorError::Timeout
            }
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_search_miss_raises_notice() {
        let hub = RelayHub::new();
        let services = Services {
            geocoder: Some(Arc::new(FixedGeocoder(None))),
            router: None,
        };
        let (handle, _samples) = spawn_on(&hub, services);
        let mut notices = handle.subscribe_notices();

        handle.search_destination("atlantis").unwrap();
        assert_eq!(
            notices.recv().await.unwrap(),
            SessionNotice::DestinationNotFound {
                query: "atlantis".into()
            }
        );
        assert!(handle.snapshot().destination.is_none());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_search_hit_sets_destination() {
        let hub = RelayHub::new();
        let services = Services {
            geocoder: Some(Arc::new(FixedGeocoder(Some(Coordinates::new(4.0, 5.0))))),
            router: None,
        };
        let (mut handle, _samples) = spawn_on(&hub, services);

        handle.search_destination("port").unwrap();
        let snapshot = handle.wait_for(|s| s.destination.is_some()).await.unwrap();
        assert_eq!(
            snapshot.destination.map(|d| d.coordinates),
            Some(Coordinates::new(4.0, 5.0))
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let hub = RelayHub::new();
        let (handle, _samples) = spawn_on(&hub, Services::default());
        let commands = handle.commands.clone();
        handle.shutdown().await.unwrap();
        assert!(commands.send(TrackerCommand::StopTracking).is_err());
    }
}
