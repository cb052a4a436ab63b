//! Replay a recorded position trace through an in-process room.
//!
//! The traced participant runs as an agent on a [`RelayHub`]; the link can be
//! dropped and restored part way through to watch samples get buffered and
//! replayed. With `--follow` a second, web participant joins the same room
//! and tracks the agent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aether_core::buffer::{SledQueueStore, TransmissionBuffer};
use aether_core::config::{ParticipantMode, TrackerConfig};
use aether_core::error::SensorError;
use aether_core::relay::RelayHub;
use aether_core::session::{ConnectionState, SessionNotice, SessionSnapshot, SessionState};
use aether_core::{
    AlertLevel, EventChannel, LocationSample, RelayLink, RoomId, Services, Tracker, TrackerHandle,
    TrackingSession,
};
use miette::{IntoDiagnostic, Result};
use owo_colors::OwoColorize;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::output::Output;

const FOLLOW_TIMEOUT: Duration = Duration::from_secs(1);

pub struct SimulateOptions {
    pub trace: PathBuf,
    pub room: Option<String>,
    pub drop_at: Option<usize>,
    pub restore_at: Option<usize>,
    pub follow: bool,
    pub json: bool,
}

/// One line of a trace file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TraceEntry {
    Fault { fault: SensorError },
    Sample(LocationSample),
}

/// Parse a JSON-lines trace. Blank lines and `#` comments are skipped.
pub fn parse_trace(content: &str) -> Result<Vec<TraceEntry>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(n, line)| {
            serde_json::from_str(line)
                .map_err(|e| miette::miette!("Trace line {}: {}", n + 1, e))
        })
        .collect()
}

pub async fn run(config: &TrackerConfig, options: SimulateOptions, output: &Output) -> Result<()> {
    let content = tokio::fs::read_to_string(&options.trace)
        .await
        .map_err(|e| miette::miette!("Failed to read {}: {}", options.trace.display(), e))?;
    let entries = parse_trace(&content)?;
    info!(samples = entries.len(), "Replaying trace");

    let hub = RelayHub::new();

    let mut agent_config = config.clone();
    agent_config.participant.mode = ParticipantMode::Agent;
    if let Some(room) = &options.room {
        agent_config.participant.room = Some(RoomId::new(room.as_str()));
    }

    // replays never touch the user's durable buffer
    let store = SledQueueStore::temporary(config.buffer.key.clone())?;
    let buffer = TransmissionBuffer::open(Arc::new(store), config.buffer.capacity);

    let (link, inbound) = hub.connect();
    let channel: Arc<dyn EventChannel> = link.clone();
    let session = TrackingSession::new(&agent_config, channel, buffer);
    let (samples, sample_rx) = mpsc::unbounded_channel();
    let mut agent = Tracker::spawn(
        session,
        UnboundedReceiverStream::new(sample_rx),
        inbound,
        Services::default(),
        config.session.poll_interval(),
    );
    let mut agent_notices = agent.subscribe_notices();

    let joined = agent.wait_for(is_joined).await?;
    let room = joined
        .room_id
        .clone()
        .ok_or_else(|| miette::miette!("Agent joined without a room"))?;

    output.section("Simulation");
    output.kv("room", room.as_str());
    if let Some(link) = &joined.share_link {
        output.kv("share link", link);
    }
    output.print("");

    let mut observer = if options.follow {
        let handle = spawn_observer(&hub, config, &room).await?;
        let notices = handle.subscribe_notices();
        Some((handle, notices))
    } else {
        None
    };

    for (n, entry) in entries.into_iter().enumerate() {
        if options.drop_at == Some(n) {
            link.drop_link();
            agent.wait_for(|s| s.state == SessionState::Disconnected).await?;
            output.warning(&format!("link dropped before sample {}", n + 1));
        }
        if options.restore_at == Some(n) {
            link.restore();
            let snapshot = agent.wait_for(|s| is_joined(s) && s.buffered == 0).await?;
            output.success(&format!(
                "link restored before sample {}, rejoined {}",
                n + 1,
                snapshot.room_id.as_ref().map(|r| r.as_str()).unwrap_or("-")
            ));
        }

        let sample = match entry {
            TraceEntry::Sample(sample) => sample,
            TraceEntry::Fault { fault } => {
                samples
                    .send(Err(fault.clone()))
                    .map_err(|_| miette::miette!("Tracker stopped"))?;
                output.warning(&format!("{:>4}  sensor fault: {}", n + 1, fault));
                continue;
            }
        };

        let seen = agent.snapshot().positions_seen;
        samples
            .send(Ok(sample))
            .map_err(|_| miette::miette!("Tracker stopped"))?;
        let snapshot = agent.wait_for(|s| s.positions_seen > seen).await?;
        print_step(n, &snapshot, output);

        // re-follow after the agent reconnects under a new id
        if let Some((observer, _)) = observer.as_mut() {
            if observer.snapshot().tracking.is_none() {
                try_follow(observer, &link).await?;
            }
        }
    }

    let final_snapshot = agent.snapshot();
    agent.shutdown().await?;
    let observer_snapshot = match observer {
        Some((observer, mut notices)) => {
            let snapshot = observer.snapshot();
            observer.shutdown().await?;
            drain_notices(&mut notices, "observer", output);
            Some(snapshot)
        }
        None => None,
    };
    drain_notices(&mut agent_notices, "agent", output);

    let delivered = hub.take_location_updates().len();

    output.print("");
    output.section("Summary");
    output.kv("state", &final_snapshot.state.to_string());
    output.kv("delivered", &delivered.to_string());
    output.kv("still buffered", &final_snapshot.buffered.to_string());
    if let Some(observer) = &observer_snapshot {
        output.kv(
            "observer",
            &format!(
                "{} (tracking {})",
                observer.state,
                observer
                    .tracking
                    .as_ref()
                    .map(|id| id.as_str())
                    .unwrap_or("nobody")
            ),
        );
    }

    if options.json {
        let json = serde_json::to_string_pretty(&final_snapshot).into_diagnostic()?;
        println!("{}", json);
    }
    Ok(())
}

fn is_joined(snapshot: &SessionSnapshot) -> bool {
    matches!(
        snapshot.state,
        SessionState::JoinedIdle | SessionState::JoinedActive
    )
}

async fn spawn_observer(
    hub: &RelayHub,
    config: &TrackerConfig,
    room: &RoomId,
) -> Result<TrackerHandle> {
    let mut observer_config = config.clone();
    observer_config.participant.mode = ParticipantMode::Web;
    observer_config.participant.room = Some(room.clone());

    let (link, inbound) = hub.connect();
    let channel: Arc<dyn EventChannel> = link;
    let session = TrackingSession::new(
        &observer_config,
        channel,
        TransmissionBuffer::in_memory(config.buffer.capacity),
    );
    let mut observer = Tracker::spawn(
        session,
        tokio_stream::empty(),
        inbound,
        Services::default(),
        config.session.poll_interval(),
    );
    observer.wait_for(is_joined).await?;
    Ok(observer)
}

/// Start following the agent once the observer can see it.
async fn try_follow(observer: &mut TrackerHandle, agent: &RelayLink) -> Result<()> {
    let Some(agent_id) = agent.connection_id() else {
        return Ok(());
    };
    let visible = tokio::time::timeout(
        FOLLOW_TIMEOUT,
        observer.wait_for(|s| s.members.iter().any(|m| m.agent_id == agent_id)),
    )
    .await;
    match visible {
        Ok(snapshot) => {
            snapshot?;
            observer.start_tracking(agent_id.clone())?;
            debug!(agent = %agent_id, "Observer following agent");
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

fn print_step(n: usize, snapshot: &SessionSnapshot, output: &Output) {
    let Some(position) = &snapshot.position else {
        return;
    };
    let label = snapshot.connection.to_string();
    let connection = match snapshot.connection {
        ConnectionState::Live => label.green().to_string(),
        ConnectionState::Recovering => label.yellow().to_string(),
        ConnectionState::Offline => label.red().to_string(),
    };
    output.print(&format!(
        "{:>4}  {:>10.5} {:>11.5}  speed {:>6.1}  {:<10}  buffered {}",
        n + 1,
        position.latitude,
        position.longitude,
        position.speed_or_zero(),
        connection,
        snapshot.buffered,
    ));
    for alert in &snapshot.alerts {
        let message = match alert.level {
            AlertLevel::Success => alert.message.green().to_string(),
            AlertLevel::Warning => alert.message.yellow().to_string(),
            AlertLevel::Danger => alert.message.red().bold().to_string(),
        };
        output.print(&format!("        {}", message));
    }
}

fn drain_notices(
    notices: &mut broadcast::Receiver<SessionNotice>,
    who: &str,
    output: &Output,
) {
    loop {
        match notices.try_recv() {
            Ok(notice) => output.warning(&format!("{}: {}", who, notice)),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                output.warning(&format!("{}: {} notices skipped", who, skipped));
            }
            Err(_) => break,
        }
    }
}
