//! Offline transmission buffer.
//!
//! Samples that cannot be sent are queued here, persisted after every
//! mutation, and replayed as `update-location` events once the channel is
//! connected again. The queue is bounded; past capacity the oldest sample is
//! evicted so the most recent trail survives a long outage.
//!
//! Flushing is optimistic: every queued sample is emitted in arrival order
//! and the queue is then cleared without waiting for acknowledgements. If the
//! link dies mid-flush the emitted tail is lost (at-most-once delivery).

mod store;

pub use store::{MemoryQueueStore, QueueStore, SledQueueStore};

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{EventChannel, LocationUpdate, OutboundEvent};
use crate::location::LocationSample;

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 500;

/// A sample waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedSample {
    #[serde(flatten)]
    pub sample: LocationSample,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub buffered_at: DateTime<Utc>,
    pub offline: bool,
}

impl BufferedSample {
    pub fn offline(sample: LocationSample) -> Self {
        Self {
            sample,
            buffered_at: Utc::now(),
            offline: true,
        }
    }
}

/// Bounded FIFO of undelivered samples with durable backing.
pub struct TransmissionBuffer {
    queue: VecDeque<BufferedSample>,
    capacity: usize,
    store: Arc<dyn QueueStore>,
}

impl std::fmt::Debug for TransmissionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionBuffer")
            .field("count", &self.queue.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl TransmissionBuffer {
    /// Load the persisted queue. Storage faults are logged and yield an
    /// empty queue.
    pub fn open(store: Arc<dyn QueueStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut queue = match store.load() {
            Ok(queue) => queue,
            Err(e) => {
                warn!("Transmission buffer load failed, starting empty: {:?}", e);
                VecDeque::new()
            }
        };

        // a store written with a larger capacity keeps its newest entries
        while queue.len() > capacity {
            queue.pop_front();
        }

        if !queue.is_empty() {
            info!(count = queue.len(), "Restored buffered samples");
        }

        Self {
            queue,
            capacity,
            store,
        }
    }

    /// Volatile buffer for tests and one-shot runs.
    pub fn in_memory(capacity: usize) -> Self {
        Self::open(Arc::new(MemoryQueueStore::new()), capacity)
    }

    /// Queue a sample that could not be sent. Never fails.
    pub fn enqueue(&mut self, sample: LocationSample) {
        self.queue.push_back(BufferedSample::offline(sample));
        while self.queue.len() > self.capacity {
            if let Some(evicted) = self.queue.pop_front() {
                debug!(
                    buffered_at = %evicted.buffered_at,
                    "Buffer full, dropped oldest sample"
                );
            }
        }
        self.persist();
        debug!(count = self.queue.len(), "Buffered sample");
    }

    /// Replay every queued sample on `channel`, then clear the queue.
    ///
    /// Returns the number of samples emitted. Does nothing when the channel
    /// is absent, disconnected, or there is nothing queued.
    pub fn flush(&mut self, channel: Option<&dyn EventChannel>) -> usize {
        let Some(channel) = channel else {
            return 0;
        };
        if !channel.is_connected() || self.queue.is_empty() {
            return 0;
        }

        let total = self.queue.len();
        info!(count = total, "Flushing buffered samples");

        let mut failed = 0usize;
        for point in &self.queue {
            let update = LocationUpdate::from(&point.sample);
            if let Err(e) = channel.emit(OutboundEvent::UpdateLocation(update)) {
                failed += 1;
                debug!("Buffered sample emit failed: {}", e);
            }
        }
        if failed > 0 {
            warn!(
                failed,
                total, "Channel dropped during flush, samples not re-queued"
            );
        }

        self.queue.clear();
        self.persist();
        total
    }

    pub fn count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued samples, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BufferedSample> {
        self.queue.iter()
    }

    /// Drop everything without sending.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.queue) {
            warn!("Transmission buffer save failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChannelError, StorageError};
    use crate::id::AgentId;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingChannel {
        connected: bool,
        sent: Mutex<Vec<OutboundEvent>>,
    }

    impl EventChannel for RecordingChannel {
        fn connection_id(&self) -> Option<AgentId> {
            Some(AgentId::new("me"))
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn emit(&self, event: OutboundEvent) -> Result<(), ChannelError> {
            self.sent.lock().push(event);
            Ok(())
        }

        fn disconnect(&self) {}
    }

    struct BrokenStore;

    impl QueueStore for BrokenStore {
        fn load(&self) -> Result<VecDeque<BufferedSample>, StorageError> {
            Err(StorageError::Corrupt {
                key: "broken".into(),
                cause: serde_json::from_str::<u8>("x").unwrap_err(),
            })
        }

        fn save(&self, _queue: &VecDeque<BufferedSample>) -> Result<(), StorageError> {
            Err(StorageError::Corrupt {
                key: "broken".into(),
                cause: serde_json::from_str::<u8>("x").unwrap_err(),
            })
        }
    }

    fn numbered(n: usize) -> LocationSample {
        LocationSample::new(n as f64 / 1000.0, 0.0, Some(n as f64), 5.0)
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = TransmissionBuffer::in_memory(500);
        for n in 1..=501 {
            buffer.enqueue(numbered(n));
        }
        assert_eq!(buffer.count(), 500);
        let oldest = buffer.iter().next().unwrap();
        assert_eq!(oldest.sample.speed, Some(2.0));
        let newest = buffer.iter().last().unwrap();
        assert_eq!(newest.sample.speed, Some(501.0));
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut buffer = TransmissionBuffer::in_memory(3);
        for n in 0..20 {
            buffer.enqueue(numbered(n));
            assert!(buffer.count() <= 3);
        }
        let speeds: Vec<_> = buffer.iter().map(|b| b.sample.speed).collect();
        assert_eq!(speeds, vec![Some(17.0), Some(18.0), Some(19.0)]);
    }

    #[test]
    fn test_enqueue_persists_before_returning() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut buffer = TransmissionBuffer::open(store.clone(), 10);
        buffer.enqueue(numbered(1));

        let reloaded = TransmissionBuffer::open(store, 10);
        assert_eq!(reloaded.count(), 1);
        assert!(reloaded.iter().all(|b| b.offline));
    }

    #[test]
    fn test_flush_without_channel_is_noop() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut buffer = TransmissionBuffer::open(store.clone(), 10);
        buffer.enqueue(numbered(1));
        let before = store.record();

        assert_eq!(buffer.flush(None), 0);
        let offline = RecordingChannel::default();
        assert_eq!(buffer.flush(Some(&offline)), 0);

        assert_eq!(buffer.count(), 1);
        assert_eq!(store.record(), before);
        assert!(offline.sent.lock().is_empty());
    }

    #[test]
    fn test_flush_empty_queue_is_noop() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut buffer = TransmissionBuffer::open(store.clone(), 10);
        let channel = RecordingChannel {
            connected: true,
            ..Default::default()
        };
        assert_eq!(buffer.flush(Some(&channel)), 0);
        assert!(store.record().is_none());
        assert!(channel.sent.lock().is_empty());
    }

    #[test]
    fn test_flush_replays_in_order_and_clears() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut buffer = TransmissionBuffer::open(store.clone(), 10);
        for n in 1..=3 {
            buffer.enqueue(numbered(n));
        }

        let channel = RecordingChannel {
            connected: true,
            ..Default::default()
        };
        assert_eq!(buffer.flush(Some(&channel)), 3);
        assert_eq!(buffer.count(), 0);

        let speeds: Vec<_> = channel
            .sent
            .lock()
            .iter()
            .map(|event| match event {
                OutboundEvent::UpdateLocation(update) => update.speed,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(speeds, vec![Some(1.0), Some(2.0), Some(3.0)]);

        let reloaded = TransmissionBuffer::open(store, 10);
        assert_eq!(reloaded.count(), 0);
    }

    #[test]
    fn test_flush_preserves_capture_timestamp() {
        let ts = DateTime::from_timestamp_millis(1_650_000_000_000).unwrap();
        let mut buffer = TransmissionBuffer::in_memory(10);
        buffer.enqueue(numbered(1).at(ts));

        let channel = RecordingChannel {
            connected: true,
            ..Default::default()
        };
        buffer.flush(Some(&channel));
        let sent = channel.sent.lock();
        match &sent[0] {
            OutboundEvent::UpdateLocation(update) => assert_eq!(update.timestamp, ts),
            other => panic!("unexpected event {:?}", other),
        }
    }

    /// Accepts the first event, then reports the link as gone.
    #[derive(Default)]
    struct DroppingChannel {
        emitted: Mutex<usize>,
    }

    impl EventChannel for DroppingChannel {
        fn connection_id(&self) -> Option<AgentId> {
            Some(AgentId::new("me"))
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn emit(&self, _event: OutboundEvent) -> Result<(), ChannelError> {
            let mut emitted = self.emitted.lock();
            *emitted += 1;
            if *emitted > 1 {
                return Err(ChannelError::NotConnected);
            }
            Ok(())
        }

        fn disconnect(&self) {}
    }

    #[test]
    fn test_flush_drops_tail_when_link_fails_midway() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut buffer = TransmissionBuffer::open(store.clone(), 10);
        for n in 1..=3 {
            buffer.enqueue(numbered(n));
        }

        let channel = DroppingChannel::default();
        assert_eq!(buffer.flush(Some(&channel)), 3);
        assert_eq!(*channel.emitted.lock(), 3);
        assert_eq!(buffer.count(), 0);

        let reloaded = TransmissionBuffer::open(store, 10);
        assert_eq!(reloaded.count(), 0);
    }

    #[test]
    fn test_storage_faults_are_not_fatal() {
        let mut buffer = TransmissionBuffer::open(Arc::new(BrokenStore), 10);
        assert_eq!(buffer.count(), 0);
        buffer.enqueue(numbered(1));
        assert_eq!(buffer.count(), 1);
    }

    #[test]
    fn test_open_truncates_oversized_store() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut big = TransmissionBuffer::open(store.clone(), 10);
        for n in 0..10 {
            big.enqueue(numbered(n));
        }
        let small = TransmissionBuffer::open(store, 4);
        assert_eq!(small.count(), 4);
        assert_eq!(small.iter().next().unwrap().sample.speed, Some(6.0));
    }
}
