//! Replayable log of outbound streamable-HTTP messages.
//!
//! Event ids are `<streamId>_<seq>` where `seq` is a zero-padded, process-wide counter.
//! Stream ids may contain `_`; the sequence is always the part after the last one.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventLogError {
    #[error("malformed event id: {0}")]
    MalformedEventId(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub stream_id: String,
    pub message: Value,
}

/// Storage for resumable SSE streams.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `message` to `stream_id` and return its event id.
    async fn store_event(&self, stream_id: &str, message: Value) -> String;

    /// Events of the same stream recorded strictly after `last_event_id`, oldest first.
    async fn replay_events_after(
        &self,
        last_event_id: &str,
    ) -> Result<Vec<EventRecord>, EventLogError>;

    /// Drop every event recorded for `stream_id`.
    fn remove_stream(&self, stream_id: &str);
}

pub fn event_id(stream_id: &str, seq: u64) -> String {
    format!("{stream_id}_{seq:020}")
}

/// Split an event id into its stream id and sequence number.
pub fn parse_event_id(event_id: &str) -> Option<(&str, u64)> {
    let (stream_id, seq) = event_id.rsplit_once('_')?;
    if stream_id.is_empty() {
        return None;
    }
    Some((stream_id, seq.parse().ok()?))
}

#[derive(Debug, Default)]
struct Inner {
    last_seq: u64,
    events: BTreeMap<u64, EventRecord>,
}

/// Process-local event store. Lives as long as the gateway; cleared on shutdown.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: Mutex<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().events.clear();
    }

    fn append(&self, stream_id: &str, message: Value) -> String {
        let mut inner = self.inner.lock();
        inner.last_seq += 1;
        let seq = inner.last_seq;
        let id = event_id(stream_id, seq);
        inner.events.insert(
            seq,
            EventRecord {
                event_id: id.clone(),
                stream_id: stream_id.to_string(),
                message,
            },
        );
        id
    }

    fn replay(&self, last_event_id: &str) -> Result<Vec<EventRecord>, EventLogError> {
        let (stream_id, after) = parse_event_id(last_event_id)
            .ok_or_else(|| EventLogError::MalformedEventId(last_event_id.to_string()))?;
        let inner = self.inner.lock();
        Ok(inner
            .events
            .range(after.saturating_add(1)..)
            .map(|(_, record)| record)
            .filter(|record| record.stream_id == stream_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(&self, stream_id: &str, message: Value) -> String {
        self.append(stream_id, message)
    }

    async fn replay_events_after(
        &self,
        last_event_id: &str,
    ) -> Result<Vec<EventRecord>, EventLogError> {
        self.replay(last_event_id)
    }

    fn remove_stream(&self, stream_id: &str) {
        self.inner
            .lock()
            .events
            .retain(|_, record| record.stream_id != stream_id);
    }
}
