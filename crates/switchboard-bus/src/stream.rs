//! Ordered, consumer-group based event log.
//!
//! Semantics follow a Redis stream read through `XREADGROUP ... >`: each group
//! has a cursor, delivered entries stay pending until acknowledged, and a
//! group created on an existing stream starts at its current tail.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::StreamError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Create the group (and the stream) if missing. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError>;

    /// Read up to `count` new entries for `group`, waiting at most `block`.
    /// An empty vec means nothing arrived in time.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Acknowledge delivered entries; returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, StreamError>;
}

#[derive(Default)]
struct GroupState {
    cursor: usize,
    pending: BTreeMap<String, String>,
}

#[derive(Default)]
struct StreamLog {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
    next_seq: u64,
}

#[derive(Default)]
pub struct MemoryStream {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, creating the stream if needed. Returns the entry id.
    pub fn append<K, V>(&self, stream: &str, fields: impl IntoIterator<Item = (K, V)>) -> String
    where
        K: Into<String>,
        V: Into<String>,
    {
        let id = {
            let mut streams = self.streams.lock();
            let log = streams.entry(stream.to_string()).or_default();
            log.next_seq += 1;
            let id = format!("{}-0", log.next_seq);
            log.entries.push(StreamEntry {
                id: id.clone(),
                fields: fields
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            });
            id
        };
        self.appended.notify_waiters();
        id
    }

    pub fn len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map_or(0, |log| log.entries.len())
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Entries delivered to the group but not yet acknowledged.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Number of entries the group has already been handed.
    pub fn delivered_count(&self, stream: &str, group: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |g| g.cursor)
    }

    fn take_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut streams = self.streams.lock();
        let no_group = || StreamError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let log = streams.get_mut(stream).ok_or_else(no_group)?;
        let StreamLog { entries, groups, .. } = log;
        let state = groups.get_mut(group).ok_or_else(no_group)?;

        let end = entries.len().min(state.cursor + count.max(1));
        let batch: Vec<StreamEntry> = entries[state.cursor..end].to_vec();
        for entry in &batch {
            state.pending.insert(entry.id.clone(), consumer.to_string());
        }
        state.cursor = end;
        Ok(batch)
    }
}

#[async_trait]
impl EventStream for MemoryStream {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut streams = self.streams.lock();
        let log = streams.entry(stream.to_string()).or_default();
        let tail = log.entries.len();
        log.groups.entry(group.to_string()).or_insert_with(|| GroupState {
            cursor: tail,
            pending: BTreeMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register interest before checking so an append in between is not missed.
            let appended = self.appended.notified();
            let batch = self.take_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            tokio::select! {
                _ = appended => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<usize, StreamError> {
        let mut streams = self.streams.lock();
        let Some(state) = streams
            .get_mut(stream)
            .and_then(|log| log.groups.get_mut(group))
        else {
            return Err(StreamError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        };
        Ok(ids
            .iter()
            .filter(|id| state.pending.remove(id.as_str()).is_some())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const STREAM: &str = "predictions";
    const GROUP: &str = "cg:PREDICTIONS";

    #[tokio::test]
    async fn group_starts_at_tail() {
        let s = MemoryStream::new();
        s.append(STREAM, [("participantId", "old")]);
        s.ensure_group(STREAM, GROUP).await.unwrap();
        s.append(STREAM, [("participantId", "new")]);

        let got = s
            .read_group(STREAM, GROUP, "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].field("participantId"), Some("new"));
    }

    #[tokio::test]
    async fn ensure_group_is_idempotent() {
        let s = MemoryStream::new();
        s.ensure_group(STREAM, GROUP).await.unwrap();
        s.append(STREAM, [("k", "v")]);
        s.ensure_group(STREAM, GROUP).await.unwrap();

        let got = s
            .read_group(STREAM, GROUP, "c1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.len(), 1, "second ensure must not move the cursor");
    }

    #[tokio::test]
    async fn read_without_group_fails() {
        let s = MemoryStream::new();
        let err = s
            .read_group(STREAM, GROUP, "c1", 1, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NoGroup { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn read_times_out_empty() {
        let s = MemoryStream::new();
        s.ensure_group(STREAM, GROUP).await.unwrap();
        let got = s
            .read_group(STREAM, GROUP, "c1", 1, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let s = Arc::new(MemoryStream::new());
        s.ensure_group(STREAM, GROUP).await.unwrap();

        let reader = {
            let s = Arc::clone(&s);
            tokio::spawn(async move {
                s.read_group(STREAM, GROUP, "c1", 1, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.append(STREAM, [("participantId", "p")]);

        let got = reader.await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn count_limits_batch_and_preserves_order() {
        let s = MemoryStream::new();
        s.ensure_group(STREAM, GROUP).await.unwrap();
        for i in 0..3 {
            s.append(STREAM, [("n", i.to_string())]);
        }
        let first = s.read_group(STREAM, GROUP, "c1", 1, Duration::ZERO).await.unwrap();
        let rest = s.read_group(STREAM, GROUP, "c1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(first[0].field("n"), Some("0"));
        assert_eq!(rest.iter().map(|e| e.field("n").unwrap()).collect::<Vec<_>>(), ["1", "2"]);
        assert_eq!(s.delivered_count(STREAM, GROUP), 3);
    }

    #[tokio::test]
    async fn ack_clears_pending() {
        let s = MemoryStream::new();
        s.ensure_group(STREAM, GROUP).await.unwrap();
        s.append(STREAM, [("k", "v")]);
        let got = s.read_group(STREAM, GROUP, "c1", 1, Duration::ZERO).await.unwrap();
        assert_eq!(s.pending_count(STREAM, GROUP), 1);

        let ids: Vec<String> = got.into_iter().map(|e| e.id).collect();
        assert_eq!(s.ack(STREAM, GROUP, &ids).await.unwrap(), 1);
        assert_eq!(s.ack(STREAM, GROUP, &ids).await.unwrap(), 0);
        assert_eq!(s.pending_count(STREAM, GROUP), 0);
    }
}
