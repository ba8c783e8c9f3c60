//! In-process append-only stream broker.
//!
//! Mirrors the Redis Streams contract the ingestion layer was built around:
//! entries get strictly increasing `ms-seq` ids, consumer groups track the
//! last delivered id plus a pending entries list (PEL) per group, and an
//! entry stays pending until a consumer acknowledges it. Pending entries
//! whose consumer went quiet can be claimed by another consumer.
//!
//! RULE: the broker lock is never held across an `.await`.

use crate::error::{PipelineError, PipelineResult};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Field/value pairs of one stream entry.
pub type Fields = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `last` at wall-clock `now_ms`.
    fn next_after(last: StreamId, now_ms: u64) -> Self {
        if now_ms > last.ms {
            Self::new(now_ms, 0)
        } else {
            Self::new(last.ms, last.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::InvalidStreamId { raw: s.to_string() };
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// Where a new consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartId {
    /// `"0"`: deliver the whole backlog.
    Beginning,
    /// `"$"`: deliver only entries added after creation.
    Latest,
    At(StreamId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Fields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingSummary {
    pub count: usize,
    pub smallest: Option<StreamId>,
    pub largest: Option<StreamId>,
    /// Pending count per consumer name.
    pub per_consumer: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDetail {
    pub id: StreamId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub length: usize,
    pub first_id: Option<StreamId>,
    pub last_id: Option<StreamId>,
    pub last_generated_id: StreamId,
    pub groups: usize,
    pub entries_added: u64,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug)]
struct ConsumerGroup {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    entries_added: u64,
    groups: HashMap<String, ConsumerGroup>,
}

impl Stream {
    fn group_mut(&mut self, stream: &str, group: &str) -> PipelineResult<&mut ConsumerGroup> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| PipelineError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })
    }
}

struct BrokerInner {
    streams: Mutex<HashMap<String, Stream>>,
    notify: Notify,
}

/// Shared handle to the broker. Clones point at the same streams.
#[derive(Clone)]
pub struct StreamBroker {
    inner: Arc<BrokerInner>,
}

impl Default for StreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                streams: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        // A panic while holding the lock leaves the maps structurally valid.
        self.inner
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn no_such_stream(stream: &str) -> PipelineError {
        PipelineError::NoSuchStream {
            stream: stream.to_string(),
        }
    }

    /// Append an entry, creating the stream if needed. Wakes blocked readers.
    pub fn xadd(&self, stream: &str, fields: Fields) -> StreamId {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let id = {
            let mut streams = self.streams();
            let s = streams.entry(stream.to_string()).or_default();
            let id = StreamId::next_after(s.last_id, now_ms);
            s.entries.insert(id, fields);
            s.last_id = id;
            s.entries_added += 1;
            id
        };
        self.inner.notify.notify_waiters();
        id
    }

    pub fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start: StartId,
        mkstream: bool,
    ) -> PipelineResult<()> {
        let mut streams = self.streams();
        if !streams.contains_key(stream) {
            if !mkstream {
                return Err(Self::no_such_stream(stream));
            }
            streams.insert(stream.to_string(), Stream::default());
        }
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_such_stream(stream))?;
        if s.groups.contains_key(group) {
            return Err(PipelineError::BusyGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        let last_delivered = match start {
            StartId::Beginning => StreamId::ZERO,
            StartId::Latest => s.last_id,
            StartId::At(id) => id,
        };
        s.groups.insert(
            group.to_string(),
            ConsumerGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        log::debug!("Created consumer group {group} on {stream} at {last_delivered}");
        Ok(())
    }

    /// Deliver up to `count` never-delivered entries (`">"`) to `consumer`
    /// without waiting. `count == 0` means no limit.
    pub fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> PipelineResult<Vec<StreamEntry>> {
        let mut streams = self.streams();
        let s = streams.get_mut(stream).ok_or_else(|| PipelineError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        })?;
        let limit = if count == 0 { usize::MAX } else { count };

        let start = s.group_mut(stream, group)?.last_delivered;
        let batch: Vec<StreamEntry> = s
            .entries
            .range((Bound::Excluded(start), Bound::Unbounded))
            .take(limit)
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect();

        let g = s.group_mut(stream, group)?;
        let now = Instant::now();
        for entry in &batch {
            g.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            g.last_delivered = entry.id;
        }
        Ok(batch)
    }

    /// `XREADGROUP ... BLOCK`: wait up to `block` for new entries.
    /// Returns an empty vec on timeout. `None` polls once; as with Redis
    /// `BLOCK 0`, a zero duration waits until an entry arrives.
    pub async fn xreadgroup(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Option<Duration>,
    ) -> PipelineResult<Vec<StreamEntry>> {
        // None: poll. Some(None): wait forever. Some(Some(t)): wait until t.
        let deadline = block.map(|b| (!b.is_zero()).then(|| Instant::now() + b));
        loop {
            // Register interest before checking so an xadd between the
            // check and the await is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.read_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            match deadline {
                None => return Ok(batch),
                Some(None) => notified.await,
                Some(Some(deadline)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }

    /// Acknowledge entries; returns how many were actually pending.
    pub fn xack(&self, stream: &str, group: &str, ids: &[StreamId]) -> PipelineResult<usize> {
        let mut streams = self.streams();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_such_stream(stream))?;
        let g = s.group_mut(stream, group)?;
        Ok(ids.iter().filter(|id| g.pending.remove(id).is_some()).count())
    }

    pub fn xpending(&self, stream: &str, group: &str) -> PipelineResult<PendingSummary> {
        let mut streams = self.streams();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_such_stream(stream))?;
        let g = s.group_mut(stream, group)?;

        let mut summary = PendingSummary {
            count: g.pending.len(),
            smallest: g.pending.keys().next().copied(),
            largest: g.pending.keys().next_back().copied(),
            per_consumer: BTreeMap::new(),
        };
        for p in g.pending.values() {
            *summary.per_consumer.entry(p.consumer.clone()).or_insert(0) += 1;
        }
        Ok(summary)
    }

    /// Per-entry pending detail in id order.
    pub fn xpending_detail(&self, stream: &str, group: &str) -> PipelineResult<Vec<PendingDetail>> {
        let mut streams = self.streams();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_such_stream(stream))?;
        let g = s.group_mut(stream, group)?;
        let now = Instant::now();
        Ok(g.pending
            .iter()
            .map(|(id, p)| PendingDetail {
                id: *id,
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    /// Transfer entries pending for at least `min_idle` to `consumer`.
    /// Entries trimmed from the stream are dropped from the PEL instead.
    pub fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> PipelineResult<Vec<StreamEntry>> {
        let mut streams = self.streams();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_such_stream(stream))?;
        let limit = if count == 0 { usize::MAX } else { count };
        let now = Instant::now();

        let stale: Vec<StreamId> = s
            .group_mut(stream, group)?
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(limit)
            .collect();

        let mut claimed = Vec::with_capacity(stale.len());
        for id in stale {
            let fields = s.entries.get(&id).cloned();
            let g = s.group_mut(stream, group)?;
            match fields {
                Some(fields) => {
                    if let Some(p) = g.pending.get_mut(&id) {
                        p.consumer = consumer.to_string();
                        p.delivered_at = now;
                        p.delivery_count += 1;
                    }
                    claimed.push(StreamEntry { id, fields });
                }
                None => {
                    g.pending.remove(&id);
                }
            }
        }
        Ok(claimed)
    }

    pub fn xlen(&self, stream: &str) -> usize {
        self.streams().get(stream).map_or(0, |s| s.entries.len())
    }

    pub fn xinfo(&self, stream: &str) -> PipelineResult<StreamInfo> {
        let streams = self.streams();
        let s = streams.get(stream).ok_or_else(|| Self::no_such_stream(stream))?;
        Ok(StreamInfo {
            length: s.entries.len(),
            first_id: s.entries.keys().next().copied(),
            last_id: s.entries.keys().next_back().copied(),
            last_generated_id: s.last_id,
            groups: s.groups.len(),
            entries_added: s.entries_added,
        })
    }

    /// All entries in id order.
    pub fn xrange(&self, stream: &str) -> Vec<StreamEntry> {
        self.streams()
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamEntry {
                        id: *id,
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop the oldest entries so at most `max_len` remain.
    pub fn xtrim_maxlen(&self, stream: &str, max_len: usize) -> usize {
        let mut streams = self.streams();
        let Some(s) = streams.get_mut(stream) else {
            return 0;
        };
        let mut removed = 0;
        while s.entries.len() > max_len {
            if s.entries.pop_first().is_none() {
                break;
            }
            removed += 1;
        }
        removed
    }

    /// True when the group has entries it has not yet been handed.
    pub fn has_undelivered(&self, stream: &str, group: &str) -> PipelineResult<bool> {
        let mut streams = self.streams();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(false);
        };
        let last = s.group_mut(stream, group)?.last_delivered;
        Ok(s
            .entries
            .range((Bound::Excluded(last), Bound::Unbounded))
            .next()
            .is_some())
    }
}
