//! In-process append-only event stream with consumer groups.
//!
//! Entries are addressed by a [`StreamId`] made of the append time in
//! milliseconds and a sequence number, so ids always grow. A consumer group
//! tracks the last delivered id plus a pending list of entries that were
//! handed to a consumer but not yet acknowledged.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::str::FromStr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::utils::now_ms;
use crate::{PulseError, Result};

pub type Fields = BTreeMap<String, String>;

const ID_OVERHEAD_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId { ms: u64::MAX, seq: u64::MAX };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Next id after `last` for an append happening at `now_ms`.
    fn next(last: StreamId, now_ms: u64) -> StreamId {
        if now_ms > last.ms {
            StreamId::new(now_ms, 0)
        } else {
            StreamId::new(last.ms, last.seq + 1)
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PulseError::Validation(format!("Invalid stream ID '{}'", s));
        match s.trim() {
            "-" => Ok(StreamId::MIN),
            "+" => Ok(StreamId::MAX),
            raw => match raw.split_once('-') {
                Some((ms, seq)) => Ok(StreamId::new(
                    ms.parse().map_err(|_| invalid())?,
                    seq.parse().map_err(|_| invalid())?,
                )),
                None => Ok(StreamId::new(raw.parse().map_err(|_| invalid())?, 0)),
            },
        }
    }
}

impl Serialize for StreamId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamEntry {
    pub id: StreamId,
    #[serde(rename = "data")]
    pub fields: Fields,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver every entry already in the stream.
    Beginning,
    /// Deliver only entries appended after the group is created.
    Latest,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: usize,
    pub pending: usize,
    pub last_delivered_id: StreamId,
    pub lag: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub name: String,
    pub group: String,
    pub pending: usize,
    /// Seconds since the consumer last read from the group.
    pub idle: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub length: usize,
    pub max_length: usize,
    pub last_generated_id: StreamId,
    pub first_entry_id: Option<StreamId>,
    pub last_entry_id: Option<StreamId>,
    pub groups: usize,
    pub memory_usage: usize,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug)]
struct ConsumerGroup {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
    consumers: HashMap<String, Instant>,
}

impl ConsumerGroup {
    fn new(last_delivered: StreamId) -> Self {
        Self {
            last_delivered,
            pending: BTreeMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn touch(&mut self, consumer: &str) {
        self.consumers.insert(consumer.to_string(), Instant::now());
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    groups: HashMap<String, ConsumerGroup>,
    bytes: usize,
}

impl Inner {
    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut ConsumerGroup> {
        self.groups.get_mut(group).ok_or_else(|| no_group(stream, group))
    }

    fn group(&self, stream: &str, group: &str) -> Result<&ConsumerGroup> {
        self.groups.get(group).ok_or_else(|| no_group(stream, group))
    }

    fn remove_entry(&mut self, id: &StreamId) -> bool {
        match self.entries.remove(id) {
            Some(fields) => {
                self.bytes = self.bytes.saturating_sub(entry_size(&fields));
                for group in self.groups.values_mut() {
                    group.pending.remove(id);
                }
                true
            }
            None => false,
        }
    }

    fn entry(&self, id: &StreamId) -> Option<StreamEntry> {
        self.entries.get(id).map(|fields| StreamEntry {
            id: *id,
            fields: fields.clone(),
        })
    }
}

fn no_group(stream: &str, group: &str) -> PulseError {
    PulseError::Stream(format!(
        "NOGROUP No such consumer group '{}' for stream '{}'",
        group, stream
    ))
}

fn entry_size(fields: &Fields) -> usize {
    ID_OVERHEAD_BYTES + fields.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
}

#[derive(Debug)]
pub struct EventStream {
    name: String,
    max_len: usize,
    inner: Mutex<Inner>,
}

impl EventStream {
    pub fn new(name: impl Into<String>, max_len: usize) -> Self {
        Self {
            name: name.into(),
            max_len: max_len.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn add(&self, fields: Fields) -> StreamId {
        self.add_at(fields, now_ms())
    }

    /// Appends with an explicit wall-clock time. Ids still never go backwards.
    pub fn add_at(&self, fields: Fields, at_ms: u64) -> StreamId {
        let mut inner = self.inner.lock();
        let id = StreamId::next(inner.last_id, at_ms);
        inner.last_id = id;
        inner.bytes += entry_size(&fields);
        inner.entries.insert(id, fields);

        let mut trimmed = 0usize;
        while inner.entries.len() > self.max_len {
            let Some(oldest) = inner.entries.keys().next().copied() else {
                break;
            };
            inner.remove_entry(&oldest);
            trimmed += 1;
        }
        if trimmed > 0 {
            debug!(stream = %self.name, trimmed, "Trimmed stream to max length");
        }

        id
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate bytes held by ids and field data.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn info(&self) -> StreamInfo {
        let inner = self.inner.lock();
        StreamInfo {
            name: self.name.clone(),
            length: inner.entries.len(),
            max_length: self.max_len,
            last_generated_id: inner.last_id,
            first_entry_id: inner.entries.keys().next().copied(),
            last_entry_id: inner.entries.keys().next_back().copied(),
            groups: inner.groups.len(),
            memory_usage: inner.bytes,
        }
    }

    pub fn get(&self, id: &StreamId) -> Option<StreamEntry> {
        self.inner.lock().entry(id)
    }

    pub fn delete(&self, id: &StreamId) -> bool {
        self.inner.lock().remove_entry(id)
    }

    /// Entries with `min <= id <= max`, oldest first.
    pub fn range(&self, min: StreamId, max: StreamId, count: Option<usize>) -> Vec<StreamEntry> {
        if min > max {
            return Vec::new();
        }
        let inner = self.inner.lock();
        inner
            .entries
            .range((Included(min), Included(max)))
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry { id: *id, fields: fields.clone() })
            .collect()
    }

    /// Entries with `min <= id <= max`, newest first.
    pub fn rev_range(&self, max: StreamId, min: StreamId, count: Option<usize>) -> Vec<StreamEntry> {
        if min > max {
            return Vec::new();
        }
        let inner = self.inner.lock();
        inner
            .entries
            .range((Included(min), Included(max)))
            .rev()
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamEntry { id: *id, fields: fields.clone() })
            .collect()
    }

    /// Entries strictly after `after` (from the start when `None`), oldest first.
    pub fn range_after(&self, after: Option<StreamId>, count: usize) -> Vec<StreamEntry> {
        let inner = self.inner.lock();
        let lower = match after {
            Some(id) => Excluded(id),
            None => Unbounded,
        };
        inner
            .entries
            .range((lower, Unbounded))
            .take(count)
            .map(|(id, fields)| StreamEntry { id: *id, fields: fields.clone() })
            .collect()
    }

    /// Number of entries appended within the trailing `window`.
    pub fn entries_since(&self, window: Duration) -> usize {
        let start = now_ms().saturating_sub(window.as_millis() as u64);
        let inner = self.inner.lock();
        inner
            .entries
            .range((Included(StreamId::new(start, 0)), Unbounded))
            .count()
    }

    /// Creates the group unless it exists. Returns whether it was created.
    pub fn create_group(&self, group: &str, start: GroupStart) -> bool {
        let mut inner = self.inner.lock();
        if inner.groups.contains_key(group) {
            return false;
        }
        let last_delivered = match start {
            GroupStart::Beginning => StreamId::MIN,
            GroupStart::Latest => inner.last_id,
        };
        inner
            .groups
            .insert(group.to_string(), ConsumerGroup::new(last_delivered));
        true
    }

    /// Re-delivers entries this consumer holds but has not acknowledged.
    pub fn read_pending(&self, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let cg = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(&self.name, group))?;
        cg.touch(consumer);

        let now = Instant::now();
        let mut out = Vec::new();
        for (id, pending) in cg.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if pending.consumer != consumer {
                continue;
            }
            if let Some(fields) = inner.entries.get(id) {
                pending.delivered_at = now;
                pending.delivery_count += 1;
                out.push(StreamEntry { id: *id, fields: fields.clone() });
            }
        }
        Ok(out)
    }

    /// Delivers entries the group has never seen and marks them pending.
    pub fn read_new(&self, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let cg = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(&self.name, group))?;
        cg.touch(consumer);

        let now = Instant::now();
        let out: Vec<StreamEntry> = inner
            .entries
            .range((Excluded(cg.last_delivered), Unbounded))
            .take(count)
            .map(|(id, fields)| StreamEntry { id: *id, fields: fields.clone() })
            .collect();

        for entry in &out {
            cg.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
        }
        if let Some(last) = out.last() {
            cg.last_delivered = last.id;
        }
        Ok(out)
    }

    /// Takes over entries other consumers left pending for at least `min_idle`.
    pub fn autoclaim(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let cg = inner
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(&self.name, group))?;
        cg.touch(consumer);

        let now = Instant::now();
        let mut out = Vec::new();
        for (id, pending) in cg.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if pending.consumer == consumer || now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            if let Some(fields) = inner.entries.get(id) {
                debug!(
                    stream = %self.name,
                    id = %id,
                    from = %pending.consumer,
                    to = consumer,
                    "Claimed stale pending entry"
                );
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.delivery_count += 1;
                out.push(StreamEntry { id: *id, fields: fields.clone() });
            }
        }
        Ok(out)
    }

    /// Pending entries first, then stale ones from other consumers, then new ones.
    pub fn read(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        min_idle: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let mut entries = self.read_pending(group, consumer, count)?;
        if entries.len() < count {
            entries.extend(self.autoclaim(group, consumer, min_idle, count - entries.len())?);
        }
        if entries.len() < count {
            entries.extend(self.read_new(group, consumer, count - entries.len())?);
        }
        Ok(entries)
    }

    /// Acknowledges entries. Returns how many were actually pending.
    pub fn ack(&self, group: &str, ids: &[StreamId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let cg = inner.group_mut(&self.name, group)?;
        let acked = ids.iter().filter(|id| cg.pending.remove(id).is_some()).count();
        if acked < ids.len() {
            warn!(
                stream = %self.name,
                group,
                requested = ids.len(),
                acked,
                "Some acknowledged ids were not pending"
            );
        }
        Ok(acked)
    }

    /// Delivered but unacknowledged entries.
    pub fn pending_len(&self, group: &str) -> Result<usize> {
        let inner = self.inner.lock();
        Ok(inner.group(&self.name, group)?.pending.len())
    }

    /// Entries not yet delivered to the group.
    pub fn lag(&self, group: &str) -> Result<usize> {
        let inner = self.inner.lock();
        let cg = inner.group(&self.name, group)?;
        Ok(inner
            .entries
            .range((Excluded(cg.last_delivered), Unbounded))
            .count())
    }

    /// Everything the group still has to acknowledge: lag plus pending.
    pub fn unacknowledged_len(&self, group: &str) -> Result<usize> {
        Ok(self.lag(group)? + self.pending_len(group)?)
    }

    pub fn delivery_count(&self, group: &str, id: &StreamId) -> Result<Option<u64>> {
        let inner = self.inner.lock();
        Ok(inner
            .group(&self.name, group)?
            .pending
            .get(id)
            .map(|p| p.delivery_count))
    }

    pub fn groups(&self) -> Vec<GroupInfo> {
        let inner = self.inner.lock();
        let mut groups: Vec<GroupInfo> = inner
            .groups
            .iter()
            .map(|(name, cg)| GroupInfo {
                name: name.clone(),
                consumers: cg.consumers.len(),
                pending: cg.pending.len(),
                last_delivered_id: cg.last_delivered,
                lag: inner
                    .entries
                    .range((Excluded(cg.last_delivered), Unbounded))
                    .count(),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    pub fn consumers(&self, group: &str) -> Result<Vec<ConsumerInfo>> {
        let inner = self.inner.lock();
        let cg = inner.group(&self.name, group)?;
        let now = Instant::now();

        let mut consumers: Vec<ConsumerInfo> = cg
            .consumers
            .iter()
            .map(|(name, seen)| ConsumerInfo {
                name: name.clone(),
                group: group.to_string(),
                pending: cg.pending.values().filter(|p| &p.consumer == name).count(),
                idle: now.duration_since(*seen).as_secs_f64(),
            })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(consumers)
    }
}
