use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::storage::EventStore;
use crate::stream::{EventStream, StreamId};
use crate::Result;

/// One row copied into a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarehouseRow {
    pub name: String,
    pub creation_ms: i64,
    pub payload: String,
}

impl WarehouseRow {
    pub fn approximate_size(&self) -> u64 {
        (self.name.len() + self.payload.len() + std::mem::size_of::<i64>()) as u64
    }
}

/// Somewhere rows can be read from in id order, resuming after a checkpoint.
#[async_trait]
pub trait SyncSource: Send + Sync {
    /// Up to `limit` rows strictly after `checkpoint`, oldest first.
    async fn fetch_after(&self, checkpoint: Option<&str>, limit: usize) -> Result<Vec<WarehouseRow>>;
}

fn parse_checkpoint(checkpoint: Option<&str>) -> Result<Option<StreamId>> {
    checkpoint.map(str::parse).transpose()
}

pub struct StreamSource {
    stream: Arc<EventStream>,
}

impl StreamSource {
    pub fn new(stream: Arc<EventStream>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl SyncSource for StreamSource {
    async fn fetch_after(&self, checkpoint: Option<&str>, limit: usize) -> Result<Vec<WarehouseRow>> {
        let after = parse_checkpoint(checkpoint)?;
        self.stream
            .range_after(after, limit)
            .into_iter()
            .map(|entry| {
                Ok(WarehouseRow {
                    name: entry.id.to_string(),
                    creation_ms: entry.id.ms as i64,
                    payload: serde_json::to_string(&entry.fields)?,
                })
            })
            .collect()
    }
}

pub struct EventStoreSource {
    store: EventStore,
}

impl EventStoreSource {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SyncSource for EventStoreSource {
    async fn fetch_after(&self, checkpoint: Option<&str>, limit: usize) -> Result<Vec<WarehouseRow>> {
        let after = parse_checkpoint(checkpoint)?;
        self.store
            .events_after(after, limit)
            .await?
            .into_iter()
            .map(|event| {
                Ok(WarehouseRow {
                    name: event.id.to_string(),
                    creation_ms: event.id.ms as i64,
                    payload: serde_json::to_string(&event)?,
                })
            })
            .collect()
    }
}
