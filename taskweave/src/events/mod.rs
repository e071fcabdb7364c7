//! Event source: validated append with publish-after-persist, plus range
//! queries for replay.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{event_subject, BusError, MessageBus};
use crate::entities::{Event, RawEvent};
use crate::store::{Store, StoreError};

/// Queries may ask for at most this many events.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Appended events must carry a `created_at` within this window of now.
const CREATED_AT_SKEW_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("version must be positive")]
    InvalidVersion,
    #[error("created_at is outside the accepted window")]
    CreatedAtOutOfRange,
    #[error("invalid time range: from is after to")]
    InvalidTimeRange,
    #[error("limit must be between 1 and {MAX_QUERY_LIMIT}")]
    LimitOutOfBounds,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

pub struct EventSource {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
}

impl EventSource {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn MessageBus>) -> Self {
        Self { store, bus }
    }

    /// Validates, persists, then publishes on `events.<event_type>`. The
    /// publish happens after the store accepted the event; a publish failure
    /// propagates but the event stays persisted.
    pub async fn append_event(&self, mut event: Event) -> Result<Event, EventError> {
        if event.event_type.is_empty() {
            return Err(EventError::MissingField("event_type"));
        }
        if event.aggregate_id.is_empty() {
            return Err(EventError::MissingField("aggregate_id"));
        }
        if event.aggregate_type.is_empty() {
            return Err(EventError::MissingField("aggregate_type"));
        }
        if event.version == 0 {
            return Err(EventError::InvalidVersion);
        }
        let skew = Duration::minutes(CREATED_AT_SKEW_MINUTES);
        let now = Utc::now();
        if event.created_at < now - skew || event.created_at > now + skew {
            return Err(EventError::CreatedAtOutOfRange);
        }
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }

        let stored = self.store.append_event(event).await?;
        let payload = serde_json::to_vec(&stored)
            .map_err(|e| EventError::Store(StoreError::Internal(e.to_string())))?;
        self.bus
            .publish(&event_subject(&stored.event_type), &payload)
            .await?;
        debug!(event_type = %stored.event_type, nid = stored.nid, "event appended and published");
        Ok(stored)
    }

    fn check_range(
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<(), EventError> {
        if from > to {
            return Err(EventError::InvalidTimeRange);
        }
        if limit == 0 || limit > MAX_QUERY_LIMIT {
            return Err(EventError::LimitOutOfBounds);
        }
        Ok(())
    }

    pub async fn events_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, EventError> {
        Self::check_range(from, to, limit)?;
        Ok(self
            .store
            .events_by_aggregate(aggregate_type, aggregate_id, from, to, limit)
            .await?)
    }

    pub async fn events_by_type(
        &self,
        event_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, EventError> {
        Self::check_range(from, to, limit)?;
        Ok(self.store.events_by_type(event_type, from, to, limit).await?)
    }

    /// Lighter ingestion path for webhook payloads: no typing, no publish.
    pub async fn append_raw_event(&self, event: RawEvent) -> Result<RawEvent, EventError> {
        Ok(self.store.append_raw_event(event).await?)
    }

    /// Fetches one raw event by nid. The `(from, to)` range is required: nid
    /// alone is not assumed unique across partitions.
    pub async fn raw_event(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        nid: u64,
    ) -> Result<RawEvent, EventError> {
        if from > to {
            return Err(EventError::InvalidTimeRange);
        }
        Ok(self.store.get_raw_event(from, to, nid).await?)
    }

    pub async fn events_by_source(
        &self,
        event_source: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, EventError> {
        Self::check_range(from, to, limit)?;
        Ok(self
            .store
            .events_by_source(event_source, from, to, limit)
            .await?)
    }
}
