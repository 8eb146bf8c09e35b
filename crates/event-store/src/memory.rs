use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    AggregateId, EventEnvelope, EventStoreError, Result, Version,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

#[derive(Default)]
struct Journal {
    /// Events per aggregate, in version order.
    streams: HashMap<AggregateId, Vec<EventEnvelope>>,
    appended: usize,
}

/// In-memory journal used by tests and by the server when no database is
/// configured.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    journal: Arc<RwLock<Journal>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.journal.read().await.appended
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions) -> Result<Version> {
        validate_events_for_append(&events)?;

        let aggregate_id = events[0].aggregate_id;
        let first_new_version = events[0].version;

        let mut journal = self.journal.write().await;
        let current_version = journal
            .streams
            .get(&aggregate_id)
            .and_then(|stream| stream.last())
            .map(|e| e.version)
            .unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            tracing::warn!(%aggregate_id, %expected, actual = %current_version, "stale journal append");
            metrics::counter!("journal_conflicts_total").increment(1);
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected,
                actual: current_version,
            });
        }

        // Mirrors the unique (aggregate_id, version) constraint of the SQL schema.
        if first_new_version != current_version.next() {
            return Err(EventStoreError::ConcurrencyConflict {
                aggregate_id,
                expected: options.expected_version.unwrap_or(current_version),
                actual: current_version,
            });
        }

        let last_version = events
            .last()
            .map(|e| e.version)
            .unwrap_or(current_version);

        journal.appended += events.len();
        journal
            .streams
            .entry(aggregate_id)
            .or_default()
            .extend(events);

        Ok(last_version)
    }

    async fn get_events_for_aggregate(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<EventEnvelope>> {
        let journal = self.journal.read().await;
        Ok(journal
            .streams
            .get(&aggregate_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventStoreExt;

    fn envelope(aggregate_id: AggregateId, version: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .event_type(event_type)
            .version(Version::new(version))
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        let version = store
            .append(
                vec![envelope(id, 1, "OrderPlaced"), envelope(id, 2, "StockReserved")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        assert_eq!(version, Version::new(2));
        let events = store.get_events_for_aggregate(id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, "StockReserved");
        assert_eq!(store.event_count().await, 2);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append_event(envelope(id, 1, "OrderPlaced"), AppendOptions::expect_new())
            .await
            .unwrap();

        let err = store
            .append_event(envelope(id, 1, "OrderPlaced"), AppendOptions::expect_new())
            .await
            .unwrap_err();

        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn unchecked_append_still_rejects_duplicate_version() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();
        store
            .append_event(envelope(id, 1, "OrderPlaced"), AppendOptions::new())
            .await
            .unwrap();

        let result = store
            .append_event(envelope(id, 1, "OrderPlaced"), AppendOptions::new())
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn streams_are_kept_per_order() {
        let store = InMemoryEventStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        store
            .append_event(envelope(a, 1, "OrderPlaced"), AppendOptions::expect_new())
            .await
            .unwrap();
        store
            .append_event(envelope(b, 1, "OrderPlaced"), AppendOptions::expect_new())
            .await
            .unwrap();
        store
            .append_event(envelope(a, 2, "OrderCancelled"), AppendOptions::expect_version(Version::first()))
            .await
            .unwrap();

        let stream_a = store.get_events_for_aggregate(a).await.unwrap();
        let types: Vec<_> = stream_a.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, ["OrderPlaced", "OrderCancelled"]);
        assert_eq!(store.get_events_for_aggregate(b).await.unwrap().len(), 1);
        assert!(
            store
                .get_events_for_aggregate(AggregateId::new())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
