//! Command handling: load an aggregate from its journal, run a command
//! against it, append the resulting events.

use std::marker::PhantomData;
use std::sync::Arc;

use common::{AggregateId, Clock, RetryPolicy, SystemClock, retry};
use event_store::{AppendOptions, EventEnvelope, EventStore, Version};

use crate::aggregate::{Aggregate, DomainEvent};
use crate::error::DomainError;

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after applying the new events.
    pub aggregate: A,

    /// The events that were appended. Empty when the command was a no-op.
    pub events: Vec<A::Event>,

    pub new_version: Version,
}

impl<A: Aggregate> CommandResult<A> {
    /// True when the command changed nothing (already in the target state).
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }
}

/// A request to change one aggregate.
pub trait Command: Send + Sync {
    type Aggregate: Aggregate;

    fn aggregate_id(&self) -> AggregateId;
}

/// Runs commands against aggregates stored in an [`EventStore`].
pub struct CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    store: S,
    clock: Arc<dyn Clock>,
    _phantom: PhantomData<A>,
}

impl<S, A> CommandHandler<S, A>
where
    S: EventStore,
    A: Aggregate,
{
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Journal timestamps are taken from `clock`.
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            _phantom: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rebuilds an aggregate, handing each journal entry and the state right
    /// after it to `inspect`.
    pub async fn replay<F>(&self, aggregate_id: AggregateId, mut inspect: F) -> Result<A, DomainError>
    where
        F: FnMut(&EventEnvelope, &A),
    {
        let envelopes = self.store.get_events_for_aggregate(aggregate_id).await?;

        let mut aggregate = A::default();
        for envelope in &envelopes {
            let event: A::Event = envelope.decode()?;
            aggregate.apply(event);
            aggregate.set_version(envelope.version);
            inspect(envelope, &aggregate);
        }

        Ok(aggregate)
    }

    /// Loads an aggregate. Returns a default instance if it has no events.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<A, DomainError> {
        self.replay(aggregate_id, |_, _| {}).await
    }

    /// Loads an aggregate, returning None if it doesn't exist.
    pub async fn load_existing(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let aggregate = self.load(aggregate_id).await?;
        Ok(aggregate.id().is_some().then_some(aggregate))
    }

    /// Loads the aggregate, runs `command_fn` and appends whatever events it
    /// returns, expecting the journal to still be at the loaded version.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&A) -> Result<Vec<A::Event>, A::Error>,
        DomainError: From<A::Error>,
    {
        let mut aggregate = self.load(aggregate_id).await?;
        let current_version = aggregate.version();

        let events = command_fn(&aggregate)?;

        if events.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                new_version: current_version,
            });
        }

        let envelopes = self.build_envelopes(aggregate_id, current_version, &events)?;

        let options = if current_version == Version::initial() {
            AppendOptions::expect_new()
        } else {
            AppendOptions::expect_version(current_version)
        };

        let new_version = self.store.append(envelopes, options).await?;

        for event in &events {
            aggregate.apply(event.clone());
        }
        aggregate.set_version(new_version);

        Ok(CommandResult {
            aggregate,
            events,
            new_version,
        })
    }

    /// Like [`execute`](Self::execute), but reloads and re-runs the command
    /// when another writer got to the journal first.
    pub async fn execute_with_retry<F>(
        &self,
        aggregate_id: AggregateId,
        policy: &RetryPolicy,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: Fn(&A) -> Result<Vec<A::Event>, A::Error> + Sync,
        DomainError: From<A::Error>,
    {
        let command_fn = &command_fn;
        retry(
            policy,
            || self.execute(aggregate_id, command_fn),
            |err: &DomainError| {
                let conflict = err.is_conflict();
                if conflict {
                    metrics::counter!("aggregate_command_retries_total", "aggregate" => A::aggregate_type())
                        .increment(1);
                    tracing::debug!(%aggregate_id, "journal moved underneath command, reloading");
                }
                conflict
            },
        )
        .await
    }

    fn build_envelopes(
        &self,
        aggregate_id: AggregateId,
        current_version: Version,
        events: &[A::Event],
    ) -> Result<Vec<EventEnvelope>, DomainError> {
        let timestamp = self.clock.now();
        let mut version = current_version;

        events
            .iter()
            .map(|event| {
                version = version.next();
                let envelope = EventEnvelope::builder()
                    .aggregate_id(aggregate_id)
                    .aggregate_type(A::aggregate_type())
                    .event_type(event.event_type())
                    .version(version)
                    .timestamp(timestamp)
                    .payload(event)?
                    .build()?;
                Ok(envelope)
            })
            .collect()
    }
}
