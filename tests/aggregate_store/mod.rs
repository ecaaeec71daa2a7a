use std::sync::Arc;

use advisor_admin::publisher::DomainEventPublisher;
use advisor_admin::store::{Envelope, EventStore, InMemoryEventStore};
use advisor_admin::types::{Metadata, Version, EMPTY_VERSION};
use advisor_admin::{AggregateStore, Error};
use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::aggregate::{
    add, CancellingEventHandler, FailingEventHandler, TestAggregate, TestEvent, TestEventHandler,
};

fn metadata() -> Metadata {
    Metadata::from([("tenant_id".to_string(), "t1".to_string())])
}

fn store_with(publisher: DomainEventPublisher<TestAggregate>) -> (InMemoryEventStore<TestAggregate>, AggregateStore<InMemoryEventStore<TestAggregate>>) {
    let event_store = InMemoryEventStore::new();
    (event_store.clone(), AggregateStore::new(event_store, publisher))
}

#[tokio::test]
async fn update_appends_and_publishes_in_order() {
    let handler = TestEventHandler::default();
    let (event_store, store) = store_with(DomainEventPublisher::new().subscribe_all(handler.clone()));
    let cancellation = CancellationToken::new();

    let aggregate = store
        .update("a", metadata(), &cancellation, |counter| add(counter, &[1, 2, 3]))
        .await
        .unwrap();

    assert_eq!(aggregate.state().count, 6);
    assert_eq!(aggregate.persisted_version(), 2);
    assert!(aggregate.uncommitted_events().is_empty());

    let envelopes = event_store.load("a").await.unwrap();
    assert_eq!(envelopes.iter().map(|e| e.version).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(envelopes.iter().all(|e| e.metadata_value("tenant_id") == Some("t1")));
    assert_eq!(
        handler.seen(),
        vec![("a".to_string(), 0), ("a".to_string(), 1), ("a".to_string(), 2)]
    );
}

#[tokio::test]
async fn handlers_only_receive_subscribed_event_types() {
    let handler = TestEventHandler::default();
    let (_, store) = store_with(DomainEventPublisher::new().subscribe("Reset", handler.clone()));

    store
        .update("a", metadata(), &CancellationToken::new(), |counter| add(counter, &[1]))
        .await
        .unwrap();

    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn no_op_update_touches_nothing() {
    let handler = TestEventHandler::default();
    let (event_store, store) = store_with(DomainEventPublisher::new().subscribe_all(handler.clone()));
    let cancellation = CancellationToken::new();
    store
        .update("a", metadata(), &cancellation, |counter| add(counter, &[5]))
        .await
        .unwrap();

    let aggregate = store
        .update("a", metadata(), &cancellation, |counter| add(counter, &[]))
        .await
        .unwrap();

    assert_eq!(aggregate.persisted_version(), 0);
    assert_eq!(event_store.stream_len("a").await, 1);
    assert_eq!(handler.seen().len(), 1);
}

#[tokio::test]
async fn reloading_replays_to_the_committed_state() {
    let mut rng = rand::thread_rng();
    let (_, store) = store_with(DomainEventPublisher::new());
    let cancellation = CancellationToken::new();
    let batches: Vec<Vec<i64>> = (0..5)
        .map(|_| (0..rng.gen_range(1..4)).map(|_| rng.gen_range(-100..100)).collect())
        .collect();

    let mut committed = None;
    for batch in &batches {
        committed = Some(
            store
                .update("a", metadata(), &cancellation, |counter| add(counter, batch))
                .await
                .unwrap(),
        );
    }
    let committed = committed.unwrap();
    let reloaded = store.load("a").await.unwrap();

    assert_eq!(reloaded.state(), committed.state());
    assert_eq!(reloaded.state().count, batches.iter().flatten().sum::<i64>());
    assert_eq!(reloaded.persisted_version(), batches.iter().map(Vec::len).sum::<usize>() as i64 - 1);
}

#[tokio::test]
async fn mutator_failure_appends_nothing() {
    let (event_store, store) = store_with(DomainEventPublisher::new());

    let result = store
        .update("a", metadata(), &CancellationToken::new(), |counter| {
            add(counter, &[1])?;
            Err(Error::validation("nope"))
        })
        .await;

    assert!(matches!(result, Err(Error::Validation(_))));
    assert_eq!(event_store.stream_len("a").await, 0);
}

/// Holds every load until `parties` loads are in flight, so that concurrent updates all read the
/// same version before any of them appends.
struct GatedLoads {
    inner: InMemoryEventStore<TestAggregate>,
    loaded: tokio::sync::Barrier,
}

#[async_trait]
impl EventStore for GatedLoads {
    type Aggregate = TestAggregate;

    async fn load(&self, aggregate_id: &str) -> Result<Vec<Envelope<TestAggregate>>, Error> {
        let envelopes = self.inner.load(aggregate_id).await?;
        let _ = self.loaded.wait().await;
        Ok(envelopes)
    }

    async fn append(
        &self,
        aggregate_id: &str,
        expected_version: Version,
        events: Vec<TestEvent>,
        metadata: &Metadata,
    ) -> Result<Vec<Envelope<TestAggregate>>, Error> {
        self.inner.append(aggregate_id, expected_version, events, metadata).await
    }

    async fn aggregate_ids(&self) -> Result<Vec<String>, Error> {
        self.inner.aggregate_ids().await
    }
}

#[tokio::test]
async fn concurrent_updates_from_the_same_version_conflict() {
    let event_store: InMemoryEventStore<TestAggregate> = InMemoryEventStore::new();
    event_store
        .append(
            "a",
            EMPTY_VERSION,
            vec![TestEvent::Added {
                aggregate_id: "a".to_string(),
                add: 1,
            }],
            &metadata(),
        )
        .await
        .unwrap();
    let gated = AggregateStore::new(
        GatedLoads {
            inner: event_store.clone(),
            loaded: tokio::sync::Barrier::new(2),
        },
        DomainEventPublisher::new(),
    );
    let cancellation = CancellationToken::new();

    let (first, second) = tokio::join!(
        gated.update("a", metadata(), &cancellation, |counter| add(counter, &[10])),
        gated.update("a", metadata(), &cancellation, |counter| add(counter, &[10])),
    );
    let results = vec![first, second];

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    let conflict = results.into_iter().find_map(Result::err).unwrap();
    assert!(conflict.is_retryable());
    assert!(matches!(
        conflict,
        Error::ConcurrencyConflict {
            expected: 0,
            actual: 1,
            ..
        }
    ));

    let store = AggregateStore::new(event_store.clone(), DomainEventPublisher::new());
    let retried = store
        .update("a", metadata(), &cancellation, |counter| add(counter, &[10]))
        .await
        .unwrap();

    assert_eq!(retried.persisted_version(), 2);
    assert_eq!(retried.state().count, 21);
    assert_eq!(event_store.stream_len("a").await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_updates_never_lose_an_event() {
    let (event_store, store) = store_with(DomainEventPublisher::new());
    let store = Arc::new(store);

    let updates = (0..8).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            loop {
                match store
                    .update("a", metadata(), &CancellationToken::new(), |counter| add(counter, &[1]))
                    .await
                {
                    Err(error) if error.is_retryable() => continue,
                    other => break other,
                }
            }
        })
    });
    for joined in futures::future::join_all(updates).await {
        joined.unwrap().unwrap();
    }

    let reloaded = store.load("a").await.unwrap();
    assert_eq!(reloaded.state().count, 8);
    assert_eq!(event_store.stream_len("a").await, 8);
}

#[tokio::test]
async fn failing_handler_does_not_roll_back_the_append() {
    let after = TestEventHandler::default();
    let (event_store, store) = store_with(
        DomainEventPublisher::new()
            .subscribe_all(FailingEventHandler)
            .subscribe_all(after.clone()),
    );

    let result = store
        .update("a", metadata(), &CancellationToken::new(), |counter| add(counter, &[1, 1]))
        .await;

    let error = result.unwrap_err();
    assert!(error.is_committed());
    assert!(matches!(
        error,
        Error::Publish {
            version: 0,
            handler: "FailingEventHandler",
            ..
        }
    ));
    assert_eq!(event_store.stream_len("a").await, 2);
    assert!(after.seen().is_empty());

    let reloaded = store.load("a").await.unwrap();
    assert_eq!(reloaded.state().count, 2);
}

#[tokio::test]
async fn cancellation_before_append_has_no_effect() {
    let handler = TestEventHandler::default();
    let (event_store, store) = store_with(DomainEventPublisher::new().subscribe_all(handler.clone()));
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let result = store
        .update("a", metadata(), &cancellation, |counter| add(counter, &[1]))
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(event_store.stream_len("a").await, 0);
    assert!(handler.seen().is_empty());
}

#[tokio::test]
async fn cancellation_while_publishing_keeps_the_append() {
    let cancellation = CancellationToken::new();
    let (event_store, store) = store_with(DomainEventPublisher::new().subscribe_all(CancellingEventHandler {
        cancellation: cancellation.clone(),
    }));

    let result = store
        .update("a", metadata(), &cancellation, |counter| add(counter, &[1]))
        .await;

    let error = result.unwrap_err();
    assert!(error.is_committed());
    assert!(matches!(
        error,
        Error::PublishCancelled {
            committed_version: 0,
            ..
        }
    ));
    assert_eq!(event_store.stream_len("a").await, 1);
}

#[tokio::test]
async fn foreign_events_are_rejected_at_append() {
    let event_store: InMemoryEventStore<TestAggregate> = InMemoryEventStore::new();

    let result = event_store
        .append(
            "a",
            EMPTY_VERSION,
            vec![TestEvent::Reset {
                aggregate_id: "b".to_string(),
            }],
            &metadata(),
        )
        .await;

    assert!(matches!(result, Err(Error::IdentityMismatch { .. })));
    assert_eq!(event_store.stream_len("a").await, 0);
}
