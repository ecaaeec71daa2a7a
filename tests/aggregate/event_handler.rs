use std::sync::{Arc, Mutex};

use advisor_admin::handler::{EventHandler, ReplayableEventHandler};
use advisor_admin::store::Envelope;
use advisor_admin::types::Version;
use advisor_admin::Error;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::aggregate::TestAggregate;

/// Records the `(aggregate_id, version)` of every envelope it sees.
#[derive(Clone, Default)]
pub struct TestEventHandler {
    pub seen: Arc<Mutex<Vec<(String, Version)>>>,
}

impl TestEventHandler {
    pub fn seen(&self) -> Vec<(String, Version)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler<TestAggregate> for TestEventHandler {
    async fn handle(&self, envelope: &Envelope<TestAggregate>) -> Result<(), Error> {
        self.seen
            .lock()
            .unwrap()
            .push((envelope.aggregate_id.clone(), envelope.version));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TestEventHandler"
    }
}

impl ReplayableEventHandler<TestAggregate> for TestEventHandler {}

pub struct FailingEventHandler;

#[async_trait]
impl EventHandler<TestAggregate> for FailingEventHandler {
    async fn handle(&self, _envelope: &Envelope<TestAggregate>) -> Result<(), Error> {
        Err(Error::validation("read side unavailable"))
    }

    fn name(&self) -> &'static str {
        "FailingEventHandler"
    }
}

/// Cancels the token of the running update and never completes.
pub struct CancellingEventHandler {
    pub cancellation: CancellationToken,
}

#[async_trait]
impl EventHandler<TestAggregate> for CancellingEventHandler {
    async fn handle(&self, _envelope: &Envelope<TestAggregate>) -> Result<(), Error> {
        self.cancellation.cancel();
        std::future::pending::<()>().await;
        Ok(())
    }
}
