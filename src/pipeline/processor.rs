//! Batch processor. Judge a released batch, then dispatch the verdicts.

use async_trait::async_trait;
use tracing::{Instrument, info_span};

use crate::pipeline::accumulator::BatchHandler;
use crate::pipeline::dispatcher::Dispatcher;
use crate::pipeline::judge::JudgeClient;
use crate::pipeline::types::Batch;

pub struct BatchProcessor {
    judge: JudgeClient,
    dispatcher: Dispatcher,
}

impl BatchProcessor {
    pub fn new(judge: JudgeClient, dispatcher: Dispatcher) -> Self {
        Self { judge, dispatcher }
    }
}

#[async_trait]
impl BatchHandler for BatchProcessor {
    async fn handle(&self, batch: Batch) {
        let span = info_span!("batch", batch_id = %batch.id, size = batch.len());
        async {
            let violations = self.judge.analyze(&batch).await;
            if violations.is_empty() {
                tracing::debug!("No violations in batch");
                return;
            }
            self.dispatcher.apply(violations, &batch).await;
        }
        .instrument(span)
        .await
    }
}
