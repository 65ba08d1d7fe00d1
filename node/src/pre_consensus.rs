//! Pre-consensus handling: speculative delivery of events as they arrive.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use strata_types::Event;

use crate::pipeline::PipelineContext;
use crate::tracing_spans::event_span;
use crate::work_queue::{Queued, WorkQueue};
use crate::NodeError;

/// Consumes events (from any creator) before their consensus position is
/// known. Each transaction is pre-handled exactly once, in event order, and
/// the event is then applied speculatively to the current state.
pub struct PreConsensusHandler {
    queue: WorkQueue<Arc<Event>>,
    context: PipelineContext,
    /// Wakes the shuffle worker so it can catch up the work generation.
    work_available: Arc<Notify>,
}

impl PreConsensusHandler {
    pub fn new(
        capacity: usize,
        context: PipelineContext,
        work_available: Arc<Notify>,
    ) -> (Self, mpsc::Receiver<Queued<Arc<Event>>>) {
        let (queue, receiver) = WorkQueue::new(capacity);
        (
            Self {
                queue,
                context,
                work_available,
            },
            receiver,
        )
    }

    /// Queue an event, waiting while the queue is full.
    pub async fn submit(&self, event: Arc<Event>) -> Result<(), NodeError> {
        self.queue.push(event).await?;
        self.update_gauge();
        Ok(())
    }

    /// Events queued or being handled.
    pub fn queue_size(&self) -> usize {
        self.queue.depth()
    }

    /// Discard every queued event.
    pub fn clear(&self) {
        self.queue.clear();
    }

    /// Handle one event synchronously. Returns the number of transactions
    /// delivered for the first time.
    pub fn handle(&self, event: &Arc<Event>) -> usize {
        let _span = event_span(event.creator(), event.id().sequence).entered();
        let ctx = &self.context;

        let system = ctx.router.dispatch_pre_consensus(event, &ctx.failures);
        let application = ctx.manager.pre_handle(event);
        let delivered = system + application;

        if delivered == 0 && !event.is_empty() {
            debug!(event = %event.id(), "event already pre-handled, not applying it again");
            return 0;
        }
        let applied = ctx.manager.apply_pre_consensus(event);
        self.work_available.notify_one();

        if let Some(metrics) = &ctx.metrics {
            metrics.pre_consensus_transactions.inc_by(delivered as u64);
        }
        trace!(delivered, applied, "pre-consensus event handled");
        delivered
    }

    /// Run the worker loop until shutdown or until every sender is gone.
    /// An event already dequeued when shutdown arrives is finished first.
    pub fn spawn(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Queued<Arc<Event>>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let queued = tokio::select! {
                    biased;
                    _ = shutdown.recv() => {
                        debug!("pre-consensus worker shutting down");
                        break;
                    }
                    queued = receiver.recv() => match queued {
                        Some(queued) => queued,
                        None => break,
                    },
                };
                let event_id = queued.item.id();
                match self.queue.accept(queued) {
                    Some(event) => {
                        // application code runs off the async workers
                        let handler = Arc::clone(&self);
                        let handled = tokio::task::spawn_blocking(move || handler.handle(&event)).await;
                        if let Err(err) = handled {
                            error!(event = %event_id, %err, "pre-consensus handling aborted");
                        }
                        self.queue.done();
                    }
                    None => trace!(event = %event_id, "skipping cleared event"),
                }
                self.update_gauge();
            }
        })
    }

    fn update_gauge(&self) {
        if let Some(metrics) = &self.context.metrics {
            metrics.pre_consensus_queue_size.set(self.queue.depth() as i64);
        }
    }
}
