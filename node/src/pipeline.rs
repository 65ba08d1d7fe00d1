//! Wiring of the pool, both handlers, the state manager and the workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use strata_state::{
    build_state_manager, AppError, AppState, DualState, FreezeController, GenerationRef,
    SignedState, SignedStatePolicy, StateManager, StateStrategy,
};
use strata_types::{
    ConsensusRound, Event, EventId, FailureLog, SystemTransactionType, Timestamp, Transaction,
};

use crate::consensus_round::ConsensusRoundHandler;
use crate::pre_consensus::PreConsensusHandler;
use crate::system_router::{Stage, SystemTransactionContext};
use crate::tracing_spans::shuffle_span;
use crate::{
    EventBus, NodeError, PipelineConfig, PipelineEvent, PipelineMetrics, ReleaseImmediately,
    ShutdownController, StatePersistence, SubmitResult, SystemTransactionRouter, TransactionPool,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// What every handler shares: the state manager, the router, the failure
/// log and the observability hooks.
#[derive(Clone)]
pub struct PipelineContext {
    pub manager: Arc<dyn StateManager>,
    pub router: Arc<SystemTransactionRouter>,
    pub failures: Arc<FailureLog>,
    pub metrics: Option<Arc<PipelineMetrics>>,
    pub bus: Arc<EventBus>,
}

/// Collects everything a [`Pipeline`] needs before its workers start.
pub struct PipelineBuilder {
    config: PipelineConfig,
    app: Option<AppState>,
    dual: DualState,
    persistence: Arc<dyn StatePersistence>,
    router: SystemTransactionRouter,
    bus: EventBus,
}

impl PipelineBuilder {
    fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            app: None,
            dual: DualState::new(),
            persistence: Arc::new(ReleaseImmediately),
            router: SystemTransactionRouter::new(),
            bus: EventBus::new(),
        }
    }

    pub fn app(mut self, app: AppState) -> Self {
        self.app = Some(app);
        self
    }

    /// Dual state of the initial generation, e.g. a freeze time restored
    /// from a saved state.
    pub fn initial_dual_state(mut self, dual: DualState) -> Self {
        self.dual = dual;
        self
    }

    /// Where signed states go. Without one they are released at once.
    pub fn persistence(mut self, persistence: impl StatePersistence + 'static) -> Self {
        self.persistence = Arc::new(persistence);
        self
    }

    pub fn system_handler(
        mut self,
        kind: SystemTransactionType,
        stage: Stage,
        handler: impl Fn(&SystemTransactionContext<'_>) -> Result<(), AppError> + Send + Sync + 'static,
    ) -> Self {
        self.router.register(kind, stage, handler);
        self
    }

    pub fn on_event(mut self, listener: impl Fn(&PipelineEvent) + Send + Sync + 'static) -> Self {
        self.bus.subscribe(listener);
        self
    }

    /// Build the pipeline and spawn its workers. Must be called from within
    /// a Tokio runtime.
    pub fn start(self) -> Result<Pipeline, NodeError> {
        let config = self.config;
        config.validate()?;
        let app = self.app.ok_or(NodeError::MissingApplication)?;

        let metrics = if config.enable_metrics {
            Some(Arc::new(PipelineMetrics::new()?))
        } else {
            None
        };
        let bus = Arc::new(self.bus);

        let failures = {
            let metrics = metrics.clone();
            let bus = Arc::clone(&bus);
            Arc::new(FailureLog::with_listener(move |failure| {
                error!(component = failure.component, kind = %failure.kind, "{}", failure.message);
                if let Some(metrics) = &metrics {
                    metrics.failures.inc();
                }
                bus.emit(&PipelineEvent::FailureRecorded {
                    component: failure.component,
                    kind: failure.kind,
                });
            }))
        };

        let manager = build_state_manager(
            config.state_strategy,
            app,
            self.dual,
            Arc::clone(&failures),
            config.stale_event_rounds,
        );
        let context = PipelineContext {
            manager,
            router: Arc::new(self.router),
            failures,
            metrics,
            bus,
        };

        let pool = Arc::new(TransactionPool::new(
            config.transaction_pool_capacity,
            config.transaction_max_bytes,
            config.max_transaction_bytes_per_event,
        ));
        let freeze = Arc::new(FreezeController::new(config.freeze_timestamp()));
        let work_available = Arc::new(Notify::new());

        let (pre_consensus, pre_rx) = PreConsensusHandler::new(
            config.pre_consensus_queue_capacity,
            context.clone(),
            Arc::clone(&work_available),
        );
        let pre_consensus = Arc::new(pre_consensus);
        let (consensus, consensus_rx) = ConsensusRoundHandler::new(
            config.consensus_queue_capacity,
            context.clone(),
            SignedStatePolicy::new(config.signed_state_frequency),
            Arc::clone(&freeze),
            Arc::clone(&pool),
            self.persistence,
        );
        let consensus = Arc::new(consensus);

        let shutdown = ShutdownController::new();
        let mut task_handles = vec![
            Arc::clone(&pre_consensus).spawn(pre_rx, shutdown.subscribe()),
            Arc::clone(&consensus).spawn(consensus_rx, shutdown.subscribe()),
        ];
        if config.state_strategy == StateStrategy::Shuffled {
            task_handles.push(spawn_shuffler(
                context.clone(),
                config.shuffle_interval(),
                work_available,
                shutdown.subscribe(),
            ));
        }

        info!(
            self_id = config.self_id,
            strategy = %config.state_strategy,
            signed_state_frequency = config.signed_state_frequency,
            "strata pipeline started"
        );
        Ok(Pipeline {
            config,
            context,
            pre_consensus,
            consensus,
            pool,
            freeze,
            shutdown,
            task_handles,
            next_sequence: AtomicU64::new(0),
        })
    }
}

/// A running event-to-state pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    context: PipelineContext,
    pre_consensus: Arc<PreConsensusHandler>,
    consensus: Arc<ConsensusRoundHandler>,
    pool: Arc<TransactionPool>,
    freeze: Arc<FreezeController>,
    shutdown: ShutdownController,
    task_handles: Vec<JoinHandle<()>>,
    next_sequence: AtomicU64,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Queue an event (self or peer) for pre-consensus handling. Waits while
    /// the queue is full.
    pub async fn submit_event(&self, event: Arc<Event>) -> Result<(), NodeError> {
        self.pre_consensus.submit(event).await
    }

    /// Queue a consensus round. Waits while the queue is full.
    pub async fn enqueue_round(&self, round: ConsensusRound) -> Result<(), NodeError> {
        self.consensus.enqueue(round).await
    }

    pub fn submit_transaction(&self, transaction: Transaction, priority: bool) -> SubmitResult {
        let result = self.pool.submit(transaction, priority);
        if let Some(metrics) = &self.context.metrics {
            metrics.transaction_pool_size.set(self.pool.len() as i64);
        }
        result
    }

    /// Drain the pool into a new self event. The caller gossips it and also
    /// feeds it back through [`Pipeline::submit_event`] like any other event.
    pub fn create_self_event(&self) -> Arc<Event> {
        let transactions = self.pool.drain_for_event();
        if let Some(metrics) = &self.context.metrics {
            metrics.transaction_pool_size.set(self.pool.len() as i64);
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let id = EventId::new(self.config.self_id(), sequence);
        debug!(event = %id, transactions = transactions.len(), "self event created");
        Arc::new(Event::new(id, Timestamp::now(), transactions))
    }

    /// Schedule (or with `None`, cancel) a freeze. Stored both on the
    /// controller and on the state so later snapshots carry it.
    pub fn set_freeze_time(&self, freeze_time: Option<Timestamp>) {
        self.freeze.set_freeze_time(freeze_time);
        self.context.manager.set_freeze_time(freeze_time);
    }

    /// Recovery path after a freeze: forget the freeze and admit application
    /// transactions again.
    pub fn clear_freeze_times(&self) {
        self.context.manager.clear_freeze_times();
        self.freeze.set_freeze_time(None);
        self.freeze.reset();
        self.pool.set_frozen(false);
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze.is_frozen()
    }

    pub fn freeze_round(&self) -> Option<u64> {
        self.freeze.freeze_round()
    }

    pub fn pre_consensus_queue_size(&self) -> usize {
        self.pre_consensus.queue_size()
    }

    pub fn consensus_queue_size(&self) -> usize {
        self.consensus.queue_size()
    }

    pub fn transaction_pool_size(&self) -> usize {
        self.pool.len()
    }

    pub fn last_round(&self) -> Option<u64> {
        self.consensus.last_round()
    }

    pub fn failures(&self) -> &Arc<FailureLog> {
        &self.context.failures
    }

    pub fn state_manager(&self) -> &Arc<dyn StateManager> {
        &self.context.manager
    }

    pub fn metrics(&self) -> Option<&Arc<PipelineMetrics>> {
        self.context.metrics.as_ref()
    }

    pub fn latest_immutable(&self) -> Option<GenerationRef> {
        self.context.manager.latest_immutable()
    }

    /// Replace the state with a copy of `signed` and resume after its round.
    /// Queued work is discarded.
    pub fn load_from_signed_state(&self, signed: &SignedState) {
        self.pre_consensus.clear();
        self.consensus.clear();
        self.context.manager.load_from_signed_state(signed);
        self.consensus.resume_after(signed);
        self.freeze.reset();
        self.pool.set_frozen(false);
        info!(round = signed.round(), generation = %signed.generation_id(), "state loaded from signed state");
    }

    /// Discard queued work, the pool and any speculative state.
    pub fn clear(&self) {
        self.pre_consensus.clear();
        self.consensus.clear();
        self.pool.clear();
        self.context.manager.clear();
        info!("pipeline cleared");
    }

    /// Wait until both handler queues are empty.
    pub async fn wait_for_drain(&self, timeout: Duration) -> Result<(), NodeError> {
        let drained = async {
            while self.pre_consensus.queue_size() > 0 || self.consensus.queue_size() > 0 {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        };
        tokio::time::timeout(timeout, drained)
            .await
            .map_err(|_| NodeError::DrainTimeout(timeout))
    }

    /// Signal every worker and wait for them to finish their current unit of
    /// work.
    pub async fn stop(mut self) -> Result<(), NodeError> {
        info!("strata pipeline stopping");
        self.shutdown.shutdown();

        let handles: Vec<JoinHandle<()>> = self.task_handles.drain(..).collect();
        let wait_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "pipeline worker ended abnormally");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait_all).await.is_err() {
            warn!(timeout = ?SHUTDOWN_TIMEOUT, "pipeline workers did not stop in time");
            return Err(NodeError::ShutdownTimeout);
        }
        info!("strata pipeline stopped");
        Ok(())
    }
}

/// Periodic shuffles for the single-state strategy, with catch-up of the
/// work generation whenever the pre-consensus side signals new work.
fn spawn_shuffler(
    context: PipelineContext,
    interval: Duration,
    work_available: Arc<Notify>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;
        let mut shuffles = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("shuffle worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    shuffles += 1;
                    let span = shuffle_span(shuffles);
                    let started = Instant::now();
                    let manager = Arc::clone(&context.manager);
                    let shuffled = tokio::task::spawn_blocking(move || {
                        let _span = span.entered();
                        manager.refresh_current()
                    });
                    let generation = match shuffled.await {
                        Ok(generation) => generation,
                        Err(err) => {
                            error!(%err, "shuffle aborted");
                            continue;
                        }
                    };
                    if let Some(metrics) = &context.metrics {
                        metrics.shuffles.inc();
                        metrics.shuffle_time_ms.observe(started.elapsed().as_secs_f64() * 1_000.0);
                    }
                    context.bus.emit(&PipelineEvent::Shuffled { generation });
                    debug!(%generation, "shuffled");
                }
                _ = work_available.notified() => {
                    let manager = Arc::clone(&context.manager);
                    match tokio::task::spawn_blocking(move || manager.catch_up()).await {
                        Ok(0) => {}
                        Ok(caught_up) => debug!(caught_up, "work generation caught up"),
                        Err(err) => error!(%err, "catch-up aborted"),
                    }
                }
            }
        }
    })
}
