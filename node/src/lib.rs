//! strata pipeline: turns gossiped events and consensus rounds into
//! application state.
//!
//! The pipeline:
//! - Pools self-submitted transactions until a self event is created
//! - Pre-handles every event as it arrives and applies it speculatively
//! - Applies consensus rounds strictly in order, exactly once per transaction
//! - Routes system transactions to their handlers in both stages
//! - Cuts signed states on schedule and at the freeze round

pub mod config;
pub mod consensus_round;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod pipeline_event;
pub mod pre_consensus;
pub mod shutdown;
pub mod system_router;
pub mod tracing_spans;
pub mod transaction_pool;
pub mod work_queue;

#[cfg(test)]
mod test_support;

pub use config::PipelineConfig;
pub use consensus_round::{ConsensusRoundHandler, RoundReport};
pub use error::NodeError;
pub use logging::{init_logging, LogFormat};
pub use metrics::PipelineMetrics;
pub use persistence::{ChannelPersistence, ReleaseImmediately, StatePersistence};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineContext};
pub use pipeline_event::{EventBus, PipelineEvent};
pub use pre_consensus::PreConsensusHandler;
pub use shutdown::ShutdownController;
pub use system_router::{
    Stage, SystemTransactionContext, SystemTransactionHandler, SystemTransactionRouter,
};
pub use transaction_pool::{SubmitResult, TransactionPool};
pub use work_queue::{Queued, WorkQueue};
