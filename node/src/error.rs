use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("logging error: {0}")]
    Logging(String),

    #[error("no application state was supplied")]
    MissingApplication,

    #[error("pipeline is stopped")]
    Stopped,

    #[error("queues did not drain within {0:?}")]
    DrainTimeout(std::time::Duration),

    #[error("shutdown timeout")]
    ShutdownTimeout,
}
