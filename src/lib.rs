pub mod config;
pub mod driver;
pub mod health;
pub mod listener;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod responder;
pub mod stats;
pub mod stopwatch;
pub mod store;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("failed to initialize tracing")]
    TracingInit,
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("listener error: {0}")]
    Listener(#[from] listener::ListenerError),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] orchestrator::OrchestratorError),
    #[error("store error: {0}")]
    Store(#[from] store::StoreError),
}
