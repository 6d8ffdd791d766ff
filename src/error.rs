use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid log level: {0}")]
    LogLevel(String),
    #[error("engine task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
