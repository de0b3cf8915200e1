use std::net::AddrParseError;
use tessel_common::{QueryId, WorkerId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("Invalid server address in configuration")]
    AddrParse(#[from] AddrParseError),

    #[error(transparent)]
    Engine(#[from] tessel_common::Error),

    #[error("Failed to encode a sub-plan: {0}")]
    Encode(#[from] bincode::Error),

    #[error("Worker ID not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Query ID not found: {0}")]
    QueryNotFound(QueryId),

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// True when the submitted query itself is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(self, CoordinatorError::Engine(e) if e.is_client_error())
    }
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;
