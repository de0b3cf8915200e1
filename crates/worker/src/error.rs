use std::net::AddrParseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("Invalid worker server address in configuration")]
    WorkerAddrParse(#[from] AddrParseError),

    #[error(transparent)]
    Engine(#[from] tessel_common::Error),

    #[error("Failed to decode a sub-plan: {0}")]
    Decode(#[from] bincode::Error),

    #[error("Query {0} is not active on this worker")]
    UnknownQuery(tessel_common::QueryId),

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
