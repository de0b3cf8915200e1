use thiserror::Error;

/// Unified error type for Tessel crates.
///
/// `Plan` errors are client-visible (bad request) and never retried; every
/// other variant describes a fault discovered while a query runs or while
/// the process talks to its peers.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request: {0}")]
    Plan(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("operation not supported: {0}")]
    NotSupported(String),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("an unknown error occurred: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(msg: &str) -> Self {
        Error::Unknown(msg.to_string())
    }

    pub fn plan(msg: impl Into<String>) -> Self {
        Error::Plan(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Error::Execution(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// True for errors caused by the submitted request rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Plan(_))
    }
}
