//! Coordinator crate
//!
//! Compiles symbolic plan fragments into per-worker sub-plans, ships them,
//! and follows each query through the readiness handshake to its final
//! status while tracking which workers are alive.

pub mod cluster;
pub mod config;
pub mod construct;
pub mod encoding;
pub mod error;
pub mod service;

pub use cluster::{ClusterState, WorkerState};
pub use config::{ColumnEntry, RelationEntry, Settings, WorkerEntry};
pub use construct::{set_execution_options, QueryConstruct};
pub use encoding::{OpId, OperatorEncoding, PlanFragmentEncoding, QueryEncoding, Role};
pub use error::CoordinatorError;
pub use service::{Coordinator, QueryOutcome, QueryStatus};
