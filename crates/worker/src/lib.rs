//! Worker query runtime.
//!
//! A worker receives sub-plans from the coordinator, builds and opens their
//! operator trees, reports ready, and runs every fragment on a bounded
//! executor pool once the coordinator says start. Membership changes are
//! applied to running queries according to their fault-tolerance mode.

pub mod config;
pub mod error;
pub mod partition;
pub mod runtime;
pub mod scheduler;
pub mod tasks;

pub use config::{PeerEntry, Settings};
pub use error::{Result, WorkerError};
pub use partition::{PartitionOutcome, PartitionState, QueryPartition};
pub use runtime::{ExitCause, Termination, Worker, WorkerHandle};
pub use scheduler::{ExecutorPool, Fragment, FragmentStats};
pub use tasks::TaskRegistry;
