//! Common crate
//!
//! Shared identifiers, schemas, tuple batches, catalog access and error
//! handling for Tessel.
//!
//! # Example
//! ```rust
//! use tessel_common::{Schema, Type};
//! let schema = Schema::new(vec![("x".to_string(), Type::Int)]);
//! assert_eq!(schema.len(), 1);
//! ```

pub mod batch;
pub mod catalog;
pub mod error;
pub mod ids;
pub mod options;
pub mod schema;

pub use batch::{TupleBatch, BATCH_CAPACITY};
pub use catalog::{Catalog, MemoryCatalog, RelationKey};
pub use error::{Error, Result};
pub use ids::{ChannelId, QueryId, WorkerId, COORDINATOR_ID};
pub use options::{ExecutionOptions, FtMode};
pub use schema::{Schema, Type};
