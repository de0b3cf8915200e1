//! Engine crate
//!
//! Pull-based physical operators, the exchange layer that moves tuple
//! batches between workers, and the network fabric underneath it.
//!
//! Every operator implements [`Operator`]; `next_ready` never blocks. An
//! operator with nothing to return yields [`Ready::NotReady`] and the task
//! driving its fragment parks on the fragment's waker until input arrives.

pub mod exchange;
pub mod expr;
pub mod fabric;
pub mod instantiate;
pub mod iterative;
pub mod operator;
pub mod operators;
pub mod plan;
pub mod storage;

pub use exchange::{BufferSettings, ChannelRegistry, InputBuffer, MissingWorkers};
pub use expr::{CmpOp, Literal, Predicate};
pub use fabric::{
    Fabric, FabricBuilder, FlowControl, GrpcFabricBuilder, InboundHandler, LinkState, LocalEndpoint,
    LocalNetwork,
};
pub use instantiate::instantiate;
pub use iterative::eoi_report_schema;
pub use operator::{ExecContext, Operator, Ready};
pub use plan::{ExchangeEdge, Partitioning, PlanFragment, PlanNode, SubQueryPlan};
pub use storage::{MemoryStorage, Storage};
