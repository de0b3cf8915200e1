use std::sync::Arc;

use tessel_common::{ExecutionOptions, QueryId, Result, Schema, TupleBatch, WorkerId};
use tokio::sync::Notify;

use crate::exchange::{BufferSettings, ChannelRegistry, MissingWorkers};
use crate::fabric::Fabric;
use crate::storage::Storage;

/// Outcome of one non-blocking pull.
#[derive(Debug)]
pub enum Ready {
    Batch(TupleBatch),
    /// Nothing available right now; the fragment waker fires when that changes.
    NotReady,
    /// The current iteration round is over; more data may follow.
    EndOfIteration,
    EndOfStream,
}

impl Ready {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Ready::EndOfStream)
    }
}

/// A physical operator in a fragment's tree.
///
/// Children are owned by their parent. `open` runs once before the first
/// pull and `close` once after the last; both recurse into children.
pub trait Operator: Send {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()>;

    /// Produces the next batch without blocking on I/O.
    fn next_ready(&mut self) -> Result<Ready>;

    fn close(&mut self) -> Result<()>;

    fn schema(&self) -> &Schema;

    fn name(&self) -> &'static str;
}

/// Everything an operator may touch while it runs on one worker.
#[derive(Clone)]
pub struct ExecContext {
    pub query_id: QueryId,
    pub worker_id: WorkerId,
    pub fragment: usize,
    pub options: ExecutionOptions,
    pub fabric: Arc<dyn Fabric>,
    pub registry: Arc<ChannelRegistry>,
    pub storage: Arc<dyn Storage>,
    pub missing: Arc<MissingWorkers>,
    pub buffers: BufferSettings,
    /// Wakes the task driving this fragment.
    pub waker: Arc<Notify>,
}

impl ExecContext {
    /// Context for another fragment of the same query, with its own waker.
    pub fn for_fragment(&self, fragment: usize) -> ExecContext {
        ExecContext {
            fragment,
            waker: Arc::new(Notify::new()),
            ..self.clone()
        }
    }
}
