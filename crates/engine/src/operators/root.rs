//! Fragment roots that keep data on the local worker.

use std::sync::Arc;

use tessel_common::{Error, RelationKey, Result, Schema};
use tracing::debug;

use crate::operator::{ExecContext, Operator, Ready};
use crate::storage::Storage;

/// Drains its child and discards the rows. Batches are returned so the
/// driver can count them.
pub struct SinkRoot {
    child: Box<dyn Operator>,
}

impl SinkRoot {
    pub fn new(child: Box<dyn Operator>) -> Self {
        Self { child }
    }
}

impl Operator for SinkRoot {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.child.open(ctx)
    }

    fn next_ready(&mut self) -> Result<Ready> {
        self.child.next_ready()
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn name(&self) -> &'static str {
        "SinkRoot"
    }
}

/// Appends its child's rows to a relation in local storage.
pub struct InsertRoot {
    child: Box<dyn Operator>,
    relation: RelationKey,
    overwrite: bool,
    storage: Option<Arc<dyn Storage>>,
}

impl InsertRoot {
    pub fn new(child: Box<dyn Operator>, relation: RelationKey, overwrite: bool) -> Self {
        Self {
            child,
            relation,
            overwrite,
            storage: None,
        }
    }
}

impl Operator for InsertRoot {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.child.open(ctx)?;
        if self.overwrite {
            ctx.storage.truncate(&self.relation)?;
        }
        self.storage = Some(ctx.storage.clone());
        Ok(())
    }

    fn next_ready(&mut self) -> Result<Ready> {
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| Error::execution("insert used before open"))?;
        let ready = self.child.next_ready()?;
        if let Ready::Batch(batch) = &ready {
            storage.insert(&self.relation, batch.clone())?;
        }
        if ready.is_end_of_stream() {
            debug!(relation = %self.relation, "insert finished");
        }
        Ok(ready)
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn name(&self) -> &'static str {
        "InsertRoot"
    }
}
