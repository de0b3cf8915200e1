use std::collections::VecDeque;

use tessel_common::{Error, RelationKey, Result, Schema, TupleBatch};

use crate::operator::{ExecContext, Operator, Ready};

/// Reads the local partition of a stored relation.
pub struct TableScan {
    relation: RelationKey,
    schema: Schema,
    pending: Option<VecDeque<TupleBatch>>,
}

impl TableScan {
    pub fn new(relation: RelationKey, schema: Schema) -> Self {
        Self {
            relation,
            schema,
            pending: None,
        }
    }
}

impl Operator for TableScan {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        let batches = ctx.storage.scan(&self.relation)?;
        for b in &batches {
            if b.schema() != &self.schema {
                return Err(Error::execution(format!(
                    "stored schema {} of {} differs from planned {}",
                    b.schema(),
                    self.relation,
                    self.schema
                )));
            }
        }
        self.pending = Some(batches.into());
        Ok(())
    }

    fn next_ready(&mut self) -> Result<Ready> {
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::execution("scan used before open"))?;
        while let Some(batch) = pending.pop_front() {
            if !batch.is_empty() {
                return Ok(Ready::Batch(batch));
            }
        }
        Ok(Ready::EndOfStream)
    }

    fn close(&mut self) -> Result<()> {
        self.pending = None;
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn name(&self) -> &'static str {
        "TableScan"
    }
}
