use tessel_common::{Result, Schema};

use crate::operator::{ExecContext, Operator, Ready};

/// Column projection by index.
pub struct Project {
    child: Box<dyn Operator>,
    columns: Vec<usize>,
    schema: Schema,
}

impl Project {
    pub fn new(child: Box<dyn Operator>, columns: Vec<usize>) -> Result<Self> {
        let schema = child.schema().project(&columns)?;
        Ok(Self {
            child,
            columns,
            schema,
        })
    }
}

impl Operator for Project {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.child.open(ctx)
    }

    fn next_ready(&mut self) -> Result<Ready> {
        match self.child.next_ready()? {
            Ready::Batch(batch) => Ok(Ready::Batch(batch.project(&self.columns)?)),
            other => Ok(other),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn name(&self) -> &'static str {
        "Project"
    }
}
