use tessel_common::{Result, Schema};

use crate::expr::Predicate;
use crate::operator::{ExecContext, Operator, Ready};

/// Keeps the rows satisfying a predicate. Empty results are skipped.
pub struct Filter {
    child: Box<dyn Operator>,
    predicate: Predicate,
}

impl Filter {
    pub fn new(child: Box<dyn Operator>, predicate: Predicate) -> Result<Self> {
        predicate.validate(child.schema())?;
        Ok(Self { child, predicate })
    }
}

impl Operator for Filter {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.child.open(ctx)
    }

    fn next_ready(&mut self) -> Result<Ready> {
        loop {
            match self.child.next_ready()? {
                Ready::Batch(batch) => {
                    let mask = self.predicate.evaluate(&batch)?;
                    let kept = batch.filter(&mask)?;
                    if !kept.is_empty() {
                        return Ok(Ready::Batch(kept));
                    }
                }
                other => return Ok(other),
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn name(&self) -> &'static str {
        "Filter"
    }
}
