use tessel_common::{Error, Result, Schema};

use crate::operator::{ExecContext, Operator, Ready};

/// Bag union of children with identical schemas, read round-robin.
///
/// End-of-iteration is reported once every unfinished child has reached it.
pub struct UnionAll {
    children: Vec<Box<dyn Operator>>,
    finished: Vec<bool>,
    at_eoi: Vec<bool>,
    cursor: usize,
}

impl UnionAll {
    pub fn new(children: Vec<Box<dyn Operator>>) -> Result<Self> {
        let Some(first) = children.first() else {
            return Err(Error::plan("union needs at least one child"));
        };
        for c in &children[1..] {
            if c.schema() != first.schema() {
                return Err(Error::plan(format!(
                    "union children disagree on schema: {} vs {}",
                    first.schema(),
                    c.schema()
                )));
            }
        }
        let n = children.len();
        Ok(Self {
            children,
            finished: vec![false; n],
            at_eoi: vec![false; n],
            cursor: 0,
        })
    }
}

impl Operator for UnionAll {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        for c in &mut self.children {
            c.open(ctx)?;
        }
        Ok(())
    }

    fn next_ready(&mut self) -> Result<Ready> {
        let n = self.children.len();
        for k in 0..n {
            let i = (self.cursor + k) % n;
            if self.finished[i] || self.at_eoi[i] {
                continue;
            }
            match self.children[i].next_ready()? {
                Ready::Batch(b) => {
                    self.cursor = i + 1;
                    return Ok(Ready::Batch(b));
                }
                Ready::EndOfIteration => self.at_eoi[i] = true,
                Ready::EndOfStream => self.finished[i] = true,
                Ready::NotReady => {}
            }
        }
        let live: Vec<usize> = (0..n).filter(|i| !self.finished[*i]).collect();
        if live.is_empty() {
            return Ok(Ready::EndOfStream);
        }
        if live.iter().all(|i| self.at_eoi[*i]) {
            self.at_eoi.iter_mut().for_each(|e| *e = false);
            return Ok(Ready::EndOfIteration);
        }
        Ok(Ready::NotReady)
    }

    fn close(&mut self) -> Result<()> {
        for c in &mut self.children {
            c.close()?;
        }
        Ok(())
    }

    fn schema(&self) -> &Schema {
        self.children[0].schema()
    }

    fn name(&self) -> &'static str {
        "UnionAll"
    }
}
