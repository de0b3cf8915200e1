//! Recursive (fixpoint) evaluation.
//!
//! An [`IdbController`] owns one relation being computed iteratively on one
//! worker. It emits the seed rows, then keeps absorbing feedback rows, and
//! passes on only rows it has never seen. At the end of each round it sends
//! `(idb_id, worker_id, num_new_tuples)` to the single [`EosController`] of
//! the query. Once a full round of reports shows no new rows anywhere, the
//! controller tells every IDB to stop.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use arrow::array::{ArrayRef, Int32Array, Int64Array};
use arrow::row::{OwnedRow, RowConverter, SortField};
use tessel_api::StreamMessage;
use tessel_common::{
    ChannelId, Error, FtMode, Result, Schema, TupleBatch, Type, WorkerId,
};
use tracing::{debug, info};

use crate::exchange::{MissingWorkers, Outbox};
use crate::operator::{ExecContext, Operator, Ready};
use crate::plan::ExchangeEdge;

/// Schema of end-of-iteration reports and of the terminate signal.
pub fn eoi_report_schema() -> Schema {
    Schema::of(&[
        ("idb_id", Type::Int),
        ("worker_id", Type::Int),
        ("num_new_tuples", Type::Long),
    ])
}

fn report_batch(idb_id: i32, worker_id: WorkerId, new_tuples: i64) -> Result<TupleBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int32Array::from(vec![idb_id])),
        Arc::new(Int32Array::from(vec![worker_id])),
        Arc::new(Int64Array::from(vec![new_tuples])),
    ];
    TupleBatch::try_new(eoi_report_schema(), columns)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Seed,
    Iterating,
    Done,
}

pub struct IdbController {
    idb_id: i32,
    seed: Box<dyn Operator>,
    feedback: Box<dyn Operator>,
    control: Box<dyn Operator>,
    controller: ExchangeEdge,
    phase: Phase,
    seen: HashSet<OwnedRow>,
    converter: Option<RowConverter>,
    new_this_round: i64,
    rounds: u64,
    local_id: WorkerId,
    outbox: Option<Outbox>,
}

impl IdbController {
    pub fn new(
        idb_id: i32,
        seed: Box<dyn Operator>,
        feedback: Box<dyn Operator>,
        control: Box<dyn Operator>,
        controller: ExchangeEdge,
    ) -> Result<Self> {
        if feedback.schema() != seed.schema() {
            return Err(Error::plan(format!(
                "iteration input {} does not match seed {}",
                feedback.schema(),
                seed.schema()
            )));
        }
        if controller.destinations.len() != 1 {
            return Err(Error::plan(format!(
                "iterative unit {idb_id} must report to exactly one controller worker"
            )));
        }
        Ok(Self {
            idb_id,
            seed,
            feedback,
            control,
            controller,
            phase: Phase::Seed,
            seen: HashSet::new(),
            converter: None,
            new_this_round: 0,
            rounds: 0,
            local_id: 0,
            outbox: None,
        })
    }

    fn outbox(&mut self) -> Result<&mut Outbox> {
        self.outbox
            .as_mut()
            .ok_or_else(|| Error::execution("iterative unit used before open"))
    }

    /// Rows of `batch` not seen before, or `None` if there are none.
    fn delta(&mut self, batch: &TupleBatch) -> Result<Option<TupleBatch>> {
        let converter = self
            .converter
            .as_mut()
            .ok_or_else(|| Error::execution("iterative unit used before open"))?;
        let rows = converter.convert_columns(batch.columns())?;
        let mut fresh = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            if self.seen.insert(row.owned()) {
                fresh.push(i as u32);
            }
        }
        self.new_this_round += fresh.len() as i64;
        match fresh.len() {
            0 => Ok(None),
            n if n == batch.num_rows() => Ok(Some(batch.clone())),
            _ => Ok(Some(batch.take(&fresh)?)),
        }
    }

    fn end_round(&mut self) -> Result<()> {
        let report = report_batch(self.idb_id, self.local_id, self.new_this_round)?;
        debug!(
            idb_id = self.idb_id,
            worker_id = self.local_id,
            round = self.rounds,
            new_tuples = self.new_this_round,
            "iteration round finished"
        );
        self.new_this_round = 0;
        self.rounds += 1;
        let dest = self.controller.destinations[0];
        let channel = self.controller.channel;
        self.outbox()?.enqueue(dest, channel, StreamMessage::Batch(report))
    }

    fn terminate(&mut self) -> Result<()> {
        self.phase = Phase::Done;
        let dest = self.controller.destinations[0];
        let channel = self.controller.channel;
        debug!(idb_id = self.idb_id, rounds = self.rounds, "iterative unit done");
        self.outbox()?.enqueue(dest, channel, StreamMessage::Eos)
    }
}

impl Operator for IdbController {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.seed.open(ctx)?;
        self.feedback.open(ctx)?;
        self.control.open(ctx)?;
        let fields = self
            .seed
            .schema()
            .columns()
            .iter()
            .map(|(_, t)| SortField::new(t.to_arrow()))
            .collect();
        self.converter = Some(RowConverter::new(fields)?);
        self.local_id = ctx.worker_id;
        self.outbox = Some(Outbox::new(ctx));
        Ok(())
    }

    fn next_ready(&mut self) -> Result<Ready> {
        loop {
            if !self.outbox()?.flush()? {
                return Ok(Ready::NotReady);
            }
            match self.phase {
                Phase::Done => return Ok(Ready::EndOfStream),
                Phase::Seed => match self.seed.next_ready()? {
                    Ready::Batch(b) => {
                        if let Some(d) = self.delta(&b)? {
                            return Ok(Ready::Batch(d));
                        }
                    }
                    Ready::EndOfIteration => {}
                    Ready::EndOfStream => {
                        self.end_round()?;
                        self.phase = Phase::Iterating;
                        return Ok(Ready::EndOfIteration);
                    }
                    Ready::NotReady => return Ok(Ready::NotReady),
                },
                Phase::Iterating => {
                    match self.control.next_ready()? {
                        Ready::Batch(_) | Ready::EndOfStream => {
                            self.terminate()?;
                            continue;
                        }
                        Ready::EndOfIteration | Ready::NotReady => {}
                    }
                    match self.feedback.next_ready()? {
                        Ready::Batch(b) => {
                            if let Some(d) = self.delta(&b)? {
                                return Ok(Ready::Batch(d));
                            }
                        }
                        Ready::EndOfIteration => {
                            self.end_round()?;
                            return Ok(Ready::EndOfIteration);
                        }
                        // Every feedback source is gone, no further round can complete.
                        Ready::EndOfStream => self.terminate()?,
                        Ready::NotReady => return Ok(Ready::NotReady),
                    }
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.seed.close()?;
        self.feedback.close()?;
        self.control.close()
    }

    fn schema(&self) -> &Schema {
        self.seed.schema()
    }

    fn name(&self) -> &'static str {
        "IdbController"
    }
}

/// Root that decides when a recursive computation has converged.
pub struct EosController {
    child: Box<dyn Operator>,
    participants: BTreeSet<(i32, WorkerId)>,
    outputs: Vec<ExchangeEdge>,
    reports: BTreeMap<(i32, WorkerId), VecDeque<i64>>,
    rounds: u64,
    finished: bool,
    local_id: WorkerId,
    ft_mode: FtMode,
    missing: Arc<MissingWorkers>,
    outbox: Option<Outbox>,
}

impl EosController {
    pub fn new(
        child: Box<dyn Operator>,
        participants: Vec<(i32, WorkerId)>,
        outputs: Vec<ExchangeEdge>,
    ) -> Result<Self> {
        if child.schema() != &eoi_report_schema() {
            return Err(Error::plan(format!(
                "controller input {} is not the end-of-iteration report schema",
                child.schema()
            )));
        }
        Ok(Self {
            child,
            participants: participants.into_iter().collect(),
            outputs,
            reports: BTreeMap::new(),
            rounds: 0,
            finished: false,
            local_id: 0,
            ft_mode: FtMode::None,
            missing: Arc::new(MissingWorkers::default()),
            outbox: None,
        })
    }

    fn outbox(&mut self) -> Result<&mut Outbox> {
        self.outbox
            .as_mut()
            .ok_or_else(|| Error::execution("controller used before open"))
    }

    fn record(&mut self, batch: &TupleBatch) -> Result<()> {
        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .ok_or_else(|| Error::execution("malformed report: idb_id"))?;
        let workers = batch
            .column(1)
            .as_any()
            .downcast_ref::<Int32Array>()
            .ok_or_else(|| Error::execution("malformed report: worker_id"))?;
        let counts = batch
            .column(2)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| Error::execution("malformed report: num_new_tuples"))?;
        for i in 0..batch.num_rows() {
            self.reports
                .entry((ids.value(i), workers.value(i)))
                .or_default()
                .push_back(counts.value(i));
        }
        Ok(())
    }

    fn expected(&self) -> Vec<(i32, WorkerId)> {
        self.participants
            .iter()
            .filter(|(_, w)| !(self.ft_mode == FtMode::Abandon && self.missing.contains(*w)))
            .copied()
            .collect()
    }

    /// Pops one complete round if every expected participant has reported.
    fn take_round(&mut self) -> Option<i64> {
        let expected = self.expected();
        if expected.is_empty()
            || !expected
                .iter()
                .all(|k| self.reports.get(k).is_some_and(|q| !q.is_empty()))
        {
            return None;
        }
        let mut total = 0;
        for k in &expected {
            if let Some(n) = self.reports.get_mut(k).and_then(VecDeque::pop_front) {
                total += n;
            }
        }
        Some(total)
    }

    fn shut_down_loop(&mut self, signal: bool) -> Result<()> {
        let targets: Vec<(WorkerId, ChannelId)> = self
            .outputs
            .iter()
            .flat_map(|e| e.destinations.iter().map(move |d| (*d, e.channel)))
            .collect();
        let local_id = self.local_id;
        let outbox = self.outbox()?;
        for (dest, channel) in targets {
            if signal {
                outbox.enqueue(dest, channel, StreamMessage::Batch(report_batch(-1, local_id, 0)?))?;
            }
            outbox.enqueue(dest, channel, StreamMessage::Eos)?;
        }
        self.finished = true;
        Ok(())
    }
}

impl Operator for EosController {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.child.open(ctx)?;
        self.local_id = ctx.worker_id;
        self.ft_mode = ctx.options.ft_mode;
        self.missing = ctx.missing.clone();
        self.outbox = Some(Outbox::new(ctx));
        Ok(())
    }

    fn next_ready(&mut self) -> Result<Ready> {
        if !self.outbox()?.flush()? {
            return Ok(Ready::NotReady);
        }
        if self.finished {
            return Ok(Ready::EndOfStream);
        }
        let ready = self.child.next_ready()?;
        match &ready {
            Ready::Batch(b) => self.record(b)?,
            Ready::EndOfStream => {
                debug!(rounds = self.rounds, "every iterative unit ended on its own");
                self.shut_down_loop(false)?;
                return self.next_ready();
            }
            Ready::EndOfIteration | Ready::NotReady => {}
        }
        while let Some(total) = self.take_round() {
            self.rounds += 1;
            if total == 0 {
                info!(rounds = self.rounds, "recursion reached a fixpoint");
                self.shut_down_loop(true)?;
                return self.next_ready();
            }
        }
        match ready {
            Ready::Batch(b) => Ok(Ready::Batch(b)),
            _ => Ok(Ready::NotReady),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn name(&self) -> &'static str {
        "EosController"
    }
}
