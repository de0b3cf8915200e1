use ahash::RandomState;
use arrow::row::{RowConverter, SortField};
use tessel_api::StreamMessage;
use tessel_common::{Error, Result, Schema, TupleBatch};

use super::Outbox;
use crate::operator::{ExecContext, Operator, Ready};
use crate::plan::{ExchangeEdge, Partitioning};

/// Every worker must send a given key to the same destination.
const PARTITION_SEEDS: (u64, u64, u64, u64) = (0x7465_7373, 0x656c_0001, 0x9e37_79b9, 0x85eb_ca6b);

fn partition_hasher() -> RandomState {
    let (k0, k1, k2, k3) = PARTITION_SEEDS;
    RandomState::with_seeds(k0, k1, k2, k3)
}

/// Root operator that ships its child's output to other workers.
pub struct Producer {
    child: Box<dyn Operator>,
    partitioning: Partitioning,
    outputs: Vec<ExchangeEdge>,
    hasher: Option<RowConverter>,
    outbox: Option<Outbox>,
    finished: bool,
}

impl Producer {
    pub fn new(child: Box<dyn Operator>, partitioning: Partitioning, outputs: Vec<ExchangeEdge>) -> Self {
        Self {
            child,
            partitioning,
            outputs,
            hasher: None,
            outbox: None,
            finished: false,
        }
    }

    fn outbox(&mut self) -> Result<&mut Outbox> {
        self.outbox
            .as_mut()
            .ok_or_else(|| Error::execution("producer used before open"))
    }

    fn broadcast(&mut self, message: StreamMessage) -> Result<()> {
        let targets: Vec<_> = self
            .outputs
            .iter()
            .flat_map(|e| e.destinations.iter().map(move |d| (*d, e.channel)))
            .collect();
        let outbox = self.outbox()?;
        for (dest, channel) in targets {
            outbox.enqueue(dest, channel, message.clone())?;
        }
        Ok(())
    }

    fn route(&mut self, batch: &TupleBatch) -> Result<()> {
        let keys = match &self.partitioning {
            Partitioning::Collect | Partitioning::Broadcast => {
                return self.broadcast(StreamMessage::Batch(batch.clone()));
            }
            Partitioning::Hash { keys } => keys.clone(),
        };
        let converter = self
            .hasher
            .as_mut()
            .ok_or_else(|| Error::execution("hash producer used before open"))?;
        let columns: Vec<_> = keys.iter().map(|k| batch.column(*k).clone()).collect();
        let rows = converter.convert_columns(&columns)?;
        let state = partition_hasher();
        let hashes: Vec<u64> = rows.iter().map(|row| state.hash_one(row.as_ref())).collect();

        let mut sends = Vec::new();
        for edge in &self.outputs {
            let n = edge.destinations.len() as u64;
            let mut parts: Vec<Vec<u32>> = vec![Vec::new(); edge.destinations.len()];
            for (row, hash) in hashes.iter().enumerate() {
                parts[(hash % n) as usize].push(row as u32);
            }
            for (dest, rows) in edge.destinations.iter().zip(parts) {
                if !rows.is_empty() {
                    sends.push((*dest, edge.channel, batch.take(&rows)?));
                }
            }
        }
        let outbox = self.outbox()?;
        for (dest, channel, part) in sends {
            outbox.enqueue(dest, channel, StreamMessage::Batch(part))?;
        }
        Ok(())
    }
}

impl Operator for Producer {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        self.child.open(ctx)?;
        if self.outputs.iter().any(|e| e.destinations.is_empty()) {
            return Err(Error::execution("producer edge without destinations"));
        }
        if let Partitioning::Hash { keys } = &self.partitioning {
            let schema = self.child.schema();
            let fields = keys
                .iter()
                .map(|k| {
                    schema
                        .column_type(*k)
                        .map(|t| SortField::new(t.to_arrow()))
                        .ok_or_else(|| Error::execution(format!("hash key {k} out of range")))
                })
                .collect::<Result<Vec<_>>>()?;
            self.hasher = Some(RowConverter::new(fields)?);
        }
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
        match self.child.next_ready()? {
            Ready::Batch(batch) => {
                self.route(&batch)?;
                self.outbox()?.flush()?;
                Ok(Ready::Batch(batch))
            }
            Ready::EndOfIteration => {
                self.broadcast(StreamMessage::Eoi)?;
                self.outbox()?.flush()?;
                Ok(Ready::EndOfIteration)
            }
            Ready::EndOfStream => {
                self.broadcast(StreamMessage::Eos)?;
                self.finished = true;
                if self.outbox()?.flush()? {
                    Ok(Ready::EndOfStream)
                } else {
                    Ok(Ready::NotReady)
                }
            }
            Ready::NotReady => Ok(Ready::NotReady),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.child.close()
    }

    fn schema(&self) -> &Schema {
        self.child.schema()
    }

    fn name(&self) -> &'static str {
        match self.partitioning {
            Partitioning::Collect => "CollectProducer",
            Partitioning::Broadcast => "BroadcastProducer",
            Partitioning::Hash { .. } => "ShuffleProducer",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Int32Array};
    use arrow::datatypes::DataType;

    use super::*;

    fn key_hashes(keys: &ArrayRef) -> Vec<u64> {
        let converter = RowConverter::new(vec![SortField::new(DataType::Int32)]).unwrap();
        let rows = converter.convert_columns(&[keys.clone()]).unwrap();
        let state = partition_hasher();
        rows.iter().map(|row| state.hash_one(row.as_ref())).collect()
    }

    #[test]
    fn key_hashes_depend_only_on_the_key() {
        let keys: ArrayRef = Arc::new(Int32Array::from(vec![7, 11, 7, 42]));
        let first = key_hashes(&keys);
        let second = key_hashes(&keys);
        assert_eq!(first, second);
        assert_eq!(first[0], first[2]);
        assert_ne!(first[0], first[1]);
    }
}
