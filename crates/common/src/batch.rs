use arrow::array::{ArrayRef, BooleanArray, UInt32Array};
use arrow::compute::{filter_record_batch, take_record_batch};
use arrow::record_batch::RecordBatch;

use crate::error::{Error, Result};
use crate::schema::Schema;

/// Maximum number of rows a single batch may hold.
pub const BATCH_CAPACITY: usize = 10 * 1024;

/// Immutable, column-oriented unit of data moved between operators.
///
/// A batch is bound to exactly one [`Schema`] and never holds more than
/// [`BATCH_CAPACITY`] rows.
#[derive(Debug, Clone)]
pub struct TupleBatch {
    schema: Schema,
    batch: RecordBatch,
}

impl TupleBatch {
    pub fn try_new(schema: Schema, columns: Vec<ArrayRef>) -> Result<Self> {
        let batch = RecordBatch::try_new(schema.to_arrow(), columns)?;
        Self::from_record_batch(schema, batch)
    }

    /// Wraps an Arrow batch after checking it matches `schema`.
    pub fn from_record_batch(schema: Schema, batch: RecordBatch) -> Result<Self> {
        let actual = Schema::from_arrow(batch.schema().as_ref())?;
        if actual != schema {
            return Err(Error::execution(format!(
                "batch schema {actual} does not match expected {schema}"
            )));
        }
        if batch.num_rows() > BATCH_CAPACITY {
            return Err(Error::execution(format!(
                "batch of {} rows exceeds capacity {}",
                batch.num_rows(),
                BATCH_CAPACITY
            )));
        }
        Ok(Self { schema, batch })
    }

    pub fn empty(schema: Schema) -> Self {
        let batch = RecordBatch::new_empty(schema.to_arrow());
        Self { schema, batch }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn column(&self, idx: usize) -> &ArrayRef {
        self.batch.column(idx)
    }

    pub fn columns(&self) -> &[ArrayRef] {
        self.batch.columns()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_record_batch(self) -> RecordBatch {
        self.batch
    }

    /// Keeps rows whose mask entry is true.
    pub fn filter(&self, mask: &BooleanArray) -> Result<TupleBatch> {
        let batch = filter_record_batch(&self.batch, mask)?;
        Ok(Self {
            schema: self.schema.clone(),
            batch,
        })
    }

    /// Gathers the given rows, in order.
    pub fn take(&self, rows: &[u32]) -> Result<TupleBatch> {
        let indices = UInt32Array::from(rows.to_vec());
        let batch = take_record_batch(&self.batch, &indices)?;
        Ok(Self {
            schema: self.schema.clone(),
            batch,
        })
    }

    pub fn project(&self, indices: &[usize]) -> Result<TupleBatch> {
        let schema = self.schema.project(indices)?;
        let batch = self.batch.project(indices)?;
        Ok(Self { schema, batch })
    }

    /// Re-labels the batch with a structurally compatible schema (same types).
    pub fn with_schema(self, schema: Schema) -> Result<TupleBatch> {
        let columns = self.batch.columns().to_vec();
        TupleBatch::try_new(schema, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Type;
    use arrow::array::{Int32Array, StringArray};
    use std::sync::Arc;

    fn people() -> TupleBatch {
        let schema = Schema::of(&[("id", Type::Int), ("name", Type::String)]);
        TupleBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec!["Alice", "Bob", "Charlie"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn rejects_mismatched_columns() {
        let schema = Schema::of(&[("id", Type::Long)]);
        let result = TupleBatch::try_new(schema, vec![Arc::new(Int32Array::from(vec![1]))]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_oversized_batches() {
        let schema = Schema::of(&[("id", Type::Int)]);
        let values: Vec<i32> = (0..(BATCH_CAPACITY as i32 + 1)).collect();
        let result = TupleBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]);
        assert!(result.is_err());
    }

    #[test]
    fn take_and_filter_keep_schema() {
        let batch = people();
        let taken = batch.take(&[2, 0]).unwrap();
        assert_eq!(taken.num_rows(), 2);
        assert_eq!(taken.schema(), batch.schema());
        let ids = taken.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(ids.values(), &[3, 1]);

        let mask = BooleanArray::from(vec![false, true, false]);
        let filtered = batch.filter(&mask).unwrap();
        assert_eq!(filtered.num_rows(), 1);
    }

    #[test]
    fn project_drops_columns() {
        let projected = people().project(&[1]).unwrap();
        assert_eq!(projected.schema(), &Schema::of(&[("name", Type::String)]));
    }
}
