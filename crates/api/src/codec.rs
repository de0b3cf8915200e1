//! Tuple batch framing for exchange channels.
//!
//! A batch travels as a single-batch Arrow IPC stream inside a
//! [`DataMessage`]; end-of-stream and end-of-iteration markers carry no body.

use std::io::Cursor;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use tessel_common::{ChannelId, Error, QueryId, Result, Schema, TupleBatch};

use crate::proto::{DataKind, DataMessage};

/// Decoded view of a [`DataMessage`].
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Batch(TupleBatch),
    Eoi,
    Eos,
}

pub fn encode_batch(batch: &TupleBatch) -> Result<Vec<u8>> {
    let rb = batch.record_batch();
    let mut buf = Vec::new();
    {
        let mut writer = StreamWriter::try_new(&mut buf, rb.schema_ref())?;
        writer.write(rb)?;
        writer.finish()?;
    }
    Ok(buf)
}

pub fn decode_batch(schema: &Schema, bytes: &[u8]) -> Result<TupleBatch> {
    let mut reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let rb = match reader.next() {
        Some(rb) => rb?,
        None => return Err(Error::transport("data frame without a batch")),
    };
    if reader.next().is_some() {
        return Err(Error::transport("data frame with more than one batch"));
    }
    TupleBatch::from_record_batch(schema.clone(), rb)
}

impl StreamMessage {
    pub fn into_data(self, query_id: QueryId, channel: ChannelId) -> Result<DataMessage> {
        let (kind, num_tuples, payload) = match self {
            StreamMessage::Batch(batch) => {
                (DataKind::Normal, batch.num_rows() as i32, encode_batch(&batch)?)
            }
            StreamMessage::Eoi => (DataKind::Eoi, 0, Vec::new()),
            StreamMessage::Eos => (DataKind::Eos, 0, Vec::new()),
        };
        Ok(DataMessage {
            query_id,
            channel_id: channel.value(),
            kind: kind as i32,
            num_tuples,
            payload,
        })
    }

    pub fn from_data(schema: &Schema, msg: &DataMessage) -> Result<Self> {
        match msg.data_kind() {
            Some(DataKind::Normal) => {
                let batch = decode_batch(schema, &msg.payload)?;
                if batch.num_rows() as i32 != msg.num_tuples {
                    return Err(Error::transport(format!(
                        "frame announces {} tuples but carries {}",
                        msg.num_tuples,
                        batch.num_rows()
                    )));
                }
                Ok(StreamMessage::Batch(batch))
            }
            Some(DataKind::Eoi) => Ok(StreamMessage::Eoi),
            Some(DataKind::Eos) => Ok(StreamMessage::Eos),
            None => Err(Error::transport(format!("unknown data kind {}", msg.kind))),
        }
    }

    pub fn is_eos(&self) -> bool {
        matches!(self, StreamMessage::Eos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use std::sync::Arc;
    use tessel_common::Type;

    fn sample() -> TupleBatch {
        let schema = Schema::of(&[("id", Type::Long), ("name", Type::String)]);
        let cols: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(StringArray::from(vec!["a", "b", "c"])),
        ];
        TupleBatch::try_new(schema, cols).unwrap()
    }

    #[test]
    fn batch_frame_keeps_rows() {
        let batch = sample();
        let msg = StreamMessage::Batch(batch.clone())
            .into_data(9, ChannelId(4))
            .unwrap();
        assert_eq!(msg.num_tuples, 3);
        assert_eq!(msg.channel(), ChannelId(4));

        match StreamMessage::from_data(batch.schema(), &msg).unwrap() {
            StreamMessage::Batch(back) => {
                assert_eq!(back.record_batch(), batch.record_batch());
            }
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn markers_have_no_body() {
        let msg = StreamMessage::Eos.into_data(1, ChannelId(1)).unwrap();
        assert!(msg.payload.is_empty());
        let schema = Schema::empty();
        assert!(StreamMessage::from_data(&schema, &msg).unwrap().is_eos());
    }

    #[test]
    fn tuple_count_mismatch_is_a_transport_error() {
        let batch = sample();
        let mut msg = StreamMessage::Batch(batch.clone())
            .into_data(1, ChannelId(2))
            .unwrap();
        msg.num_tuples = 5;
        let err = StreamMessage::from_data(batch.schema(), &msg).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
