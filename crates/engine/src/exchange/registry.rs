use std::sync::Arc;

use dashmap::DashMap;
use tessel_api::{DataMessage, StreamMessage};
use tessel_common::{ChannelId, Error, QueryId, Result, WorkerId};
use tracing::trace;

use super::InputBuffer;

/// Process-wide map from `(query, channel)` to the buffer that consumes it.
#[derive(Default)]
pub struct ChannelRegistry {
    buffers: DashMap<(QueryId, ChannelId), Arc<InputBuffer>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, buffer: Arc<InputBuffer>) -> Result<()> {
        let key = (buffer.query_id(), buffer.channel());
        if self.buffers.contains_key(&key) {
            return Err(Error::execution(format!(
                "channel {} of query {} is consumed twice on this worker",
                key.1, key.0
            )));
        }
        self.buffers.insert(key, buffer);
        Ok(())
    }

    pub fn deregister(&self, query_id: QueryId, channel: ChannelId) -> Option<Arc<InputBuffer>> {
        self.buffers.remove(&(query_id, channel)).map(|(_, b)| b)
    }

    pub fn get(&self, query_id: QueryId, channel: ChannelId) -> Option<Arc<InputBuffer>> {
        self.buffers.get(&(query_id, channel)).map(|b| b.value().clone())
    }

    /// Hands an inbound data frame to the buffer of its channel.
    pub fn route(&self, from: WorkerId, message: DataMessage) {
        let Some(buffer) = self.get(message.query_id, message.channel()) else {
            trace!(
                query_id = message.query_id,
                channel = %message.channel(),
                from,
                "dropping frame for a channel with no consumer"
            );
            return;
        };
        match StreamMessage::from_data(buffer.schema(), &message) {
            Ok(m) => buffer.push(from, m),
            Err(e) => buffer.fail(format!("undecodable frame from worker {from}: {e}")),
        }
    }

    pub fn buffers_of(&self, query_id: QueryId) -> Vec<Arc<InputBuffer>> {
        self.buffers
            .iter()
            .filter(|e| e.key().0 == query_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Closes and forgets every buffer of `query_id`.
    pub fn remove_query(&self, query_id: QueryId) {
        for buffer in self.buffers_of(query_id) {
            self.buffers.remove(&(query_id, buffer.channel()));
            buffer.close();
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
