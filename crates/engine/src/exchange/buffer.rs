use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tessel_api::StreamMessage;
use tessel_common::{ChannelId, Error, QueryId, Result, Schema, TupleBatch, WorkerId};
use tokio::sync::Notify;
use tracing::{trace, warn};

use super::BufferSettings;
use crate::fabric::Fabric;

/// Result of polling an [`InputBuffer`].
#[derive(Debug)]
pub enum Polled {
    Batch(TupleBatch),
    /// Nothing buffered. Lists the live sources that have sent nothing yet.
    NotReady { waiting_on: Vec<WorkerId> },
    EndOfIteration,
    EndOfStream,
}

enum Item {
    Batch(TupleBatch),
    Eoi,
    Eos,
}

#[derive(Default)]
struct Source {
    items: VecDeque<Item>,
    finished: bool,
    disabled: bool,
}

impl Source {
    fn is_live(&self) -> bool {
        !self.finished && !self.disabled
    }

    fn parked_at_eoi(&self) -> bool {
        matches!(self.items.front(), Some(Item::Eoi))
    }
}

#[derive(Default)]
struct State {
    sources: BTreeMap<WorkerId, Source>,
    buffered: usize,
    paused: BTreeSet<WorkerId>,
    cursor: usize,
    failure: Option<String>,
    closed: bool,
}

/// Receiving end of one exchange channel on one worker.
///
/// Messages are kept per source so each source's order is preserved. A
/// source that has sent end-of-iteration is parked until every live source
/// has done the same; the buffer then reports one end-of-iteration for the
/// round. Once `capacity` batches are buffered the sending peers are paused
/// at the fabric until the buffer drains to `recover_trigger`.
pub struct InputBuffer {
    query_id: QueryId,
    channel: ChannelId,
    schema: Schema,
    settings: BufferSettings,
    fabric: Arc<dyn Fabric>,
    waker: Arc<Notify>,
    state: Mutex<State>,
}

impl InputBuffer {
    pub fn new(
        query_id: QueryId,
        channel: ChannelId,
        schema: Schema,
        sources: &[WorkerId],
        settings: BufferSettings,
        fabric: Arc<dyn Fabric>,
        waker: Arc<Notify>,
    ) -> Self {
        let state = State {
            sources: sources.iter().map(|w| (*w, Source::default())).collect(),
            ..State::default()
        };
        Self {
            query_id,
            channel,
            schema,
            settings,
            fabric,
            waker,
            state: Mutex::new(state),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, from: WorkerId, message: StreamMessage) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let Some(source) = state.sources.get_mut(&from) else {
            warn!(query_id = self.query_id, channel = %self.channel, from, "message from unexpected source");
            return;
        };
        if source.disabled || source.finished {
            trace!(query_id = self.query_id, channel = %self.channel, from, "dropping message from closed source");
            return;
        }
        let is_batch = matches!(message, StreamMessage::Batch(_));
        source.items.push_back(match message {
            StreamMessage::Batch(b) => Item::Batch(b),
            StreamMessage::Eoi => Item::Eoi,
            StreamMessage::Eos => Item::Eos,
        });
        if is_batch {
            state.buffered += 1;
            if state.buffered >= self.settings.capacity && state.paused.insert(from) {
                trace!(query_id = self.query_id, channel = %self.channel, from, "input buffer full, pausing source");
                self.fabric.pause_reading(from);
            }
        }
        drop(state);
        self.waker.notify_one();
    }

    /// Marks the buffer broken; the next poll returns the error.
    pub fn fail(&self, reason: String) {
        self.lock().failure = Some(reason);
        self.waker.notify_one();
    }

    pub fn poll(&self) -> Result<Polled> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(reason) = &state.failure {
            return Err(Error::transport(format!("channel {}: {reason}", self.channel)));
        }
        let ids: Vec<WorkerId> = state.sources.keys().copied().collect();
        let n = ids.len();
        for k in 0..n {
            let idx = (state.cursor + k) % n;
            let Some(source) = state.sources.get_mut(&ids[idx]) else {
                continue;
            };
            if !source.is_live() {
                continue;
            }
            while let Some(Item::Eos) = source.items.front() {
                source.items.pop_front();
                source.finished = true;
            }
            if source.finished {
                continue;
            }
            if let Some(Item::Batch(_)) = source.items.front() {
                if let Some(Item::Batch(batch)) = source.items.pop_front() {
                    state.buffered -= 1;
                    state.cursor = idx + 1;
                    self.maybe_resume(state);
                    return Ok(Polled::Batch(batch));
                }
            }
        }

        let live: Vec<WorkerId> = state
            .sources
            .iter()
            .filter(|(_, s)| s.is_live())
            .map(|(w, _)| *w)
            .collect();
        if live.is_empty() {
            return Ok(Polled::EndOfStream);
        }
        if live
            .iter()
            .all(|w| state.sources.get(w).is_some_and(Source::parked_at_eoi))
        {
            for w in &live {
                if let Some(source) = state.sources.get_mut(w) {
                    source.items.pop_front();
                }
            }
            return Ok(Polled::EndOfIteration);
        }
        let waiting_on = live
            .into_iter()
            .filter(|w| state.sources.get(w).is_some_and(|s| s.items.is_empty()))
            .collect();
        Ok(Polled::NotReady { waiting_on })
    }

    fn maybe_resume(&self, state: &mut State) {
        if state.buffered <= self.settings.recover_trigger && !state.paused.is_empty() {
            for w in std::mem::take(&mut state.paused) {
                self.fabric.resume_reading(w);
            }
        }
    }

    /// Stops expecting anything from `worker`; what it already sent is dropped.
    pub fn disable_source(&self, worker: WorkerId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let dropped = match state.sources.get_mut(&worker) {
            Some(source) if !source.disabled => {
                source.disabled = true;
                let dropped = source
                    .items
                    .drain(..)
                    .filter(|i| matches!(i, Item::Batch(_)))
                    .count();
                Some(dropped)
            }
            _ => None,
        };
        let Some(dropped) = dropped else {
            return;
        };
        state.buffered -= dropped;
        if state.paused.remove(&worker) {
            self.fabric.resume_reading(worker);
        }
        self.maybe_resume(state);
        drop(guard);
        self.waker.notify_one();
    }

    pub fn buffered(&self) -> usize {
        self.lock().buffered
    }

    /// Drops everything and releases paused sources.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.buffered = 0;
        for source in state.sources.values_mut() {
            source.items.clear();
        }
        for w in std::mem::take(&mut state.paused) {
            self.fabric.resume_reading(w);
        }
    }
}
