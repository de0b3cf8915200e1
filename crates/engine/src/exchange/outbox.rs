use std::collections::VecDeque;
use std::sync::Arc;

use tessel_api::proto::transport_envelope::Payload;
use tessel_api::{DataMessage, StreamMessage, TransportEnvelope};
use tessel_common::{ChannelId, Error, FtMode, QueryId, Result, WorkerId};
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::MissingWorkers;
use crate::fabric::{Fabric, LinkState};
use crate::operator::ExecContext;

/// Ordered queue of outgoing frames shared by everything that sends data.
///
/// Frames leave strictly in queue order; the first frame whose link is not
/// writable stops the flush. What happens at a closed link depends on the
/// query's fault-tolerance mode.
pub(crate) struct Outbox {
    query_id: QueryId,
    local_id: WorkerId,
    ft_mode: FtMode,
    fabric: Arc<dyn Fabric>,
    missing: Arc<MissingWorkers>,
    waker: Arc<Notify>,
    pending: VecDeque<(WorkerId, DataMessage)>,
}

impl Outbox {
    pub(crate) fn new(ctx: &ExecContext) -> Self {
        Self {
            query_id: ctx.query_id,
            local_id: ctx.worker_id,
            ft_mode: ctx.options.ft_mode,
            fabric: ctx.fabric.clone(),
            missing: ctx.missing.clone(),
            waker: ctx.waker.clone(),
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn enqueue(
        &mut self,
        dest: WorkerId,
        channel: ChannelId,
        message: StreamMessage,
    ) -> Result<()> {
        let frame = message.into_data(self.query_id, channel)?;
        self.pending.push_back((dest, frame));
        Ok(())
    }

    fn abandoned(&self, dest: WorkerId) -> bool {
        self.ft_mode == FtMode::Abandon && self.missing.contains(dest)
    }

    /// Sends as much as the links allow. `Ok(true)` once the queue is empty.
    pub(crate) fn flush(&mut self) -> Result<bool> {
        while let Some((dest, _)) = self.pending.front() {
            let dest = *dest;
            if self.abandoned(dest) {
                trace!(query_id = self.query_id, dest, "dropping frame for abandoned worker");
                self.pending.pop_front();
                continue;
            }
            match self.fabric.link_state(dest) {
                LinkState::Writable => {
                    let Some((dest, frame)) = self.pending.pop_front() else {
                        break;
                    };
                    let envelope = TransportEnvelope::data(self.local_id, frame);
                    if let Err(e) = self.fabric.send(dest, envelope) {
                        if let Some(Payload::Data(frame)) = e.envelope.payload {
                            self.pending.push_front((dest, frame));
                        }
                        return self.closed_link(dest, &e.reason);
                    }
                }
                LinkState::Congested => {
                    self.fabric.watch_writable(dest, self.waker.clone());
                    return Ok(false);
                }
                LinkState::Closed => return self.closed_link(dest, "link is closed"),
            }
        }
        Ok(true)
    }

    fn closed_link(&mut self, dest: WorkerId, reason: &str) -> Result<bool> {
        match self.ft_mode {
            FtMode::None => Err(Error::transport(format!(
                "worker {dest} is unreachable from worker {}: {reason}",
                self.local_id
            ))),
            FtMode::Abandon | FtMode::Rejoin => {
                debug!(query_id = self.query_id, dest, ft_mode = %self.ft_mode, "waiting on closed link");
                self.fabric.watch_writable(dest, self.waker.clone());
                Ok(false)
            }
        }
    }
}
