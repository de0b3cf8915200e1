use std::sync::Arc;

use tessel_common::{ChannelId, Error, FtMode, Result, Schema, WorkerId};
use tracing::debug;

use super::{ChannelRegistry, InputBuffer, MissingWorkers, Polled};
use crate::fabric::Fabric;
use crate::operator::{ExecContext, Operator, Ready};

struct Attached {
    buffer: Arc<InputBuffer>,
    registry: Arc<ChannelRegistry>,
    fabric: Arc<dyn Fabric>,
    missing: Arc<MissingWorkers>,
    ft_mode: FtMode,
    local_id: WorkerId,
    seen_version: u64,
}

/// Leaf operator reading one exchange channel.
pub struct Consumer {
    channel: ChannelId,
    sources: Vec<WorkerId>,
    schema: Schema,
    attached: Option<Attached>,
}

impl Consumer {
    pub fn new(channel: ChannelId, sources: Vec<WorkerId>, schema: Schema) -> Self {
        Self {
            channel,
            sources,
            schema,
            attached: None,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

impl Attached {
    fn sync_missing(&mut self) {
        let version = self.missing.version();
        if version == self.seen_version {
            return;
        }
        self.seen_version = version;
        if self.ft_mode == FtMode::Abandon {
            for w in self.missing.snapshot() {
                self.buffer.disable_source(w);
            }
        }
    }

    fn check_sources(&self, waiting_on: &[WorkerId]) -> Result<()> {
        if self.ft_mode != FtMode::None {
            return Ok(());
        }
        for w in waiting_on {
            if *w != self.local_id && !self.fabric.is_remote_alive(*w) {
                return Err(Error::transport(format!(
                    "source worker {w} of channel {} is gone",
                    self.buffer.channel()
                )));
            }
        }
        Ok(())
    }
}

impl Operator for Consumer {
    fn open(&mut self, ctx: &mut ExecContext) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::execution(format!("consumer of {} has no sources", self.channel)));
        }
        let buffer = Arc::new(InputBuffer::new(
            ctx.query_id,
            self.channel,
            self.schema.clone(),
            &self.sources,
            ctx.buffers,
            ctx.fabric.clone(),
            ctx.waker.clone(),
        ));
        ctx.registry.register(buffer.clone())?;
        self.attached = Some(Attached {
            buffer,
            registry: ctx.registry.clone(),
            fabric: ctx.fabric.clone(),
            missing: ctx.missing.clone(),
            ft_mode: ctx.options.ft_mode,
            local_id: ctx.worker_id,
            seen_version: 0,
        });
        Ok(())
    }

    fn next_ready(&mut self) -> Result<Ready> {
        let attached = self
            .attached
            .as_mut()
            .ok_or_else(|| Error::execution("consumer used before open"))?;
        attached.sync_missing();
        match attached.buffer.poll()? {
            Polled::Batch(b) => Ok(Ready::Batch(b)),
            Polled::EndOfIteration => Ok(Ready::EndOfIteration),
            Polled::EndOfStream => Ok(Ready::EndOfStream),
            Polled::NotReady { waiting_on } => {
                attached.check_sources(&waiting_on)?;
                Ok(Ready::NotReady)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(attached) = self.attached.take() {
            attached
                .registry
                .deregister(attached.buffer.query_id(), self.channel);
            attached.buffer.close();
            debug!(query_id = attached.buffer.query_id(), channel = %self.channel, "consumer closed");
        }
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn name(&self) -> &'static str {
        "Consumer"
    }
}
