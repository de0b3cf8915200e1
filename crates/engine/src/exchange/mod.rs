//! Exchange layer: the operators and buffers that cross process boundaries.

mod buffer;
mod consumer;
mod outbox;
mod producer;
mod registry;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::Deserialize;
use tessel_common::WorkerId;

pub use buffer::{InputBuffer, Polled};
pub use consumer::Consumer;
pub(crate) use outbox::Outbox;
pub use producer::Producer;
pub use registry::ChannelRegistry;

/// Capacity of a consumer's input buffer, in batches.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BufferSettings {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Reading resumes once a full buffer drains to this many batches.
    #[serde(default = "default_recover_trigger")]
    pub recover_trigger: usize,
}

fn default_capacity() -> usize {
    100
}

fn default_recover_trigger() -> usize {
    80
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            recover_trigger: default_recover_trigger(),
        }
    }
}

/// Workers a query partition has been told are gone.
///
/// The version bumps on every change so operators can cheaply notice.
#[derive(Debug, Default)]
pub struct MissingWorkers {
    workers: RwLock<BTreeSet<WorkerId>>,
    version: AtomicU64,
}

impl MissingWorkers {
    pub fn insert(&self, worker: WorkerId) -> bool {
        let added = self
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker);
        if added {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        added
    }

    pub fn remove(&self, worker: WorkerId) -> bool {
        let removed = self
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&worker);
        if removed {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn contains(&self, worker: WorkerId) -> bool {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&worker)
    }

    pub fn snapshot(&self) -> BTreeSet<WorkerId> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
