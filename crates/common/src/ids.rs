use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Identity of a process in the cluster. `COORDINATOR_ID` is reserved.
pub type WorkerId = i32;

pub type QueryId = i64;

pub const COORDINATOR_ID: WorkerId = 0;

static NEXT_CHANNEL_ID: AtomicI64 = AtomicI64::new(1);

/// Addressing key of one producer-to-consumer edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub i64);

impl ChannelId {
    /// Mints an id that is unique within this process.
    pub fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn minted_ids_are_unique() {
        let ids: HashSet<ChannelId> = (0..1000).map(|_| ChannelId::next()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
