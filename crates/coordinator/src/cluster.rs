use chrono::Utc;
use dashmap::DashMap;
use tessel_common::WorkerId;

#[derive(Debug, Clone)]
pub struct WorkerState {
    pub address: String,
    pub last_seen: i64,
}

/// Membership as seen by the coordinator, keyed by worker id.
#[derive(Debug, Default)]
pub struct ClusterState {
    workers: DashMap<WorkerId, WorkerState>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`, replacing a previous entry with the same id.
    pub fn register(&self, id: WorkerId, address: &str) {
        self.workers.insert(
            id,
            WorkerState {
                address: address.to_string(),
                last_seen: Utc::now().timestamp(),
            },
        );
    }

    /// Records a heartbeat. Returns false for workers that are not members.
    pub fn touch(&self, id: WorkerId) -> bool {
        match self.workers.get_mut(&id) {
            Some(mut worker) => {
                worker.last_seen = Utc::now().timestamp();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: WorkerId) -> Option<WorkerState> {
        self.workers.remove(&id).map(|(_, state)| state)
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.contains_key(&id)
    }

    pub fn get(&self, id: WorkerId) -> Option<WorkerState> {
        self.workers.get(&id).map(|w| w.value().clone())
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<_> = self.workers.iter().map(|w| *w.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Workers not heard from for more than `timeout_secs`.
    pub fn stale(&self, timeout_secs: i64) -> Vec<WorkerId> {
        let now = Utc::now().timestamp();
        self.workers
            .iter()
            .filter(|w| now - w.last_seen > timeout_secs)
            .map(|w| *w.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, id: WorkerId, secs: i64) {
        if let Some(mut worker) = self.workers.get_mut(&id) {
            worker.last_seen -= secs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeats_only_refresh_members() {
        let cluster = ClusterState::new();
        cluster.register(1, "127.0.0.1:9001");
        assert!(cluster.touch(1));
        assert!(!cluster.touch(7));
        assert_eq!(cluster.ids(), vec![1]);
    }

    #[test]
    fn silent_workers_go_stale() {
        let cluster = ClusterState::new();
        cluster.register(1, "a");
        cluster.register(2, "b");
        cluster.backdate(2, 60);
        assert_eq!(cluster.stale(30), vec![2]);
        cluster.touch(2);
        assert!(cluster.stale(30).is_empty());
    }
}
