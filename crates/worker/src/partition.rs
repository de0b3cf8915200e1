//! The part of one query that runs on this worker.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tessel_api::{ExecutionStats, OperatorProfile};
use tessel_common::{Error, ExecutionOptions, FtMode, QueryId, Result, WorkerId};
use tessel_engine::{instantiate, ExecContext, MissingWorkers, PlanFragment};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use crate::scheduler::{Fragment, FragmentStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    /// Sub-plan accepted, operators not yet built.
    Received,
    /// Every fragment is open; waiting for the start signal.
    Ready,
    Running,
    Succeeded,
    Failed,
}

impl PartitionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PartitionState::Succeeded | PartitionState::Failed)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Received => "received",
            PartitionState::Ready => "ready",
            PartitionState::Running => "running",
            PartitionState::Succeeded => "succeeded",
            PartitionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How a partition ended.
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub state: PartitionState,
    pub cause: Option<String>,
    pub stats: ExecutionStats,
}

struct Inner {
    state: PartitionState,
    fragments: Vec<Fragment>,
    wakers: Vec<Arc<Notify>>,
    started_at: Option<i64>,
}

pub struct QueryPartition {
    query_id: QueryId,
    options: ExecutionOptions,
    missing: Arc<MissingWorkers>,
    inner: Mutex<Inner>,
    cancel: watch::Sender<Option<String>>,
    outcome: watch::Sender<Option<PartitionOutcome>>,
}

impl QueryPartition {
    pub fn new(query_id: QueryId, options: ExecutionOptions) -> Self {
        let (cancel, _) = watch::channel(None);
        let (outcome, _) = watch::channel(None);
        Self {
            query_id,
            options,
            missing: Arc::new(MissingWorkers::default()),
            inner: Mutex::new(Inner {
                state: PartitionState::Received,
                fragments: Vec::new(),
                wakers: Vec::new(),
                started_at: None,
            }),
            cancel,
            outcome,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn options(&self) -> ExecutionOptions {
        self.options
    }

    pub fn state(&self) -> PartitionState {
        self.lock().state
    }

    pub fn missing(&self) -> &Arc<MissingWorkers> {
        &self.missing
    }

    /// Builds and opens every fragment. Consumers register their input
    /// buffers here, so this must finish before the partition reports ready.
    /// On error the fragments opened so far are closed again.
    pub fn prepare(&self, fragments: &[PlanFragment], base: &ExecContext) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != PartitionState::Received {
            return Err(Error::execution(format!(
                "query {} cannot be prepared while {}",
                self.query_id, inner.state
            )));
        }
        let mut opened: Vec<Fragment> = Vec::with_capacity(fragments.len());
        for plan in fragments {
            let mut ctx = base.for_fragment(plan.index);
            let built = instantiate(&plan.root).and_then(|mut root| {
                root.open(&mut ctx)?;
                Ok(root)
            });
            match built {
                Ok(root) => opened.push(Fragment {
                    index: plan.index,
                    root,
                    ctx,
                }),
                Err(e) => {
                    close_all(&mut opened);
                    return Err(e);
                }
            }
        }
        inner.wakers = opened.iter().map(|f| f.ctx.waker.clone()).collect();
        inner.fragments = opened;
        inner.state = PartitionState::Ready;
        debug!(query_id = self.query_id, fragments = inner.fragments.len(), "partition ready");
        Ok(())
    }

    /// Moves to `Running` and hands out the opened fragments.
    pub fn begin(&self) -> Result<Vec<Fragment>> {
        let mut inner = self.lock();
        if inner.state != PartitionState::Ready {
            return Err(Error::execution(format!(
                "query {} cannot start while {}",
                self.query_id, inner.state
            )));
        }
        if let Some(cause) = self.cancel_cause() {
            return Err(Error::Cancelled(cause));
        }
        inner.state = PartitionState::Running;
        inner.started_at = Some(Utc::now().timestamp_millis());
        info!(query_id = self.query_id, "query partition running");
        Ok(std::mem::take(&mut inner.fragments))
    }

    /// Records the first cancellation cause and wakes every fragment.
    /// Returns false if the partition was already cancelled.
    pub fn cancel(&self, cause: &str) -> bool {
        let first = self.cancel.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause.to_string());
            true
        });
        if first {
            debug!(query_id = self.query_id, cause, "partition cancelled");
            self.wake_all();
        }
        first
    }

    pub fn cancel_cause(&self) -> Option<String> {
        self.cancel.borrow().clone()
    }

    pub fn cancel_signal(&self) -> watch::Receiver<Option<String>> {
        self.cancel.subscribe()
    }

    /// Closes fragments that never started. Returns whether there were any.
    pub fn close_unstarted(&self) -> bool {
        let mut inner = self.lock();
        let had = !inner.fragments.is_empty();
        close_all(&mut inner.fragments);
        had
    }

    pub fn wake_all(&self) {
        for waker in &self.lock().wakers {
            waker.notify_one();
        }
    }

    /// A worker left the cluster. Under `abandon` consumers stop waiting for
    /// it and producers drop its frames; under `rejoin` the worker is only
    /// recorded so it can be restored later.
    pub fn on_worker_removed(&self, worker: WorkerId) {
        match self.options.ft_mode {
            FtMode::Abandon | FtMode::Rejoin => {
                if self.missing.insert(worker) {
                    debug!(query_id = self.query_id, worker_id = worker, ft_mode = %self.options.ft_mode, "worker missing");
                }
            }
            FtMode::None => {}
        }
        self.wake_all();
    }

    pub fn on_worker_added(&self, worker: WorkerId) {
        if self.missing.remove(worker) {
            debug!(query_id = self.query_id, worker_id = worker, "missing worker is back");
        }
        self.wake_all();
    }

    /// Moves to a terminal state once. Later calls are ignored and return
    /// `None`.
    pub fn finish(&self, cause: Option<String>, fragments: &[FragmentStats]) -> Option<PartitionOutcome> {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return None;
        }
        inner.state = if cause.is_none() {
            PartitionState::Succeeded
        } else {
            PartitionState::Failed
        };
        let end = Utc::now().timestamp_millis();
        let stats = ExecutionStats {
            start_time_ms: inner.started_at.unwrap_or(end),
            end_time_ms: end,
            tuples_produced: fragments.iter().map(|f| f.tuples).sum(),
            batches_produced: fragments.iter().map(|f| f.batches).sum(),
            profiles: if self.options.profiling {
                fragments.iter().map(profile).collect()
            } else {
                Vec::new()
            },
        };
        info!(query_id = self.query_id, state = %inner.state, cause = cause.as_deref().unwrap_or(""), "query partition finished");
        Some(PartitionOutcome {
            state: inner.state,
            cause,
            stats,
        })
    }

    /// Publishes the outcome to everyone waiting on the partition.
    pub fn publish(&self, outcome: PartitionOutcome) {
        self.outcome.send_replace(Some(outcome));
    }

    pub async fn wait(&self) -> Option<PartitionOutcome> {
        let mut rx = self.outcome.subscribe();
        let outcome = rx.wait_for(Option::is_some).await.ok()?.clone();
        outcome
    }
}

fn profile(f: &FragmentStats) -> OperatorProfile {
    OperatorProfile {
        fragment_index: f.index as i32,
        root_name: f.root_name.to_string(),
        tuples: f.tuples,
        batches: f.batches,
        busy_micros: f.busy.as_micros() as i64,
    }
}

fn close_all(fragments: &mut Vec<Fragment>) {
    for mut fragment in fragments.drain(..) {
        if let Err(e) = fragment.root.close() {
            debug!(query_id = fragment.ctx.query_id, fragment = fragment.index, error = %e, "close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tessel_api::TransportEnvelope;
    use tessel_common::{ChannelId, RelationKey, Schema, Type};
    use tessel_engine::{
        BufferSettings, ChannelRegistry, Fabric, InboundHandler, LocalNetwork, MemoryStorage, PlanNode,
    };

    struct Nobody;

    impl InboundHandler for Nobody {
        fn deliver(&self, _from: WorkerId, _envelope: TransportEnvelope) {}
    }

    fn base(query_id: QueryId, registry: Arc<ChannelRegistry>, missing: Arc<MissingWorkers>) -> ExecContext {
        let fabric: Arc<dyn Fabric> = LocalNetwork::new().attach(1, Arc::new(Nobody));
        ExecContext {
            query_id,
            worker_id: 1,
            fragment: 0,
            options: ExecutionOptions::default(),
            fabric,
            registry,
            storage: Arc::new(MemoryStorage::new()),
            missing,
            buffers: BufferSettings::default(),
            waker: Arc::new(Notify::new()),
        }
    }

    fn consumer_fragment(index: usize) -> PlanFragment {
        PlanFragment {
            index,
            root: PlanNode::SinkRoot {
                child: Box::new(PlanNode::Consumer {
                    channel: ChannelId::next(),
                    sources: vec![2],
                    schema: Schema::of(&[("x", Type::Int)]),
                }),
            },
        }
    }

    #[test]
    fn prepare_registers_consumers_and_begin_hands_them_out() {
        let registry = Arc::new(ChannelRegistry::new());
        let partition = QueryPartition::new(5, ExecutionOptions::default());
        let ctx = base(5, registry.clone(), partition.missing().clone());
        partition
            .prepare(&[consumer_fragment(0), consumer_fragment(1)], &ctx)
            .unwrap();
        assert_eq!(partition.state(), PartitionState::Ready);
        assert_eq!(registry.len(), 2);

        let fragments = partition.begin().unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(partition.state(), PartitionState::Running);
        assert!(partition.begin().is_err());
    }

    #[test]
    fn failed_prepare_closes_what_was_opened() {
        let registry = Arc::new(ChannelRegistry::new());
        let partition = QueryPartition::new(6, ExecutionOptions::default());
        let ctx = base(6, registry.clone(), partition.missing().clone());
        let bad = PlanFragment {
            index: 1,
            root: PlanNode::Producer {
                child: Box::new(PlanNode::TableScan {
                    relation: RelationKey::new("public", "adhoc", "t"),
                    schema: Schema::of(&[("x", Type::Int)]),
                }),
                partitioning: tessel_engine::Partitioning::Collect,
                outputs: Vec::new(),
            },
        };
        let err = partition.prepare(&[consumer_fragment(0), bad], &ctx).unwrap_err();
        assert!(matches!(err, Error::Plan(_)));
        assert!(registry.is_empty());
        assert_eq!(partition.state(), PartitionState::Received);
    }

    #[tokio::test]
    async fn first_cancel_wins_and_terminal_state_is_sticky() {
        let partition = QueryPartition::new(7, ExecutionOptions::default());
        assert!(partition.cancel("killed by coordinator"));
        assert!(!partition.cancel("shutting down"));
        assert_eq!(partition.cancel_cause().as_deref(), Some("killed by coordinator"));

        let outcome = partition.finish(partition.cancel_cause(), &[]).unwrap();
        assert_eq!(outcome.state, PartitionState::Failed);
        assert!(partition.finish(None, &[]).is_none());

        partition.publish(outcome);
        let waited = tokio::time::timeout(Duration::from_secs(1), partition.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(waited.cause.as_deref(), Some("killed by coordinator"));
    }

    #[test]
    fn membership_changes_follow_the_fault_tolerance_mode() {
        let abandon = QueryPartition::new(
            8,
            ExecutionOptions {
                ft_mode: FtMode::Abandon,
                profiling: false,
            },
        );
        abandon.on_worker_removed(3);
        assert!(abandon.missing().contains(3));
        abandon.on_worker_added(3);
        assert!(!abandon.missing().contains(3));

        let none = QueryPartition::new(9, ExecutionOptions::default());
        none.on_worker_removed(3);
        assert!(none.missing().is_empty());
    }

    #[test]
    fn profiles_are_kept_only_when_profiling() {
        let stats = [FragmentStats {
            index: 0,
            root_name: "SinkRoot",
            tuples: 10,
            batches: 2,
            busy: Duration::from_millis(3),
        }];
        let plain = QueryPartition::new(10, ExecutionOptions::default());
        let outcome = plain.finish(None, &stats).unwrap();
        assert_eq!(outcome.stats.tuples_produced, 10);
        assert!(outcome.stats.profiles.is_empty());

        let profiled = QueryPartition::new(
            11,
            ExecutionOptions {
                ft_mode: FtMode::None,
                profiling: true,
            },
        );
        let outcome = profiled.finish(None, &stats).unwrap();
        assert_eq!(outcome.stats.profiles[0].busy_micros, 3000);
    }
}
