//! Coordinator runtime: membership, heartbeats and query tracking.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tessel_api::proto::transport_envelope::Payload;
use tessel_api::{
    ControlMessage, ControlType, ExecutionStats, QueryMessage, QueryType, TransportEnvelope,
};
use tessel_common::{
    Error, ExecutionOptions, FtMode, MemoryCatalog, QueryId, WorkerId, COORDINATOR_ID,
};
use tessel_engine::{Fabric, FabricBuilder, InboundHandler};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::cluster::ClusterState;
use crate::config::Settings;
use crate::construct::{set_execution_options, QueryConstruct};
use crate::encoding::QueryEncoding;
use crate::error::{CoordinatorError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum QueryStatus {
    Succeeded,
    Failed(String),
}

/// Final state of a query and the statistics each worker reported.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub query_id: QueryId,
    pub status: QueryStatus,
    pub stats: BTreeMap<WorkerId, ExecutionStats>,
}

impl QueryOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == QueryStatus::Succeeded
    }

    pub fn tuples_produced(&self) -> i64 {
        self.stats.values().map(|s| s.tuples_produced).sum()
    }
}

#[derive(Default)]
struct Progress {
    ready: BTreeSet<WorkerId>,
    finished: BTreeMap<WorkerId, ExecutionStats>,
    abandoned: BTreeSet<WorkerId>,
    /// Removed under `rejoin`, waiting for a replacement to report ready.
    lost: BTreeSet<WorkerId>,
    /// Replacements that turned ready after the query started.
    rejoined: BTreeSet<WorkerId>,
    started: bool,
    failure: Option<String>,
    settled: bool,
}

/// What the caller must do after a progress update.
#[derive(Default)]
struct Step {
    start: Vec<WorkerId>,
    kill: Vec<WorkerId>,
}

struct TrackedQuery {
    id: QueryId,
    options: ExecutionOptions,
    workers: BTreeSet<WorkerId>,
    /// Encoded sub-plan of each worker, shipped again to a replacement.
    plans: BTreeMap<WorkerId, Vec<u8>>,
    progress: Mutex<Progress>,
    outcome: watch::Sender<Option<QueryOutcome>>,
}

impl TrackedQuery {
    fn new(id: QueryId, options: ExecutionOptions, plans: BTreeMap<WorkerId, Vec<u8>>) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            options,
            workers: plans.keys().copied().collect(),
            plans,
            progress: Mutex::new(Progress::default()),
            outcome,
        }
    }

    /// True while the query waits for a replacement of `worker`.
    fn awaits(&self, worker: WorkerId) -> bool {
        let progress = self.lock();
        !progress.settled && progress.lost.contains(&worker)
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Progress)) -> Step {
        let mut progress = self.lock();
        if progress.settled {
            return Step::default();
        }
        f(&mut progress);
        self.advance(&mut progress)
    }

    fn advance(&self, progress: &mut Progress) -> Step {
        let mut step = Step::default();
        let expected: BTreeSet<WorkerId> =
            self.workers.difference(&progress.abandoned).copied().collect();

        if let Some(cause) = progress.failure.clone() {
            step.kill = expected
                .iter()
                .filter(|w| !progress.finished.contains_key(w))
                .copied()
                .collect();
            self.settle(progress, QueryStatus::Failed(cause));
            return step;
        }
        if !progress.started && expected.is_subset(&progress.ready) {
            progress.started = true;
            step.start = expected.iter().copied().collect();
        }
        if progress.started {
            step.start.extend(std::mem::take(&mut progress.rejoined));
        }
        if progress.started && expected.iter().all(|w| progress.finished.contains_key(w)) {
            self.settle(progress, QueryStatus::Succeeded);
        }
        step
    }

    fn settle(&self, progress: &mut Progress, status: QueryStatus) {
        progress.settled = true;
        info!(query_id = self.id, status = ?status, "query settled");
        self.outcome.send_replace(Some(QueryOutcome {
            query_id: self.id,
            status,
            stats: progress.finished.clone(),
        }));
    }
}

struct Rejoin {
    address: String,
    queries: BTreeSet<QueryId>,
}

struct Inbox {
    tx: mpsc::UnboundedSender<(WorkerId, TransportEnvelope)>,
}

impl InboundHandler for Inbox {
    fn deliver(&self, from: WorkerId, envelope: TransportEnvelope) {
        if self.tx.send((from, envelope)).is_err() {
            trace!(from, "coordinator inbox closed");
        }
    }
}

/// The coordinator process: ships compiled queries to workers and tracks
/// them to completion.
pub struct Coordinator {
    settings: Settings,
    fabric: Arc<dyn Fabric>,
    catalog: Arc<MemoryCatalog>,
    cluster: ClusterState,
    queries: dashmap::DashMap<QueryId, Arc<TrackedQuery>>,
    /// Replacement workers whose ADD_WORKER broadcast waits until they are
    /// ready for every query they rejoin.
    rejoining: Mutex<BTreeMap<WorkerId, Rejoin>>,
    next_query_id: AtomicI64,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub async fn start(
        settings: Settings,
        builder: &dyn FabricBuilder,
        catalog: Arc<MemoryCatalog>,
    ) -> Result<Arc<Coordinator>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let fabric = builder.build(COORDINATOR_ID, Arc::new(Inbox { tx })).await?;
        let (stop, _) = watch::channel(false);
        let coordinator = Arc::new(Coordinator {
            settings,
            fabric,
            catalog,
            cluster: ClusterState::new(),
            queries: dashmap::DashMap::new(),
            rejoining: Mutex::new(BTreeMap::new()),
            next_query_id: AtomicI64::new(1),
            stop,
            tasks: Mutex::new(Vec::new()),
        });
        for worker in coordinator.settings.workers.clone() {
            coordinator.register(worker.id, &worker.address)?;
        }

        let processor = tokio::spawn(coordinator.clone().process(rx));
        let pruner = tokio::spawn(coordinator.clone().prune_loop());
        coordinator
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([processor, pruner]);
        info!(workers = coordinator.cluster.len(), "coordinator started");
        Ok(coordinator)
    }

    fn register(&self, id: WorkerId, address: &str) -> Result<()> {
        if id == COORDINATOR_ID {
            return Err(CoordinatorError::Internal(format!(
                "worker id {COORDINATOR_ID} is reserved"
            )));
        }
        self.fabric.add_remote(id, address)?;
        self.cluster.register(id, address);
        self.catalog.set_alive(id, true);
        Ok(())
    }

    pub fn catalog(&self) -> &Arc<MemoryCatalog> {
        &self.catalog
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    pub fn alive_workers(&self) -> Vec<WorkerId> {
        self.cluster.ids()
    }

    /// Compiles `query` and ships one sub-plan to each worker involved.
    /// Plan errors are returned before anything is sent.
    pub fn submit(&self, query: QueryEncoding) -> Result<QueryId> {
        let query_id = self.next_query_id.fetch_add(1, Ordering::SeqCst);
        let mut plans = QueryConstruct::new(query_id)
            .with_broadcast_fallback(self.settings.allow_broadcast_fallback)
            .instantiate(&query.fragments, self.catalog.as_ref())?;
        set_execution_options(&mut plans, query.options);

        let mut encoded = BTreeMap::new();
        for (worker, plan) in &plans {
            encoded.insert(*worker, bincode::serialize(plan)?);
        }
        let tracked = Arc::new(TrackedQuery::new(query_id, query.options, encoded));
        self.queries.insert(query_id, tracked.clone());

        for (worker, bytes) in &tracked.plans {
            let (worker, bytes) = (*worker, bytes.clone());
            let envelope = TransportEnvelope::query(COORDINATOR_ID, QueryMessage::submit(query_id, bytes));
            if let Err(e) = self.fabric.send(worker, envelope) {
                let cause = format!("could not ship query {query_id} to worker {worker}: {e}");
                self.fail(&tracked, cause.clone());
                return Err(Error::transport(cause).into());
            }
        }
        info!(
            query_id,
            workers = ?tracked.workers,
            ft_mode = %query.options.ft_mode,
            "query submitted"
        );
        Ok(query_id)
    }

    /// Waits until `query_id` succeeds or fails.
    pub async fn wait(&self, query_id: QueryId) -> Result<QueryOutcome> {
        let tracked = self
            .queries
            .get(&query_id)
            .map(|q| q.value().clone())
            .ok_or(CoordinatorError::QueryNotFound(query_id))?;
        let mut rx = tracked.outcome.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoordinatorError::Internal(format!("query {query_id} lost its tracker")))?
            .clone();
        self.queries.remove(&query_id);
        outcome.ok_or(CoordinatorError::QueryNotFound(query_id))
    }

    pub fn kill(&self, query_id: QueryId, reason: &str) -> Result<()> {
        let tracked = self
            .queries
            .get(&query_id)
            .map(|q| q.value().clone())
            .ok_or(CoordinatorError::QueryNotFound(query_id))?;
        self.fail(&tracked, format!("killed: {reason}"));
        Ok(())
    }

    /// Registers `id` at `address`. When `rejoin` queries lost a worker
    /// with this id, the new worker receives their sub-plans and the rest
    /// of the cluster learns about it once it is ready for all of them.
    pub fn add_worker(&self, id: WorkerId, address: &str) -> Result<()> {
        self.register(id, address)?;
        let waiting: Vec<Arc<TrackedQuery>> = self
            .queries
            .iter()
            .filter(|q| q.awaits(id))
            .map(|q| q.value().clone())
            .collect();
        info!(worker_id = id, address, rejoining = waiting.len(), "worker added");
        if waiting.is_empty() {
            self.announce(id, address);
            return Ok(());
        }

        self.lock_rejoining().insert(
            id,
            Rejoin {
                address: address.to_string(),
                queries: waiting.iter().map(|q| q.id).collect(),
            },
        );
        for query in waiting {
            let Some(bytes) = query.plans.get(&id).cloned() else {
                continue;
            };
            debug!(query_id = query.id, worker_id = id, "shipping sub-plan to replacement");
            let envelope = TransportEnvelope::query(COORDINATOR_ID, QueryMessage::submit(query.id, bytes));
            if let Err(e) = self.fabric.send(id, envelope) {
                self.fail(&query, format!("could not ship query {} to worker {id}: {e}", query.id));
            }
        }
        self.release_rejoined(id);
        Ok(())
    }

    fn announce(&self, id: WorkerId, address: &str) {
        for other in self.cluster.ids().into_iter().filter(|w| *w != id) {
            self.send_control(other, ControlMessage::add_worker(id, address));
        }
    }

    fn lock_rejoining(&self) -> MutexGuard<'_, BTreeMap<WorkerId, Rejoin>> {
        self.rejoining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announces `worker` once no query still waits for it to turn ready.
    fn release_rejoined(&self, worker: WorkerId) {
        let address = {
            let mut rejoining = self.lock_rejoining();
            let Some(entry) = rejoining.get_mut(&worker) else {
                return;
            };
            entry.queries.retain(|q| {
                self.queries
                    .get(q)
                    .map(|query| query.awaits(worker))
                    .unwrap_or(false)
            });
            if !entry.queries.is_empty() {
                return;
            }
            rejoining.remove(&worker).map(|entry| entry.address)
        };
        if let Some(address) = address {
            debug!(worker_id = worker, "replacement ready for every query it rejoins");
            self.announce(worker, &address);
        }
    }

    /// Drops `id` from the cluster and applies each affected query's
    /// fault-tolerance mode.
    pub fn remove_worker(&self, id: WorkerId) -> Result<()> {
        if self.cluster.remove(id).is_none() {
            return Err(CoordinatorError::WorkerNotFound(id));
        }
        self.catalog.set_alive(id, false);
        self.fabric.remove_remote(id);
        info!(worker_id = id, "worker removed");
        for other in self.cluster.ids() {
            self.send_control(other, ControlMessage::remove_worker(id));
        }

        let affected: Vec<Arc<TrackedQuery>> = self
            .queries
            .iter()
            .filter(|q| q.workers.contains(&id))
            .map(|q| q.value().clone())
            .collect();
        for query in affected {
            match query.options.ft_mode {
                FtMode::None => self.fail(&query, format!("worker {id} left the cluster")),
                FtMode::Abandon => {
                    debug!(query_id = query.id, worker_id = id, "abandoning worker");
                    let step = query.update(|p| {
                        p.abandoned.insert(id);
                    });
                    self.apply(&query, step);
                }
                FtMode::Rejoin => {
                    debug!(query_id = query.id, worker_id = id, "waiting for worker to rejoin");
                    let step = query.update(|p| {
                        if !p.finished.contains_key(&id) {
                            p.ready.remove(&id);
                            p.rejoined.remove(&id);
                            p.lost.insert(id);
                        }
                    });
                    self.apply(&query, step);
                }
            }
        }
        Ok(())
    }

    /// Asks every member to shut down.
    pub fn shutdown_workers(&self) {
        for worker in self.cluster.ids() {
            self.send_control(worker, ControlMessage::shutdown());
        }
    }

    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        self.fabric.shutdown();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        info!("coordinator stopped");
    }

    fn fail(&self, query: &TrackedQuery, cause: String) {
        let step = query.update(|p| {
            p.failure.get_or_insert(cause);
        });
        self.apply(query, step);
        let pending: Vec<WorkerId> = self.lock_rejoining().keys().copied().collect();
        for worker in pending {
            self.release_rejoined(worker);
        }
    }

    fn apply(&self, query: &TrackedQuery, step: Step) {
        for worker in step.start {
            self.send_query(worker, QueryMessage::start(query.id));
        }
        if !step.kill.is_empty() {
            let reason = format!("query {} failed", query.id);
            for worker in step.kill {
                self.send_query(worker, QueryMessage::kill(query.id, &reason));
            }
        }
    }

    fn send_control(&self, to: WorkerId, message: ControlMessage) {
        if let Err(e) = self.fabric.send(to, TransportEnvelope::control(COORDINATOR_ID, message)) {
            warn!(worker_id = to, error = %e, "control message not delivered");
        }
    }

    fn send_query(&self, to: WorkerId, message: QueryMessage) {
        if let Err(e) = self.fabric.send(to, TransportEnvelope::query(COORDINATOR_ID, message)) {
            warn!(worker_id = to, error = %e, "query message not delivered");
        }
    }

    async fn process(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(WorkerId, TransportEnvelope)>) {
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some((from, envelope)) = received else { break };
                    self.handle(from, envelope);
                }
                _ = stop.changed() => break,
            }
        }
    }

    fn handle(&self, from: WorkerId, envelope: TransportEnvelope) {
        match envelope.payload {
            Some(Payload::Control(message)) => match message.control_type() {
                Some(ControlType::Heartbeat) => {
                    if self.cluster.touch(from) {
                        trace!(worker_id = from, "heartbeat");
                    } else {
                        debug!(worker_id = from, "heartbeat from a non-member");
                    }
                }
                Some(ControlType::AddWorkerAck | ControlType::RemoveWorkerAck) => {
                    debug!(from, about = message.worker_id, kind = ?message.control_type(), "membership change acknowledged");
                }
                other => warn!(from, kind = ?other, "unexpected control message"),
            },
            Some(Payload::Query(message)) => self.handle_query(from, message),
            Some(Payload::Data(_)) | None => warn!(from, "coordinator dropped a non-control envelope"),
        }
    }

    fn handle_query(&self, from: WorkerId, message: QueryMessage) {
        let Some(query) = self.queries.get(&message.query_id).map(|q| q.value().clone()) else {
            debug!(query_id = message.query_id, from, "message for an unknown query");
            return;
        };
        if !query.workers.contains(&from) {
            warn!(query_id = query.id, from, "message from a worker outside the query");
            return;
        }
        let step = match message.query_type() {
            Some(QueryType::QueryReady) => {
                debug!(query_id = query.id, worker_id = from, "worker ready");
                query.update(|p| {
                    if p.lost.remove(&from) && p.started {
                        p.rejoined.insert(from);
                    }
                    p.ready.insert(from);
                })
            }
            Some(QueryType::QueryComplete) => {
                debug!(query_id = query.id, worker_id = from, "worker finished");
                let stats = message.stats.unwrap_or_default();
                query.update(|p| {
                    p.finished.insert(from, stats);
                })
            }
            Some(QueryType::QueryFailure) => {
                error!(query_id = query.id, worker_id = from, cause = %message.cause, "worker failed");
                let stats = message.stats.unwrap_or_default();
                let cause = format!("worker {from}: {}", message.cause);
                query.update(|p| {
                    p.finished.insert(from, stats);
                    p.failure.get_or_insert(cause);
                })
            }
            other => {
                warn!(query_id = query.id, from, kind = ?other, "unexpected query message");
                return;
            }
        };
        self.apply(&query, step);
        self.release_rejoined(from);
    }

    async fn prune_loop(self: Arc<Self>) {
        let mut stop = self.stop.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.prune_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for worker in self.cluster.stale(self.settings.worker_timeout_secs) {
                        warn!(worker_id = worker, "no heartbeat in time, removing worker");
                        if let Err(e) = self.remove_worker(worker) {
                            debug!(worker_id = worker, error = %e, "worker already gone");
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
    }
}
