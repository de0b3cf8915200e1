//! The worker process: admits sub-plans from the coordinator, runs them on
//! the executor pool and reacts to membership changes.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoff;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tessel_api::proto::transport_envelope::Payload;
use tessel_api::{
    ControlMessage, ControlType, ExecutionStats, QueryMessage, QueryType, TransportEnvelope,
};
use tessel_common::{Error, QueryId, WorkerId, COORDINATOR_ID};
use tessel_engine::{
    ChannelRegistry, ExecContext, Fabric, FabricBuilder, InboundHandler, Storage, SubQueryPlan,
};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::config::Settings;
use crate::error::{Result, WorkerError};
use crate::partition::{PartitionState, QueryPartition};
use crate::scheduler::{ExecutorPool, FragmentStats};
use crate::tasks::{TaskRegistry, SHUTDOWN_ROUNDS, WAIT_MAXIMUM};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The coordinator sent SHUTDOWN or the owner asked for it.
    Requested,
    CoordinatorLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub cause: ExitCause,
    /// Background tasks that ignored cancellation and abort.
    pub stuck_tasks: Vec<String>,
}

impl Termination {
    /// Process exit code for this termination.
    pub fn exit_code(&self) -> i32 {
        if !self.stuck_tasks.is_empty() {
            return 2;
        }
        match self.cause {
            ExitCause::Requested => 0,
            ExitCause::CoordinatorLost => 1,
        }
    }
}

/// Splits inbound traffic: data frames go straight to their input buffer,
/// everything else is queued for the processing tasks.
struct Inbound {
    registry: Arc<ChannelRegistry>,
    control: mpsc::UnboundedSender<(WorkerId, ControlMessage)>,
    queries: mpsc::UnboundedSender<(WorkerId, QueryMessage)>,
}

impl InboundHandler for Inbound {
    fn deliver(&self, from: WorkerId, envelope: TransportEnvelope) {
        match envelope.payload {
            Some(Payload::Data(frame)) => self.registry.route(from, frame),
            Some(Payload::Control(message)) => {
                if self.control.send((from, message)).is_err() {
                    trace!(from, "control queue closed");
                }
            }
            Some(Payload::Query(message)) => {
                if self.queries.send((from, message)).is_err() {
                    trace!(from, "query queue closed");
                }
            }
            None => debug!(from, "empty envelope"),
        }
    }
}

pub struct Worker {
    id: WorkerId,
    settings: Settings,
    fabric: Arc<dyn Fabric>,
    registry: Arc<ChannelRegistry>,
    storage: Arc<dyn Storage>,
    pool: ExecutorPool,
    partitions: DashMap<QueryId, Arc<QueryPartition>>,
    tasks: TaskRegistry,
    shutdown_requested: AtomicBool,
    stopping: AtomicBool,
    missed_checks: AtomicU32,
    termination: watch::Sender<Option<Termination>>,
}

impl Worker {
    /// Builds the fabric, connects to the coordinator and the peers listed
    /// in `settings`, and starts the background tasks.
    pub async fn start(
        settings: Settings,
        builder: &dyn FabricBuilder,
        storage: Arc<dyn Storage>,
    ) -> Result<WorkerHandle> {
        let id = settings.worker_id;
        if id == COORDINATOR_ID {
            return Err(WorkerError::Internal(format!(
                "worker id {COORDINATOR_ID} is reserved for the coordinator"
            )));
        }
        let registry = Arc::new(ChannelRegistry::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let inbound = Arc::new(Inbound {
            registry: registry.clone(),
            control: control_tx,
            queries: query_tx,
        });
        let fabric = builder.build(id, inbound).await?;
        fabric.add_remote(COORDINATOR_ID, &settings.coordinator_address)?;
        for peer in settings.peers.iter().filter(|p| p.id != id) {
            fabric.add_remote(peer.id, &peer.address)?;
        }

        let (termination, _) = watch::channel(None);
        let worker = Arc::new(Worker {
            id,
            pool: ExecutorPool::new(settings.executor_threads, settings.idle_recheck()),
            settings,
            fabric,
            registry,
            storage,
            partitions: DashMap::new(),
            tasks: TaskRegistry::new(),
            shutdown_requested: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            missed_checks: AtomicU32::new(0),
            termination,
        });
        worker
            .tasks
            .spawn("control-processor", worker.clone().process_control(control_rx));
        worker
            .tasks
            .spawn("query-processor", worker.clone().process_queries(query_rx));
        worker.tasks.spawn("heartbeat", worker.clone().heartbeat_loop());
        worker
            .tasks
            .spawn("shutdown-checker", worker.clone().shutdown_checker());
        info!(
            worker_id = id,
            peers = worker.settings.peers.len(),
            executor_threads = worker.settings.executor_threads,
            "worker started"
        );
        Ok(WorkerHandle { worker })
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    fn context(&self, partition: &QueryPartition) -> ExecContext {
        ExecContext {
            query_id: partition.query_id(),
            worker_id: self.id,
            fragment: 0,
            options: partition.options(),
            fabric: self.fabric.clone(),
            registry: self.registry.clone(),
            storage: self.storage.clone(),
            missing: partition.missing().clone(),
            buffers: self.settings.buffers,
            waker: Arc::new(Notify::new()),
        }
    }

    fn partition(&self, query_id: QueryId) -> Result<Arc<QueryPartition>> {
        self.partitions
            .get(&query_id)
            .map(|p| p.value().clone())
            .ok_or(WorkerError::UnknownQuery(query_id))
    }

    fn active(&self) -> Vec<Arc<QueryPartition>> {
        self.partitions.iter().map(|p| p.value().clone()).collect()
    }

    async fn process_queries(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(WorkerId, QueryMessage)>) {
        let mut stop = self.tasks.stop_signal();
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some((from, message)) = received else { break };
                    self.handle_query(from, message);
                }
                _ = stop.changed() => break,
            }
        }
        debug!(worker_id = self.id, "query processor stopped");
    }

    fn handle_query(self: &Arc<Self>, from: WorkerId, message: QueryMessage) {
        if from != COORDINATOR_ID {
            warn!(from, query_id = message.query_id, "query message not from the coordinator");
            return;
        }
        match message.query_type() {
            Some(QueryType::QuerySubmit) => self.admit(message),
            Some(QueryType::QueryStart) => self.start_query(message.query_id),
            Some(QueryType::QueryKill) => self.kill(message.query_id, &message.cause),
            other => warn!(query_id = message.query_id, kind = ?other, "unexpected query message"),
        }
    }

    /// Decodes a sub-plan, builds and opens its fragments, then reports
    /// ready. Any failure on the way is reported as a query failure.
    fn admit(self: &Arc<Self>, message: QueryMessage) {
        let query_id = message.query_id;
        if self.is_stopping() {
            self.send_query(QueryMessage::failure(
                query_id,
                "worker is shutting down",
                ExecutionStats::default(),
            ));
            return;
        }
        if self.partitions.contains_key(&query_id) {
            warn!(query_id, "query submitted twice");
            return;
        }
        let plan: SubQueryPlan = match bincode::deserialize(&message.plan) {
            Ok(plan) => plan,
            Err(e) => {
                let e = WorkerError::Decode(e);
                error!(query_id, error = %e, "rejecting query");
                self.send_query(QueryMessage::failure(query_id, &e.to_string(), ExecutionStats::default()));
                return;
            }
        };
        if plan.query_id != query_id {
            let cause = format!("sub-plan belongs to query {}", plan.query_id);
            error!(query_id, cause = %cause, "rejecting query");
            self.send_query(QueryMessage::failure(query_id, &cause, ExecutionStats::default()));
            return;
        }

        let partition = Arc::new(QueryPartition::new(query_id, plan.options));
        self.partitions.insert(query_id, partition.clone());
        let base = self.context(&partition);
        match partition.prepare(&plan.fragments, &base) {
            Ok(()) => {
                info!(
                    query_id,
                    fragments = plan.fragments.len(),
                    ft_mode = %plan.options.ft_mode,
                    "query admitted"
                );
                self.send_query(QueryMessage::ready(query_id));
            }
            Err(e) => {
                error!(query_id, error = %e, "query could not be prepared");
                tokio::spawn(self.clone().settle(partition, Some(e.to_string()), Vec::new()));
            }
        }
    }

    fn start_query(self: &Arc<Self>, query_id: QueryId) {
        let partition = match self.partition(query_id) {
            Ok(partition) => partition,
            Err(e) => {
                debug!(error = %e, "start ignored");
                return;
            }
        };
        let fragments = match partition.begin() {
            Ok(fragments) => fragments,
            Err(e) => {
                warn!(query_id, error = %e, "query not started");
                return;
            }
        };
        let profiling = partition.options().profiling;
        let drivers: FuturesUnordered<_> = fragments
            .into_iter()
            .map(|f| self.pool.spawn(f, partition.cancel_signal(), profiling))
            .collect();
        tokio::spawn(self.clone().supervise(partition, drivers));
    }

    /// Joins the fragment drivers of one partition. The first failure
    /// cancels the remaining fragments and becomes the partition's cause.
    async fn supervise(
        self: Arc<Self>,
        partition: Arc<QueryPartition>,
        mut drivers: FuturesUnordered<tokio::task::JoinHandle<tessel_common::Result<FragmentStats>>>,
    ) {
        let mut stats = Vec::new();
        let mut failure: Option<String> = None;
        let mut cancelled = false;
        while let Some(joined) = drivers.next().await {
            match joined {
                Ok(Ok(fragment)) => stats.push(fragment),
                Ok(Err(Error::Cancelled(_))) => cancelled = true,
                Ok(Err(e)) => {
                    let cause = e.to_string();
                    partition.cancel(&cause);
                    failure.get_or_insert(cause);
                }
                Err(e) => {
                    let cause = format!("fragment driver panicked: {e}");
                    partition.cancel(&cause);
                    failure.get_or_insert(cause);
                }
            }
        }
        let cause = match failure {
            Some(cause) => Some(cause),
            None if cancelled => partition.cancel_cause(),
            None => None,
        };
        stats.sort_by_key(|s| s.index);
        self.settle(partition, cause, stats).await;
    }

    fn kill(self: &Arc<Self>, query_id: QueryId, cause: &str) {
        let partition = match self.partition(query_id) {
            Ok(partition) => partition,
            Err(e) => {
                debug!(error = %e, "kill ignored");
                return;
            }
        };
        let cause = if cause.is_empty() { "killed by the coordinator" } else { cause };
        if !partition.cancel(cause) {
            return;
        }
        info!(query_id, cause, "query killed");
        self.finish_unstarted(&partition);
    }

    /// Fails a cancelled partition whose fragments never started.
    fn finish_unstarted(self: &Arc<Self>, partition: &Arc<QueryPartition>) {
        if matches!(partition.state(), PartitionState::Received | PartitionState::Ready) {
            partition.close_unstarted();
            tokio::spawn(self.clone().settle(partition.clone(), partition.cancel_cause(), Vec::new()));
        }
    }

    /// Moves a partition to its terminal state, drops it from the active
    /// set and reports the outcome to the coordinator.
    async fn settle(
        self: Arc<Self>,
        partition: Arc<QueryPartition>,
        cause: Option<String>,
        stats: Vec<FragmentStats>,
    ) {
        let Some(outcome) = partition.finish(cause, &stats) else {
            return;
        };
        let query_id = partition.query_id();
        self.partitions.remove(&query_id);
        self.registry.remove_query(query_id);
        let message = match &outcome.cause {
            None => QueryMessage::complete(query_id, outcome.stats.clone()),
            Some(cause) => QueryMessage::failure(query_id, cause, outcome.stats.clone()),
        };
        self.report(message).await;
        partition.publish(outcome);
    }

    /// Sends a query outcome to the coordinator, retrying while the link
    /// is down.
    async fn report(&self, message: QueryMessage) {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Some(self.settings.drain_timeout()),
            ..ExponentialBackoff::default()
        };
        let query_id = message.query_id;
        let fabric = self.fabric.clone();
        let id = self.id;
        let sent = backoff::future::retry(policy, || {
            let fabric = fabric.clone();
            let envelope = TransportEnvelope::query(id, message.clone());
            async move {
                fabric.send(COORDINATOR_ID, envelope).map_err(|e| {
                    debug!(query_id, reason = %e, "outcome not delivered, retrying");
                    backoff::Error::transient(e.reason)
                })
            }
        })
        .await;
        if let Err(reason) = sent {
            error!(query_id, reason = %reason, "could not report query outcome");
        }
    }

    fn send_query(&self, message: QueryMessage) {
        let query_id = message.query_id;
        if let Err(e) = self.fabric.send(COORDINATOR_ID, TransportEnvelope::query(self.id, message)) {
            warn!(query_id, error = %e, "query message not delivered");
        }
    }

    fn send_control(&self, message: ControlMessage) {
        if let Err(e) = self.fabric.send(COORDINATOR_ID, TransportEnvelope::control(self.id, message)) {
            debug!(worker_id = self.id, error = %e, "control message not delivered");
        }
    }

    async fn process_control(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<(WorkerId, ControlMessage)>) {
        let mut stop = self.tasks.stop_signal();
        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some((from, message)) = received else { break };
                    self.handle_control(from, message);
                }
                _ = stop.changed() => break,
            }
        }
        debug!(worker_id = self.id, "control processor stopped");
    }

    fn handle_control(&self, from: WorkerId, message: ControlMessage) {
        if from != COORDINATOR_ID {
            warn!(from, "control message not from the coordinator");
            return;
        }
        let worker = message.worker_id;
        match message.control_type() {
            Some(ControlType::RemoveWorker) => {
                info!(worker_id = self.id, removed = worker, "worker left the cluster");
                self.fabric.remove_remote(worker);
                for partition in self.active() {
                    partition.on_worker_removed(worker);
                }
                self.send_control(ControlMessage::remove_worker_ack(worker));
            }
            Some(ControlType::AddWorker) => {
                info!(worker_id = self.id, added = worker, address = %message.remote_address, "worker joined the cluster");
                if let Err(e) = self.fabric.add_remote(worker, &message.remote_address) {
                    error!(worker_id = self.id, added = worker, error = %e, "could not connect to new worker");
                    return;
                }
                for partition in self.active() {
                    partition.on_worker_added(worker);
                }
                self.send_control(ControlMessage::add_worker_ack(worker));
            }
            Some(ControlType::Shutdown) => {
                info!(worker_id = self.id, "shutdown requested by the coordinator");
                self.shutdown_requested.store(true, Ordering::Release);
            }
            other => warn!(worker_id = self.id, kind = ?other, "unexpected control message"),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut stop = self.tasks.stop_signal();
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    trace!(worker_id = self.id, "heartbeat");
                    self.send_control(ControlMessage::heartbeat(self.id));
                }
                _ = stop.changed() => break,
            }
        }
    }

    async fn shutdown_checker(self: Arc<Self>) {
        let mut stop = self.tasks.stop_signal();
        let mut ticker = tokio::time::interval(self.settings.shutdown_check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(cause) = self.check_shutdown() else { continue };
                    // The shutdown waits on this task, so it runs detached.
                    tokio::spawn(self.clone().shutdown(cause));
                    break;
                }
                _ = stop.changed() => break,
            }
        }
    }

    fn check_shutdown(&self) -> Option<ExitCause> {
        if self.shutdown_requested.load(Ordering::Acquire) {
            return Some(ExitCause::Requested);
        }
        if self.fabric.is_remote_alive(COORDINATOR_ID) {
            self.missed_checks.store(0, Ordering::Release);
            return None;
        }
        let missed = self.missed_checks.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(worker_id = self.id, missed, "coordinator unreachable");
        (missed >= self.settings.coordinator_loss_checks.max(1)).then_some(ExitCause::CoordinatorLost)
    }

    /// Cancels every query, gives running partitions the drain timeout to
    /// report, closes the fabric and stops the background tasks.
    async fn shutdown(self: Arc<Self>, cause: ExitCause) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(worker_id = self.id, cause = ?cause, "worker shutting down");
        let partitions = self.active();
        for partition in &partitions {
            partition.cancel("worker is shutting down");
            self.finish_unstarted(partition);
        }
        let drained = tokio::time::timeout(
            self.settings.drain_timeout(),
            futures::future::join_all(partitions.iter().map(|p| p.wait())),
        )
        .await;
        if drained.is_err() {
            warn!(worker_id = self.id, "queries did not drain in time");
        }

        let stuck_tasks = self.tasks.shutdown(WAIT_MAXIMUM, SHUTDOWN_ROUNDS).await;
        self.fabric.shutdown();
        let termination = Termination { cause, stuck_tasks };
        info!(worker_id = self.id, exit_code = termination.exit_code(), "worker stopped");
        self.termination.send_replace(Some(termination));
    }
}

/// Owner's view of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    worker: Arc<Worker>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.worker.id
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.worker.fabric
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.worker.storage
    }

    pub fn active_queries(&self) -> Vec<QueryId> {
        let mut ids: Vec<_> = self.worker.partitions.iter().map(|p| *p.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn partition(&self, query_id: QueryId) -> Option<Arc<QueryPartition>> {
        self.worker.partition(query_id).ok()
    }

    pub fn background_tasks(&self) -> usize {
        self.worker.tasks.len()
    }

    /// Asks the worker to stop at its next shutdown check.
    pub fn request_shutdown(&self) {
        self.worker.shutdown_requested.store(true, Ordering::Release);
    }

    /// Stops the worker now and waits for it.
    pub async fn shutdown(&self) -> Termination {
        self.worker.clone().shutdown(ExitCause::Requested).await;
        self.terminated().await
    }

    /// Resolves once the worker has stopped, for whatever reason.
    pub async fn terminated(&self) -> Termination {
        let mut rx = self.worker.termination.subscribe();
        let termination = match rx.wait_for(Option::is_some).await {
            Ok(t) => t.clone(),
            Err(_) => None,
        };
        termination.unwrap_or(Termination {
            cause: ExitCause::Requested,
            stuck_tasks: Vec::new(),
        })
    }
}
