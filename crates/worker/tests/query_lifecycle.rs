//! Workers driven by a scripted coordinator endpoint.

use std::sync::Arc;
use std::time::Duration;

use arrow::array::Int32Array;
use tessel_api::proto::transport_envelope::Payload;
use tessel_api::{ControlMessage, ControlType, QueryMessage, QueryType, TransportEnvelope};
use tessel_common::{
    ChannelId, ExecutionOptions, FtMode, QueryId, RelationKey, Schema, TupleBatch, Type, WorkerId,
    COORDINATOR_ID,
};
use tessel_engine::{
    ExchangeEdge, Fabric, InboundHandler, LinkState, LocalEndpoint, LocalNetwork, MemoryStorage,
    Partitioning, PlanFragment, PlanNode, Storage, SubQueryPlan,
};
use tessel_worker::{PartitionState, PeerEntry, Settings, Worker, WorkerHandle};
use tokio::sync::mpsc;

struct FakeCoordinator {
    tx: mpsc::UnboundedSender<(WorkerId, QueryMessage)>,
    control_tx: mpsc::UnboundedSender<(WorkerId, ControlMessage)>,
}

impl InboundHandler for FakeCoordinator {
    fn deliver(&self, from: WorkerId, envelope: TransportEnvelope) {
        match envelope.payload {
            Some(Payload::Query(message)) => {
                let _ = self.tx.send((from, message));
            }
            Some(Payload::Control(message)) => {
                let _ = self.control_tx.send((from, message));
            }
            _ => {}
        }
    }
}

struct Harness {
    coordinator: Arc<LocalEndpoint>,
    inbox: mpsc::UnboundedReceiver<(WorkerId, QueryMessage)>,
    controls: mpsc::UnboundedReceiver<(WorkerId, ControlMessage)>,
    workers: Vec<(WorkerHandle, Arc<MemoryStorage>)>,
}

impl Harness {
    async fn start(ids: &[WorkerId]) -> Harness {
        let net = LocalNetwork::new();
        let (tx, inbox) = mpsc::unbounded_channel();
        let (control_tx, controls) = mpsc::unbounded_channel();
        let coordinator = net.attach(COORDINATOR_ID, Arc::new(FakeCoordinator { tx, control_tx }));
        let mut workers = Vec::new();
        for id in ids {
            coordinator.add_remote(*id, "").unwrap();
            let mut settings = Settings::local(*id);
            settings.peers = ids
                .iter()
                .map(|p| PeerEntry {
                    id: *p,
                    address: format!("local:{p}"),
                })
                .collect();
            let storage = Arc::new(MemoryStorage::new());
            let handle = Worker::start(settings, &net, storage.clone()).await.unwrap();
            workers.push((handle, storage));
        }
        Harness {
            coordinator,
            inbox,
            controls,
            workers,
        }
    }

    fn worker(&self, id: WorkerId) -> &(WorkerHandle, Arc<MemoryStorage>) {
        self.workers.iter().find(|(h, _)| h.id() == id).unwrap()
    }

    fn send_query(&self, to: WorkerId, message: QueryMessage) {
        self.coordinator
            .send(to, TransportEnvelope::query(COORDINATOR_ID, message))
            .unwrap();
    }

    fn send_control(&self, to: WorkerId, message: ControlMessage) {
        self.coordinator
            .send(to, TransportEnvelope::control(COORDINATOR_ID, message))
            .unwrap();
    }

    fn submit(&self, to: WorkerId, plan: &SubQueryPlan) {
        let bytes = bincode::serialize(plan).unwrap();
        self.send_query(to, QueryMessage::submit(plan.query_id, bytes));
    }

    /// Next message from any worker, which must be of `kind`.
    async fn expect(&mut self, kind: QueryType) -> (WorkerId, QueryMessage) {
        let (from, message) = tokio::time::timeout(Duration::from_secs(5), self.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.query_type(), Some(kind), "from worker {from}: {message:?}");
        (from, message)
    }

    /// Next control message of `kind`, skipping heartbeats unless asked for.
    async fn expect_control(&mut self, kind: ControlType) -> (WorkerId, ControlMessage) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (from, message) = self.controls.recv().await.unwrap();
                if message.control_type() == Some(kind) {
                    return (from, message);
                }
                assert_eq!(message.control_type(), Some(ControlType::Heartbeat), "{message:?}");
            }
        })
        .await
        .unwrap()
    }

    async fn stop(self) {
        for (handle, _) in &self.workers {
            tokio::time::timeout(Duration::from_secs(10), handle.shutdown())
                .await
                .unwrap();
        }
    }
}

async fn until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

fn numbers() -> RelationKey {
    RelationKey::new("public", "adhoc", "numbers")
}

fn gathered() -> RelationKey {
    RelationKey::new("public", "adhoc", "gathered")
}

fn schema() -> Schema {
    Schema::of(&[("x", Type::Int)])
}

fn ints(values: Vec<i32>) -> TupleBatch {
    TupleBatch::try_new(schema(), vec![Arc::new(Int32Array::from(values))]).unwrap()
}

fn rows(storage: &MemoryStorage, relation: &RelationKey) -> Vec<i32> {
    let mut out: Vec<i32> = storage
        .scan(relation)
        .unwrap_or_default()
        .iter()
        .flat_map(|b| {
            b.column(0)
                .as_any()
                .downcast_ref::<Int32Array>()
                .unwrap()
                .values()
                .to_vec()
        })
        .collect();
    out.sort_unstable();
    out
}

/// Every worker scans `numbers` and sends it to worker 1, which stores it.
fn gather_plans(query_id: QueryId, workers: &[WorkerId], ft_mode: FtMode) -> Vec<(WorkerId, SubQueryPlan)> {
    let channel = ChannelId::next();
    workers
        .iter()
        .map(|w| {
            let mut plan = SubQueryPlan::new(query_id);
            plan.options = ExecutionOptions {
                ft_mode,
                profiling: false,
            };
            plan.fragments.push(PlanFragment {
                index: 0,
                root: PlanNode::Producer {
                    child: Box::new(PlanNode::TableScan {
                        relation: numbers(),
                        schema: schema(),
                    }),
                    partitioning: Partitioning::Collect,
                    outputs: vec![ExchangeEdge {
                        channel,
                        destinations: vec![1],
                    }],
                },
            });
            if *w == 1 {
                plan.fragments.push(PlanFragment {
                    index: 1,
                    root: PlanNode::InsertRoot {
                        child: Box::new(PlanNode::Consumer {
                            channel,
                            sources: workers.to_vec(),
                            schema: schema(),
                        }),
                        relation: gathered(),
                        overwrite: true,
                    },
                });
            }
            (*w, plan)
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ready_then_start_then_complete() {
    let mut harness = Harness::start(&[1, 2]).await;
    harness.worker(1).1.load(numbers(), vec![ints(vec![1, 2])]);
    harness.worker(2).1.load(numbers(), vec![ints(vec![3])]);

    for (w, plan) in gather_plans(7, &[1, 2], FtMode::None) {
        harness.submit(w, &plan);
    }
    harness.expect(QueryType::QueryReady).await;
    harness.expect(QueryType::QueryReady).await;
    assert_eq!(harness.worker(1).0.active_queries(), vec![7]);

    harness.send_query(1, QueryMessage::start(7));
    harness.send_query(2, QueryMessage::start(7));
    let (_, first) = harness.expect(QueryType::QueryComplete).await;
    let (_, second) = harness.expect(QueryType::QueryComplete).await;
    let produced: i64 = [first, second]
        .iter()
        .filter_map(|m| m.stats.as_ref())
        .map(|s| s.tuples_produced)
        .sum();
    // Three rows leave the producers and three reach the insert.
    assert_eq!(produced, 6);
    assert_eq!(rows(&harness.worker(1).1, &gathered()), vec![1, 2, 3]);
    assert!(harness.worker(1).0.active_queries().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn undecodable_plan_is_reported_as_failure() {
    let mut harness = Harness::start(&[1]).await;
    harness.send_query(1, QueryMessage::submit(3, vec![0xff, 0x01]));
    let (from, message) = harness.expect(QueryType::QueryFailure).await;
    assert_eq!(from, 1);
    assert_eq!(message.query_id, 3);
    assert!(harness.worker(1).0.active_queries().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn operator_errors_at_open_fail_only_that_query() {
    let mut harness = Harness::start(&[1]).await;
    harness.worker(1).1.load(numbers(), vec![ints(vec![5])]);

    // Nothing is stored under `numbers` for query 4's scan.
    let mut broken = SubQueryPlan::new(4);
    broken.fragments.push(PlanFragment {
        index: 0,
        root: PlanNode::SinkRoot {
            child: Box::new(PlanNode::TableScan {
                relation: RelationKey::new("public", "adhoc", "absent"),
                schema: schema(),
            }),
        },
    });
    harness.submit(1, &broken);
    let (_, failure) = harness.expect(QueryType::QueryFailure).await;
    assert_eq!(failure.query_id, 4);
    assert!(failure.cause.contains("absent"));

    for (w, plan) in gather_plans(5, &[1], FtMode::None) {
        harness.submit(w, &plan);
    }
    harness.expect(QueryType::QueryReady).await;
    harness.send_query(1, QueryMessage::start(5));
    let (_, done) = harness.expect(QueryType::QueryComplete).await;
    assert_eq!(done.query_id, 5);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejoin_stalls_until_the_worker_is_back() {
    let mut harness = Harness::start(&[1, 2]).await;
    harness.worker(1).1.load(numbers(), vec![ints(vec![1])]);
    harness.worker(2).1.load(numbers(), vec![ints(vec![2, 3])]);

    for (w, plan) in gather_plans(9, &[1, 2], FtMode::Rejoin) {
        harness.submit(w, &plan);
    }
    harness.expect(QueryType::QueryReady).await;
    harness.expect(QueryType::QueryReady).await;

    harness.send_control(1, ControlMessage::remove_worker(2));
    {
        let fabric = harness.worker(1).0.fabric().clone();
        until(|| fabric.link_state(2) == LinkState::Closed).await;
    }
    let partition = harness.worker(1).0.partition(9).unwrap();
    until(|| partition.missing().contains(2)).await;

    harness.send_query(1, QueryMessage::start(9));
    harness.send_query(2, QueryMessage::start(9));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.inbox.try_recv().is_err());
    assert_eq!(partition.state(), PartitionState::Running);

    harness.send_control(1, ControlMessage::add_worker(2, "local:2"));
    harness.expect(QueryType::QueryComplete).await;
    harness.expect(QueryType::QueryComplete).await;
    assert!(!partition.missing().contains(2));
    assert_eq!(rows(&harness.worker(1).1, &gathered()), vec![1, 2, 3]);
    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kill_stops_a_running_query() {
    let mut harness = Harness::start(&[1, 2]).await;
    harness.worker(1).1.load(numbers(), vec![ints(vec![1])]);
    harness.worker(2).1.load(numbers(), vec![ints(vec![2])]);

    // Worker 2 never starts, so worker 1's consumer waits forever.
    for (w, plan) in gather_plans(11, &[1, 2], FtMode::Rejoin) {
        harness.submit(w, &plan);
    }
    harness.expect(QueryType::QueryReady).await;
    harness.expect(QueryType::QueryReady).await;
    harness.send_query(1, QueryMessage::start(11));
    let partition = harness.worker(1).0.partition(11).unwrap();
    until(|| partition.state() == PartitionState::Running).await;

    harness.send_query(1, QueryMessage::kill(11, "stop it"));
    let (from, failure) = harness.expect(QueryType::QueryFailure).await;
    assert_eq!(from, 1);
    assert_eq!(failure.cause, "stop it");
    assert_eq!(partition.state(), PartitionState::Failed);

    harness.send_query(2, QueryMessage::kill(11, "stop it"));
    let (from, _) = harness.expect(QueryType::QueryFailure).await;
    assert_eq!(from, 2);
    harness.stop().await;
}

#[tokio::test]
async fn losing_the_coordinator_shuts_the_worker_down() {
    let harness = Harness::start(&[1]).await;
    let handle = harness.worker(1).0.clone();
    harness.coordinator.shutdown();
    let termination = tokio::time::timeout(Duration::from_secs(10), handle.terminated())
        .await
        .unwrap();
    assert_eq!(termination.exit_code(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandon_after_start_lets_the_survivors_finish() {
    let mut harness = Harness::start(&[1, 2]).await;
    harness.worker(1).1.load(numbers(), vec![ints(vec![1, 4])]);
    harness.worker(2).1.load(numbers(), vec![ints(vec![2, 3])]);

    for (w, plan) in gather_plans(13, &[1, 2], FtMode::Abandon) {
        harness.submit(w, &plan);
    }
    harness.expect(QueryType::QueryReady).await;
    harness.expect(QueryType::QueryReady).await;

    // Worker 2 never starts, so worker 1 waits on it until it is removed.
    harness.send_query(1, QueryMessage::start(13));
    let partition = harness.worker(1).0.partition(13).unwrap();
    until(|| partition.state() == PartitionState::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.inbox.try_recv().is_err());

    harness.send_control(1, ControlMessage::remove_worker(2));
    let (from, done) = harness.expect(QueryType::QueryComplete).await;
    assert_eq!((from, done.query_id), (1, 13));
    assert_eq!(partition.state(), PartitionState::Succeeded);
    assert_eq!(rows(&harness.worker(1).1, &gathered()), vec![1, 4]);

    harness.send_query(2, QueryMessage::kill(13, "abandoned"));
    harness.expect(QueryType::QueryFailure).await;
    harness.stop().await;
}

#[tokio::test]
async fn membership_changes_are_acknowledged() {
    let mut harness = Harness::start(&[1, 2]).await;

    harness.send_control(1, ControlMessage::remove_worker(2));
    let (from, ack) = harness.expect_control(ControlType::RemoveWorkerAck).await;
    assert_eq!((from, ack.worker_id), (1, 2));
    assert_eq!(harness.worker(1).0.fabric().link_state(2), LinkState::Closed);

    harness.send_control(1, ControlMessage::add_worker(2, "local:2"));
    let (from, ack) = harness.expect_control(ControlType::AddWorkerAck).await;
    assert_eq!((from, ack.worker_id), (1, 2));
    assert_ne!(harness.worker(1).0.fabric().link_state(2), LinkState::Closed);
    harness.stop().await;
}

#[tokio::test]
async fn heartbeats_follow_the_configured_interval() {
    let mut harness = Harness::start(&[1]).await;
    let interval = Settings::local(1).heartbeat_interval();

    let window = interval * 5;
    tokio::time::sleep(window).await;
    let mut beats = 0;
    while let Ok((from, message)) = harness.controls.try_recv() {
        assert_eq!(from, 1);
        assert_eq!(message.control_type(), Some(ControlType::Heartbeat));
        assert_eq!(message.worker_id, 1);
        beats += 1;
    }
    // One immediate beat plus one per elapsed interval, give or take timer jitter.
    assert!((3..=7).contains(&beats), "{beats} heartbeats in {window:?}");
    harness.stop().await;
}

#[tokio::test]
async fn start_and_kill_for_unknown_queries_are_ignored() {
    let mut harness = Harness::start(&[1]).await;
    harness.send_query(1, QueryMessage::start(404));
    harness.send_query(1, QueryMessage::kill(404, "nothing to kill"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.inbox.try_recv().is_err());
    assert!(harness.worker(1).0.partition(404).is_none());

    harness.worker(1).1.load(numbers(), vec![ints(vec![8])]);
    for (w, plan) in gather_plans(405, &[1], FtMode::None) {
        harness.submit(w, &plan);
    }
    harness.expect(QueryType::QueryReady).await;
    harness.send_query(1, QueryMessage::start(405));
    harness.expect(QueryType::QueryComplete).await;
    harness.stop().await;
}
