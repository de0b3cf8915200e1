//! Symbolic plan encodings accepted from the front door.
//!
//! Operators reference each other by `opId`: `argChild` and friends point at
//! operators in the same fragment, `argOperatorId` on a consumer names the
//! producing operator, which may live in any fragment.

use serde::{Deserialize, Serialize};
use tessel_common::{ExecutionOptions, RelationKey, WorkerId};
use tessel_engine::Predicate;

pub type OpId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "opType", rename_all_fields = "camelCase")]
pub enum OperatorEncoding {
    TableScan {
        op_id: OpId,
        relation_key: RelationKey,
    },
    Filter {
        op_id: OpId,
        arg_child: OpId,
        predicate: Predicate,
    },
    Project {
        op_id: OpId,
        arg_child: OpId,
        columns: Vec<usize>,
    },
    UnionAll {
        op_id: OpId,
        arg_children: Vec<OpId>,
    },
    /// Reads everything the producer's workers send.
    Consumer {
        op_id: OpId,
        arg_operator_id: OpId,
    },
    /// Like `Consumer`, but its fragment runs on a single worker.
    CollectConsumer {
        op_id: OpId,
        arg_operator_id: OpId,
    },
    BroadcastConsumer {
        op_id: OpId,
        arg_operator_id: OpId,
    },
    ShuffleConsumer {
        op_id: OpId,
        arg_operator_id: OpId,
    },
    CollectProducer {
        op_id: OpId,
        arg_child: OpId,
    },
    BroadcastProducer {
        op_id: OpId,
        arg_child: OpId,
    },
    ShuffleProducer {
        op_id: OpId,
        arg_child: OpId,
        keys: Vec<usize>,
    },
    IdbController {
        op_id: OpId,
        self_idb_id: i32,
        arg_initial_input: OpId,
        arg_iteration_input: OpId,
        arg_eos_controller_input: OpId,
    },
    EosController {
        op_id: OpId,
        arg_child: OpId,
    },
    SinkRoot {
        op_id: OpId,
        arg_child: OpId,
    },
    DbInsert {
        op_id: OpId,
        arg_child: OpId,
        relation_key: RelationKey,
        #[serde(default)]
        arg_overwrite_table: bool,
    },
}

/// What the compiler needs to know about an operator, independent of its
/// concrete kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role<'a> {
    Scan(&'a RelationKey),
    /// Sends data over exchange channels.
    Producer,
    /// Reads the channels of `source`.
    Consumer { source: OpId, single_destination: bool },
    /// Iterative unit: seed, feedback and controller inputs.
    Iterative {
        seed: OpId,
        feedback: OpId,
        control: OpId,
    },
    Local,
}

impl OperatorEncoding {
    pub fn op_id(&self) -> OpId {
        match self {
            OperatorEncoding::TableScan { op_id, .. }
            | OperatorEncoding::Filter { op_id, .. }
            | OperatorEncoding::Project { op_id, .. }
            | OperatorEncoding::UnionAll { op_id, .. }
            | OperatorEncoding::Consumer { op_id, .. }
            | OperatorEncoding::CollectConsumer { op_id, .. }
            | OperatorEncoding::BroadcastConsumer { op_id, .. }
            | OperatorEncoding::ShuffleConsumer { op_id, .. }
            | OperatorEncoding::CollectProducer { op_id, .. }
            | OperatorEncoding::BroadcastProducer { op_id, .. }
            | OperatorEncoding::ShuffleProducer { op_id, .. }
            | OperatorEncoding::IdbController { op_id, .. }
            | OperatorEncoding::EosController { op_id, .. }
            | OperatorEncoding::SinkRoot { op_id, .. }
            | OperatorEncoding::DbInsert { op_id, .. } => *op_id,
        }
    }

    pub fn role(&self) -> Role<'_> {
        match self {
            OperatorEncoding::TableScan { relation_key, .. } => Role::Scan(relation_key),
            OperatorEncoding::Consumer {
                arg_operator_id, ..
            }
            | OperatorEncoding::BroadcastConsumer {
                arg_operator_id, ..
            }
            | OperatorEncoding::ShuffleConsumer {
                arg_operator_id, ..
            } => Role::Consumer {
                source: *arg_operator_id,
                single_destination: false,
            },
            OperatorEncoding::CollectConsumer {
                arg_operator_id, ..
            } => Role::Consumer {
                source: *arg_operator_id,
                single_destination: true,
            },
            OperatorEncoding::CollectProducer { .. }
            | OperatorEncoding::BroadcastProducer { .. }
            | OperatorEncoding::ShuffleProducer { .. }
            | OperatorEncoding::EosController { .. } => Role::Producer,
            OperatorEncoding::IdbController {
                arg_initial_input,
                arg_iteration_input,
                arg_eos_controller_input,
                ..
            } => Role::Iterative {
                seed: *arg_initial_input,
                feedback: *arg_iteration_input,
                control: *arg_eos_controller_input,
            },
            OperatorEncoding::Filter { .. }
            | OperatorEncoding::Project { .. }
            | OperatorEncoding::UnionAll { .. }
            | OperatorEncoding::SinkRoot { .. }
            | OperatorEncoding::DbInsert { .. } => Role::Local,
        }
    }

    /// Terminal operators drive their fragment.
    pub fn is_root(&self) -> bool {
        matches!(
            self,
            OperatorEncoding::CollectProducer { .. }
                | OperatorEncoding::BroadcastProducer { .. }
                | OperatorEncoding::ShuffleProducer { .. }
                | OperatorEncoding::EosController { .. }
                | OperatorEncoding::SinkRoot { .. }
                | OperatorEncoding::DbInsert { .. }
        )
    }

    /// Same-fragment inputs, in argument order.
    pub fn children(&self) -> Vec<OpId> {
        match self {
            OperatorEncoding::TableScan { .. }
            | OperatorEncoding::Consumer { .. }
            | OperatorEncoding::CollectConsumer { .. }
            | OperatorEncoding::BroadcastConsumer { .. }
            | OperatorEncoding::ShuffleConsumer { .. } => Vec::new(),
            OperatorEncoding::Filter { arg_child, .. }
            | OperatorEncoding::Project { arg_child, .. }
            | OperatorEncoding::CollectProducer { arg_child, .. }
            | OperatorEncoding::BroadcastProducer { arg_child, .. }
            | OperatorEncoding::ShuffleProducer { arg_child, .. }
            | OperatorEncoding::EosController { arg_child, .. }
            | OperatorEncoding::SinkRoot { arg_child, .. }
            | OperatorEncoding::DbInsert { arg_child, .. } => vec![*arg_child],
            OperatorEncoding::UnionAll { arg_children, .. } => arg_children.clone(),
            OperatorEncoding::IdbController {
                arg_initial_input,
                arg_iteration_input,
                arg_eos_controller_input,
                ..
            } => vec![
                *arg_initial_input,
                *arg_iteration_input,
                *arg_eos_controller_input,
            ],
        }
    }
}

/// One fragment as submitted: its operators and, optionally, the workers
/// it must run on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFragmentEncoding {
    pub operators: Vec<OperatorEncoding>,
    #[serde(default, alias = "overrideWorkers")]
    pub workers: Option<Vec<WorkerId>>,
}

impl PlanFragmentEncoding {
    pub fn new(operators: Vec<OperatorEncoding>) -> Self {
        Self {
            operators,
            workers: None,
        }
    }

    pub fn on_workers(mut self, workers: Vec<WorkerId>) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// A whole query as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryEncoding {
    pub fragments: Vec<PlanFragmentEncoding>,
    #[serde(default)]
    pub options: ExecutionOptions,
}
