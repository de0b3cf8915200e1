//! Physical plan descriptions shipped from the coordinator to workers.
//!
//! Every channel, worker set and schema is already resolved; a worker only
//! has to turn a [`PlanNode`] tree into operators.

use serde::{Deserialize, Serialize};
use tessel_common::{ChannelId, ExecutionOptions, QueryId, RelationKey, Schema, WorkerId};

use crate::expr::Predicate;

/// One producer output: a channel and the workers that consume it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeEdge {
    pub channel: ChannelId,
    pub destinations: Vec<WorkerId>,
}

/// How a producer spreads rows over the destinations of an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Partitioning {
    /// Everything goes to the single destination.
    Collect,
    /// Every batch goes to every destination.
    Broadcast,
    /// Rows are spread by a hash of the key columns.
    Hash { keys: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanNode {
    TableScan {
        relation: RelationKey,
        schema: Schema,
    },
    Filter {
        child: Box<PlanNode>,
        predicate: Predicate,
    },
    Project {
        child: Box<PlanNode>,
        columns: Vec<usize>,
    },
    UnionAll {
        children: Vec<PlanNode>,
    },
    Consumer {
        channel: ChannelId,
        sources: Vec<WorkerId>,
        schema: Schema,
    },
    Producer {
        child: Box<PlanNode>,
        partitioning: Partitioning,
        outputs: Vec<ExchangeEdge>,
    },
    IdbController {
        idb_id: i32,
        seed: Box<PlanNode>,
        feedback: Box<PlanNode>,
        control: Box<PlanNode>,
        /// Where end-of-iteration reports go.
        controller: ExchangeEdge,
    },
    EosController {
        child: Box<PlanNode>,
        /// Every `(idb_id, worker)` that reports each round.
        participants: Vec<(i32, WorkerId)>,
        outputs: Vec<ExchangeEdge>,
    },
    SinkRoot {
        child: Box<PlanNode>,
    },
    InsertRoot {
        child: Box<PlanNode>,
        relation: RelationKey,
        overwrite: bool,
    },
}

impl PlanNode {
    pub fn is_root(&self) -> bool {
        matches!(
            self,
            PlanNode::Producer { .. }
                | PlanNode::EosController { .. }
                | PlanNode::SinkRoot { .. }
                | PlanNode::InsertRoot { .. }
        )
    }

    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::TableScan { .. } | PlanNode::Consumer { .. } => Vec::new(),
            PlanNode::Filter { child, .. }
            | PlanNode::Project { child, .. }
            | PlanNode::Producer { child, .. }
            | PlanNode::EosController { child, .. }
            | PlanNode::SinkRoot { child }
            | PlanNode::InsertRoot { child, .. } => vec![child.as_ref()],
            PlanNode::UnionAll { children } => children.iter().collect(),
            PlanNode::IdbController {
                seed,
                feedback,
                control,
                ..
            } => vec![seed.as_ref(), feedback.as_ref(), control.as_ref()],
        }
    }

    /// Channels read by consumers anywhere in this tree.
    pub fn consumed_channels(&self) -> Vec<ChannelId> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let PlanNode::Consumer { channel, .. } = node {
                out.push(*channel);
            }
        });
        out
    }

    /// Channels written by producers anywhere in this tree.
    pub fn produced_channels(&self) -> Vec<ChannelId> {
        let mut out = Vec::new();
        self.walk(&mut |node| match node {
            PlanNode::Producer { outputs, .. } | PlanNode::EosController { outputs, .. } => {
                out.extend(outputs.iter().map(|e| e.channel));
            }
            PlanNode::IdbController { controller, .. } => out.push(controller.channel),
            _ => {}
        });
        out
    }

    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a PlanNode)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    pub fn node_name(&self) -> &'static str {
        match self {
            PlanNode::TableScan { .. } => "TableScan",
            PlanNode::Filter { .. } => "Filter",
            PlanNode::Project { .. } => "Project",
            PlanNode::UnionAll { .. } => "UnionAll",
            PlanNode::Consumer { .. } => "Consumer",
            PlanNode::Producer { .. } => "Producer",
            PlanNode::IdbController { .. } => "IdbController",
            PlanNode::EosController { .. } => "EosController",
            PlanNode::SinkRoot { .. } => "SinkRoot",
            PlanNode::InsertRoot { .. } => "InsertRoot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFragment {
    pub index: usize,
    pub root: PlanNode,
}

/// Everything one worker runs for one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQueryPlan {
    pub query_id: QueryId,
    pub fragments: Vec<PlanFragment>,
    pub options: ExecutionOptions,
}

impl SubQueryPlan {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            fragments: Vec::new(),
            options: ExecutionOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_common::Type;

    #[test]
    fn sub_plans_survive_bincode() {
        let consumer = PlanNode::Consumer {
            channel: ChannelId(3),
            sources: vec![1, 2],
            schema: Schema::of(&[("x", Type::Int)]),
        };
        let plan = SubQueryPlan {
            query_id: 11,
            fragments: vec![PlanFragment {
                index: 0,
                root: PlanNode::SinkRoot {
                    child: Box::new(PlanNode::Filter {
                        child: Box::new(consumer),
                        predicate: Predicate::compare(0, crate::CmpOp::Gt, crate::Literal::Int(1)),
                    }),
                },
            }],
            options: ExecutionOptions::default(),
        };
        let bytes = bincode::serialize(&plan).unwrap();
        let back: SubQueryPlan = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.fragments[0].root.consumed_channels(), vec![ChannelId(3)]);
        assert!(back.fragments[0].root.is_root());
    }
}
