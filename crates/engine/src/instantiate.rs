//! Turns resolved plan trees into operator trees.

use tessel_common::{Error, Result};

use crate::exchange::{Consumer, Producer};
use crate::iterative::{EosController, IdbController};
use crate::operator::Operator;
use crate::operators::{Filter, InsertRoot, Project, SinkRoot, TableScan, UnionAll};
use crate::plan::{Partitioning, PlanNode};

/// Builds the operator tree for `node`, checking what can be checked
/// before any data moves.
pub fn instantiate(node: &PlanNode) -> Result<Box<dyn Operator>> {
    let op: Box<dyn Operator> = match node {
        PlanNode::TableScan { relation, schema } => {
            Box::new(TableScan::new(relation.clone(), schema.clone()))
        }
        PlanNode::Filter { child, predicate } => {
            Box::new(Filter::new(instantiate(child)?, predicate.clone())?)
        }
        PlanNode::Project { child, columns } => {
            Box::new(Project::new(instantiate(child)?, columns.clone())?)
        }
        PlanNode::UnionAll { children } => {
            let children = children.iter().map(instantiate).collect::<Result<Vec<_>>>()?;
            Box::new(UnionAll::new(children)?)
        }
        PlanNode::Consumer {
            channel,
            sources,
            schema,
        } => {
            if sources.is_empty() {
                return Err(Error::plan(format!("consumer of {channel} has no sources")));
            }
            Box::new(Consumer::new(*channel, sources.clone(), schema.clone()))
        }
        PlanNode::Producer {
            child,
            partitioning,
            outputs,
        } => {
            if outputs.is_empty() {
                return Err(Error::plan("producer without outputs"));
            }
            for edge in outputs {
                if edge.destinations.is_empty() {
                    return Err(Error::plan(format!("{} has no destinations", edge.channel)));
                }
                if *partitioning == Partitioning::Collect && edge.destinations.len() != 1 {
                    return Err(Error::plan(format!(
                        "collect edge {} has {} destinations",
                        edge.channel,
                        edge.destinations.len()
                    )));
                }
            }
            if let Partitioning::Hash { keys } = partitioning {
                if keys.is_empty() {
                    return Err(Error::plan("shuffle without key columns"));
                }
            }
            Box::new(Producer::new(
                instantiate(child)?,
                partitioning.clone(),
                outputs.clone(),
            ))
        }
        PlanNode::IdbController {
            idb_id,
            seed,
            feedback,
            control,
            controller,
        } => Box::new(IdbController::new(
            *idb_id,
            instantiate(seed)?,
            instantiate(feedback)?,
            instantiate(control)?,
            controller.clone(),
        )?),
        PlanNode::EosController {
            child,
            participants,
            outputs,
        } => {
            if participants.is_empty() {
                return Err(Error::plan("end-of-stream controller without participants"));
            }
            Box::new(EosController::new(
                instantiate(child)?,
                participants.clone(),
                outputs.clone(),
            )?)
        }
        PlanNode::SinkRoot { child } => Box::new(SinkRoot::new(instantiate(child)?)),
        PlanNode::InsertRoot {
            child,
            relation,
            overwrite,
        } => Box::new(InsertRoot::new(instantiate(child)?, relation.clone(), *overwrite)),
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    use arrow::array::{Int32Array, StringArray};
    use tessel_api::proto::transport_envelope::Payload;
    use tessel_api::TransportEnvelope;
    use tessel_common::{ChannelId, ExecutionOptions, RelationKey, Schema, TupleBatch, Type, WorkerId};
    use tokio::sync::Notify;

    use super::*;
    use crate::eoi_report_schema;
    use crate::exchange::{BufferSettings, ChannelRegistry, MissingWorkers};
    use crate::fabric::{Fabric, InboundHandler, LocalNetwork};
    use crate::operator::{ExecContext, Ready};
    use crate::plan::ExchangeEdge;
    use crate::storage::{MemoryStorage, Storage};

    struct Router(Arc<ChannelRegistry>);

    impl InboundHandler for Router {
        fn deliver(&self, from: WorkerId, envelope: TransportEnvelope) {
            if let Some(Payload::Data(frame)) = envelope.payload {
                self.0.route(from, frame);
            }
        }
    }

    struct Node {
        ctx: ExecContext,
        storage: Arc<MemoryStorage>,
    }

    fn node(net: &Arc<LocalNetwork>, id: WorkerId) -> Node {
        let registry = Arc::new(ChannelRegistry::new());
        let storage = Arc::new(MemoryStorage::new());
        let fabric: Arc<dyn Fabric> = net.attach(id, Arc::new(Router(registry.clone())));
        let ctx = ExecContext {
            query_id: 1,
            worker_id: id,
            fragment: 0,
            options: ExecutionOptions::default(),
            fabric,
            registry,
            storage: storage.clone(),
            missing: Arc::new(MissingWorkers::default()),
            buffers: BufferSettings::default(),
            waker: Arc::new(Notify::new()),
        };
        Node { ctx, storage }
    }

    fn schema() -> Schema {
        Schema::of(&[("x", Type::Int)])
    }

    fn ints(values: Vec<i32>) -> TupleBatch {
        TupleBatch::try_new(schema(), vec![Arc::new(Int32Array::from(values))]).unwrap()
    }

    fn stored(storage: &MemoryStorage, relation: &RelationKey) -> Vec<i32> {
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

    /// Opens every fragment first, then pulls them round-robin to the end.
    /// Returns the batches each fragment's root produced.
    async fn run(fragments: Vec<(PlanNode, ExecContext)>) -> Vec<Vec<TupleBatch>> {
        let mut produced = vec![Vec::new(); fragments.len()];
        let mut running = Vec::new();
        for (i, (plan, ctx)) in fragments.into_iter().enumerate() {
            let mut ctx = ctx.for_fragment(i);
            let mut op = instantiate(&plan).unwrap();
            op.open(&mut ctx).unwrap();
            running.push(Some(op));
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while running.iter().any(Option::is_some) {
                let mut progressed = false;
                for (i, slot) in running.iter_mut().enumerate() {
                    let Some(op) = slot else { continue };
                    match op.next_ready().unwrap() {
                        Ready::NotReady => {}
                        Ready::EndOfStream => {
                            op.close().unwrap();
                            *slot = None;
                            progressed = true;
                        }
                        Ready::Batch(batch) => {
                            produced[i].push(batch);
                            progressed = true;
                        }
                        Ready::EndOfIteration => progressed = true,
                    }
                }
                if !progressed {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        })
        .await
        .unwrap();
        produced
    }

    #[tokio::test]
    async fn collected_rows_keep_schema_and_per_source_order() {
        let net = LocalNetwork::new();
        let nodes: Vec<Node> = (1..=3).map(|id| node(&net, id)).collect();
        for a in &nodes {
            for b in &nodes {
                a.ctx.fabric.add_remote(b.ctx.worker_id, "").unwrap();
            }
        }

        let labelled = Schema::of(&[("x", Type::Int), ("label", Type::String)]);
        let batch = |values: std::ops::Range<i32>| {
            let labels: Vec<String> = values.clone().map(|v| format!("row{v}")).collect();
            TupleBatch::try_new(
                labelled.clone(),
                vec![
                    Arc::new(Int32Array::from(values.collect::<Vec<_>>())),
                    Arc::new(StringArray::from(labels)),
                ],
            )
            .unwrap()
        };
        let input = RelationKey::new("public", "adhoc", "labelled");
        nodes[0]
            .storage
            .load(input.clone(), vec![batch(0..4), batch(4..8), batch(8..12)]);
        nodes[1]
            .storage
            .load(input.clone(), vec![batch(1000..1003), batch(1003..1006)]);

        let channel = ChannelId::next();
        let producer = PlanNode::Producer {
            child: Box::new(PlanNode::TableScan {
                relation: input,
                schema: labelled.clone(),
            }),
            partitioning: Partitioning::Collect,
            outputs: vec![ExchangeEdge {
                channel,
                destinations: vec![3],
            }],
        };
        let consumer = PlanNode::SinkRoot {
            child: Box::new(PlanNode::Consumer {
                channel,
                sources: vec![1, 2],
                schema: labelled.clone(),
            }),
        };

        let produced = run(vec![
            (consumer, nodes[2].ctx.clone()),
            (producer.clone(), nodes[0].ctx.clone()),
            (producer, nodes[1].ctx.clone()),
        ])
        .await;

        let mut from_first = Vec::new();
        let mut from_second = Vec::new();
        for batch in &produced[0] {
            assert_eq!(batch.schema(), &labelled);
            let xs = batch.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
            let labels = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
            for (x, label) in xs.values().iter().zip(labels.iter()) {
                assert_eq!(label, Some(format!("row{x}").as_str()));
                if *x < 1000 {
                    from_first.push(*x);
                } else {
                    from_second.push(*x);
                }
            }
        }
        assert_eq!(from_first, (0..12).collect::<Vec<_>>());
        assert_eq!(from_second, (1000..1006).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn shuffle_places_each_key_on_one_worker() {
        let net = LocalNetwork::new();
        let a = node(&net, 1);
        let b = node(&net, 2);
        a.ctx.fabric.add_remote(2, "").unwrap();
        b.ctx.fabric.add_remote(1, "").unwrap();

        let input = RelationKey::new("public", "adhoc", "numbers");
        let output = RelationKey::new("public", "adhoc", "spread");
        a.storage.load(input.clone(), vec![ints(vec![1, 2, 3, 4, 5])]);
        b.storage.load(input.clone(), vec![ints(vec![3, 4, 5, 6, 7, 8])]);

        let channel = ChannelId::next();
        let producer = PlanNode::Producer {
            child: Box::new(PlanNode::TableScan {
                relation: input,
                schema: schema(),
            }),
            partitioning: Partitioning::Hash { keys: vec![0] },
            outputs: vec![ExchangeEdge {
                channel,
                destinations: vec![1, 2],
            }],
        };
        let insert = PlanNode::InsertRoot {
            child: Box::new(PlanNode::Consumer {
                channel,
                sources: vec![1, 2],
                schema: schema(),
            }),
            relation: output.clone(),
            overwrite: false,
        };

        run(vec![
            (producer.clone(), a.ctx.clone()),
            (insert.clone(), a.ctx.clone()),
            (producer, b.ctx.clone()),
            (insert, b.ctx.clone()),
        ])
        .await;

        let on_a = stored(&a.storage, &output);
        let on_b = stored(&b.storage, &output);
        assert_eq!(on_a.len() + on_b.len(), 11);
        let keys_a: BTreeSet<_> = on_a.into_iter().collect();
        let keys_b: BTreeSet<_> = on_b.into_iter().collect();
        assert!(keys_a.is_disjoint(&keys_b));
        assert_eq!(keys_a.union(&keys_b).count(), 8);
    }

    #[tokio::test]
    async fn recursion_stops_at_fixpoint_with_distinct_rows() {
        let net = LocalNetwork::new();
        let a = node(&net, 1);
        let input = RelationKey::new("public", "adhoc", "seed");
        let output = RelationKey::new("public", "adhoc", "closure");
        a.storage.load(input.clone(), vec![ints(vec![1, 2, 2, 3])]);

        let feedback = ChannelId::next();
        let result = ChannelId::next();
        let reports = ChannelId::next();
        let control = ChannelId::next();

        let idb = PlanNode::Producer {
            child: Box::new(PlanNode::IdbController {
                idb_id: 0,
                seed: Box::new(PlanNode::TableScan {
                    relation: input,
                    schema: schema(),
                }),
                feedback: Box::new(PlanNode::Consumer {
                    channel: feedback,
                    sources: vec![1],
                    schema: schema(),
                }),
                control: Box::new(PlanNode::Consumer {
                    channel: control,
                    sources: vec![1],
                    schema: eoi_report_schema(),
                }),
                controller: ExchangeEdge {
                    channel: reports,
                    destinations: vec![1],
                },
            }),
            partitioning: Partitioning::Hash { keys: vec![0] },
            outputs: vec![
                ExchangeEdge {
                    channel: feedback,
                    destinations: vec![1],
                },
                ExchangeEdge {
                    channel: result,
                    destinations: vec![1],
                },
            ],
        };
        let eos = PlanNode::EosController {
            child: Box::new(PlanNode::Consumer {
                channel: reports,
                sources: vec![1],
                schema: eoi_report_schema(),
            }),
            participants: vec![(0, 1)],
            outputs: vec![ExchangeEdge {
                channel: control,
                destinations: vec![1],
            }],
        };
        let insert = PlanNode::InsertRoot {
            child: Box::new(PlanNode::Consumer {
                channel: result,
                sources: vec![1],
                schema: schema(),
            }),
            relation: output.clone(),
            overwrite: true,
        };

        run(vec![
            (idb, a.ctx.clone()),
            (eos, a.ctx.clone()),
            (insert, a.ctx.clone()),
        ])
        .await;

        assert_eq!(stored(&a.storage, &output), vec![1, 2, 3]);
    }

    #[test]
    fn collect_edge_needs_a_single_destination() {
        let plan = PlanNode::Producer {
            child: Box::new(PlanNode::TableScan {
                relation: RelationKey::new("public", "adhoc", "t"),
                schema: schema(),
            }),
            partitioning: Partitioning::Collect,
            outputs: vec![ExchangeEdge {
                channel: ChannelId::next(),
                destinations: vec![1, 2],
            }],
        };
        assert!(matches!(instantiate(&plan), Err(Error::Plan(_))));
    }

    #[test]
    fn iteration_input_must_match_seed() {
        let plan = PlanNode::IdbController {
            idb_id: 3,
            seed: Box::new(PlanNode::TableScan {
                relation: RelationKey::new("public", "adhoc", "t"),
                schema: schema(),
            }),
            feedback: Box::new(PlanNode::Consumer {
                channel: ChannelId::next(),
                sources: vec![1],
                schema: Schema::of(&[("y", Type::Long)]),
            }),
            control: Box::new(PlanNode::Consumer {
                channel: ChannelId::next(),
                sources: vec![1],
                schema: eoi_report_schema(),
            }),
            controller: ExchangeEdge {
                channel: ChannelId::next(),
                destinations: vec![1],
            },
        };
        assert!(matches!(instantiate(&plan), Err(Error::Plan(_))));
    }
}
