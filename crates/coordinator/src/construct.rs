//! Plan-fragment compiler.
//!
//! Turns symbolic fragments into one [`SubQueryPlan`] per worker in three
//! steps: resolve the worker set of every fragment, wire every consumer to
//! its producer through freshly minted channels, then build the physical
//! plan tree of every fragment with all schemas known.

use std::collections::{BTreeSet, HashMap};

use tessel_common::{
    Catalog, ChannelId, Error, ExecutionOptions, QueryId, Result, Schema, WorkerId,
};
use tessel_engine::{
    eoi_report_schema, ExchangeEdge, Partitioning, PlanFragment, PlanNode, SubQueryPlan,
};
use tracing::{debug, warn};

use crate::encoding::{OpId, OperatorEncoding, PlanFragmentEncoding, Role};

/// Compiles the fragments of one query.
#[derive(Debug, Clone)]
pub struct QueryConstruct {
    query_id: QueryId,
    allow_broadcast_fallback: bool,
}

impl QueryConstruct {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            allow_broadcast_fallback: true,
        }
    }

    /// Whether a fragment with no scan, no single-destination consumer and
    /// no explicit workers may run on every live worker.
    pub fn with_broadcast_fallback(mut self, allow: bool) -> Self {
        self.allow_broadcast_fallback = allow;
        self
    }

    /// Compiles `fragments` against `catalog`. Every failure is a
    /// [`Error::Plan`]; nothing is returned unless the whole query compiles.
    pub fn instantiate(
        &self,
        fragments: &[PlanFragmentEncoding],
        catalog: &dyn Catalog,
    ) -> Result<HashMap<WorkerId, SubQueryPlan>> {
        if fragments.is_empty() {
            return Err(Error::plan("query has no fragments"));
        }
        let index = OpIndex::build(fragments)?;
        let workers = fragments
            .iter()
            .enumerate()
            .map(|(i, f)| self.resolve_workers(i, f, catalog))
            .collect::<Result<Vec<_>>>()?;
        let wiring = Wiring::collect(fragments, &index)?;

        let mut builder = FragmentBuilder {
            fragments,
            index: &index,
            workers: &workers,
            wiring: &wiring,
            catalog,
            states: vec![BuildState::Pending; fragments.len()],
            schemas: HashMap::new(),
        };
        for i in 0..fragments.len() {
            builder.build(i)?;
        }

        let mut plans: HashMap<WorkerId, SubQueryPlan> = HashMap::new();
        for (i, state) in builder.states.into_iter().enumerate() {
            let BuildState::Done(root) = state else {
                return Err(Error::plan(format!("fragment {i} was not built")));
            };
            for w in &workers[i] {
                plans
                    .entry(*w)
                    .or_insert_with(|| SubQueryPlan::new(self.query_id))
                    .fragments
                    .push(PlanFragment {
                        index: i,
                        root: root.clone(),
                    });
            }
        }
        debug!(
            query_id = self.query_id,
            fragments = fragments.len(),
            workers = plans.len(),
            "compiled query"
        );
        Ok(plans)
    }

    fn resolve_workers(
        &self,
        fragment: usize,
        encoding: &PlanFragmentEncoding,
        catalog: &dyn Catalog,
    ) -> Result<BTreeSet<WorkerId>> {
        if let Some(explicit) = &encoding.workers {
            if explicit.is_empty() {
                return Err(Error::plan(format!("fragment {fragment} has an empty worker set")));
            }
            return Ok(explicit.iter().copied().collect());
        }

        let mut scanned: Option<BTreeSet<WorkerId>> = None;
        let mut single_destination = false;
        for op in &encoding.operators {
            match op.role() {
                Role::Scan(relation) => {
                    let placement = catalog.workers_for_relation(relation).ok_or_else(|| {
                        Error::plan(format!("no placement known for relation {relation}"))
                    })?;
                    if placement.is_empty() {
                        return Err(Error::plan(format!("relation {relation} is stored nowhere")));
                    }
                    match &scanned {
                        Some(previous) if *previous != placement => {
                            return Err(Error::plan(format!(
                                "fragment {fragment} scans relations on different workers: {previous:?} and {placement:?}"
                            )));
                        }
                        Some(_) => {}
                        None => scanned = Some(placement),
                    }
                }
                Role::Consumer {
                    single_destination: true,
                    ..
                } => single_destination = true,
                _ => {}
            }
        }
        if let Some(workers) = scanned {
            return Ok(workers);
        }

        let alive = catalog.alive_workers();
        if single_destination {
            let chosen = alive.iter().next().copied().ok_or_else(|| {
                Error::plan(format!("no live worker to run fragment {fragment}"))
            })?;
            return Ok(BTreeSet::from([chosen]));
        }
        if !self.allow_broadcast_fallback {
            return Err(Error::plan(format!(
                "fragment {fragment} has no scan, no collecting consumer and no explicit workers"
            )));
        }
        if alive.is_empty() {
            return Err(Error::plan(format!("no live worker to run fragment {fragment}")));
        }
        warn!(
            query_id = self.query_id,
            fragment,
            workers = alive.len(),
            "fragment placed on every live worker"
        );
        Ok(alive)
    }
}

/// Applies `options` to every sub-plan of a query.
pub fn set_execution_options(plans: &mut HashMap<WorkerId, SubQueryPlan>, options: ExecutionOptions) {
    for plan in plans.values_mut() {
        plan.options = options;
    }
}

struct OpIndex<'a> {
    ops: HashMap<OpId, (usize, &'a OperatorEncoding)>,
}

impl<'a> OpIndex<'a> {
    fn build(fragments: &'a [PlanFragmentEncoding]) -> Result<Self> {
        let mut ops = HashMap::new();
        for (i, fragment) in fragments.iter().enumerate() {
            if fragment.operators.is_empty() {
                return Err(Error::plan(format!("fragment {i} has no operators")));
            }
            for op in &fragment.operators {
                if ops.insert(op.op_id(), (i, op)).is_some() {
                    return Err(Error::plan(format!("operator id {} is used twice", op.op_id())));
                }
            }
        }
        Ok(Self { ops })
    }

    fn get(&self, id: OpId) -> Result<(usize, &'a OperatorEncoding)> {
        self.ops
            .get(&id)
            .copied()
            .ok_or_else(|| Error::plan(format!("operator {id} is not defined")))
    }
}

/// Channel assignments collected in a first pass and read while building.
#[derive(Default)]
struct Wiring {
    /// Channels written by each producing operator, in minting order.
    produced: HashMap<OpId, Vec<ChannelId>>,
    /// The channel each consumer reads.
    consumed: HashMap<OpId, ChannelId>,
    /// Fragment of the consumer at the far end of each channel.
    reader: HashMap<ChannelId, usize>,
    /// Feedback consumer -> its iterative unit.
    feedback_of: HashMap<OpId, OpId>,
    /// Controller-input consumer -> its iterative unit.
    control_of: HashMap<OpId, OpId>,
    /// End-of-stream controller -> the iterative units it stops.
    stops: HashMap<OpId, Vec<OpId>>,
}

impl Wiring {
    fn collect(fragments: &[PlanFragmentEncoding], index: &OpIndex<'_>) -> Result<Self> {
        let mut wiring = Wiring::default();
        for (i, fragment) in fragments.iter().enumerate() {
            for op in &fragment.operators {
                match op.role() {
                    Role::Consumer { source, .. } => {
                        let (_, producer) = index.get(source)?;
                        if !matches!(producer.role(), Role::Producer | Role::Iterative { .. }) {
                            return Err(Error::plan(format!(
                                "consumer {} reads operator {source}, which produces nothing",
                                op.op_id()
                            )));
                        }
                        let channel = ChannelId::next();
                        wiring.produced.entry(source).or_default().push(channel);
                        wiring.consumed.insert(op.op_id(), channel);
                        wiring.reader.insert(channel, i);
                    }
                    Role::Iterative {
                        feedback, control, ..
                    } => {
                        let (_, feedback_op) = index.get(feedback)?;
                        if !matches!(feedback_op.role(), Role::Consumer { .. }) {
                            return Err(Error::plan(format!(
                                "iteration input {feedback} of {} is not a consumer",
                                op.op_id()
                            )));
                        }
                        let (_, control_op) = index.get(control)?;
                        let Role::Consumer { source, .. } = control_op.role() else {
                            return Err(Error::plan(format!(
                                "controller input {control} of {} is not a consumer",
                                op.op_id()
                            )));
                        };
                        let (_, eos) = index.get(source)?;
                        if !matches!(eos, OperatorEncoding::EosController { .. }) {
                            return Err(Error::plan(format!(
                                "controller input {control} of {} does not read an end-of-stream controller",
                                op.op_id()
                            )));
                        }
                        wiring.feedback_of.insert(feedback, op.op_id());
                        wiring.control_of.insert(control, op.op_id());
                        wiring.stops.entry(source).or_default().push(op.op_id());
                    }
                    Role::Scan(_) | Role::Producer | Role::Local => {}
                }
            }
        }
        for fragment in fragments {
            for op in &fragment.operators {
                let producing = matches!(op.role(), Role::Producer | Role::Iterative { .. });
                if producing && !wiring.produced.contains_key(&op.op_id()) {
                    return Err(Error::plan(format!("operator {} has no consumers", op.op_id())));
                }
            }
        }
        Ok(wiring)
    }

    fn channels(&self, producer: OpId) -> &[ChannelId] {
        self.produced.get(&producer).map(Vec::as_slice).unwrap_or(&[])
    }

    fn consumed(&self, consumer: OpId) -> Result<ChannelId> {
        self.consumed
            .get(&consumer)
            .copied()
            .ok_or_else(|| Error::plan(format!("consumer {consumer} is not wired")))
    }
}

#[derive(Clone)]
enum BuildState {
    Pending,
    InProgress,
    Done(PlanNode),
}

struct FragmentBuilder<'a> {
    fragments: &'a [PlanFragmentEncoding],
    index: &'a OpIndex<'a>,
    workers: &'a [BTreeSet<WorkerId>],
    wiring: &'a Wiring,
    catalog: &'a dyn Catalog,
    states: Vec<BuildState>,
    /// Output schema of every operator built so far.
    schemas: HashMap<OpId, Schema>,
}

impl FragmentBuilder<'_> {
    /// Builds fragment `i`, first building every fragment whose producers
    /// it reads through ordinary consumers.
    fn build(&mut self, i: usize) -> Result<()> {
        match self.states[i] {
            BuildState::Done(_) => return Ok(()),
            BuildState::InProgress => {
                return Err(Error::plan(format!(
                    "fragment {i} depends on itself outside an iterative unit"
                )))
            }
            BuildState::Pending => self.states[i] = BuildState::InProgress,
        }
        let fragments = self.fragments;
        let root = find_root(i, &fragments[i])?;
        let node = match root {
            Root::Explicit(op) => self.node(i, op)?,
            Root::Legacy(op) => PlanNode::SinkRoot {
                child: Box::new(self.node(i, op)?),
            },
        };
        self.states[i] = BuildState::Done(node);
        Ok(())
    }

    fn child(&mut self, fragment: usize, parent: OpId, id: OpId) -> Result<(PlanNode, Schema)> {
        let (owner, _) = self.index.get(id)?;
        if owner != fragment {
            return Err(Error::plan(format!(
                "operator {parent} takes input {id} from another fragment"
            )));
        }
        let node = self.node(fragment, id)?;
        let schema = self.schema(id)?;
        Ok((node, schema))
    }

    fn schema(&self, id: OpId) -> Result<Schema> {
        self.schemas
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::plan(format!("schema of operator {id} is unknown")))
    }

    fn edges(&self, producer: OpId) -> Vec<ExchangeEdge> {
        self.wiring
            .channels(producer)
            .iter()
            .map(|channel| ExchangeEdge {
                channel: *channel,
                destinations: self
                    .wiring
                    .reader
                    .get(channel)
                    .map(|f| self.workers[*f].iter().copied().collect())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Output schema of the operator a consumer reads, building the
    /// producer's fragment when needed.
    fn consumed_schema(&mut self, consumer: OpId, source: OpId) -> Result<Schema> {
        if let Some(idb) = self.wiring.feedback_of.get(&consumer) {
            let (_, op) = self.index.get(*idb)?;
            let Role::Iterative { seed, .. } = op.role() else {
                return Err(Error::plan(format!("operator {idb} is not an iterative unit")));
            };
            return self.schema(seed);
        }
        if self.wiring.control_of.contains_key(&consumer) {
            return Ok(eoi_report_schema());
        }
        let (producer_fragment, producer) = self.index.get(source)?;
        if matches!(producer.role(), Role::Iterative { .. }) {
            return Ok(eoi_report_schema());
        }
        self.build(producer_fragment)?;
        self.schema(source)
    }

    fn node(&mut self, fragment: usize, id: OpId) -> Result<PlanNode> {
        let (_, op) = self.index.get(id)?;
        let (node, schema) = match op {
            OperatorEncoding::TableScan { relation_key, .. } => {
                let schema = self.catalog.schema(relation_key).map_err(|e| {
                    Error::plan(format!("cannot scan {relation_key}: {e}"))
                })?;
                (
                    PlanNode::TableScan {
                        relation: relation_key.clone(),
                        schema: schema.clone(),
                    },
                    schema,
                )
            }
            OperatorEncoding::Filter {
                arg_child,
                predicate,
                ..
            } => {
                let (child, schema) = self.child(fragment, id, *arg_child)?;
                predicate.validate(&schema)?;
                (
                    PlanNode::Filter {
                        child: Box::new(child),
                        predicate: predicate.clone(),
                    },
                    schema,
                )
            }
            OperatorEncoding::Project {
                arg_child, columns, ..
            } => {
                let (child, schema) = self.child(fragment, id, *arg_child)?;
                (
                    PlanNode::Project {
                        child: Box::new(child),
                        columns: columns.clone(),
                    },
                    schema.project(columns)?,
                )
            }
            OperatorEncoding::UnionAll { arg_children, .. } => {
                if arg_children.is_empty() {
                    return Err(Error::plan(format!("union {id} has no inputs")));
                }
                let mut children = Vec::with_capacity(arg_children.len());
                let mut schema: Option<Schema> = None;
                for c in arg_children {
                    let (child, s) = self.child(fragment, id, *c)?;
                    match &schema {
                        Some(first) if *first != s => {
                            return Err(Error::plan(format!(
                                "union {id} mixes schemas {first} and {s}"
                            )))
                        }
                        Some(_) => {}
                        None => schema = Some(s),
                    }
                    children.push(child);
                }
                let schema = schema.unwrap_or_else(Schema::empty);
                (PlanNode::UnionAll { children }, schema)
            }
            OperatorEncoding::Consumer {
                arg_operator_id, ..
            }
            | OperatorEncoding::CollectConsumer {
                arg_operator_id, ..
            }
            | OperatorEncoding::BroadcastConsumer {
                arg_operator_id, ..
            }
            | OperatorEncoding::ShuffleConsumer {
                arg_operator_id, ..
            } => {
                let schema = self.consumed_schema(id, *arg_operator_id)?;
                let (source_fragment, _) = self.index.get(*arg_operator_id)?;
                (
                    PlanNode::Consumer {
                        channel: self.wiring.consumed(id)?,
                        sources: self.workers[source_fragment].iter().copied().collect(),
                        schema: schema.clone(),
                    },
                    schema,
                )
            }
            OperatorEncoding::CollectProducer { arg_child, .. } => {
                let (child, schema) = self.child(fragment, id, *arg_child)?;
                let outputs = self.edges(id);
                if let Some(edge) = outputs.iter().find(|e| e.destinations.len() != 1) {
                    return Err(Error::plan(format!(
                        "collect producer {id} feeds {} workers through {}",
                        edge.destinations.len(),
                        edge.channel
                    )));
                }
                (
                    PlanNode::Producer {
                        child: Box::new(child),
                        partitioning: Partitioning::Collect,
                        outputs,
                    },
                    schema,
                )
            }
            OperatorEncoding::BroadcastProducer { arg_child, .. } => {
                let (child, schema) = self.child(fragment, id, *arg_child)?;
                (
                    PlanNode::Producer {
                        child: Box::new(child),
                        partitioning: Partitioning::Broadcast,
                        outputs: self.edges(id),
                    },
                    schema,
                )
            }
            OperatorEncoding::ShuffleProducer {
                arg_child, keys, ..
            } => {
                let (child, schema) = self.child(fragment, id, *arg_child)?;
                if keys.is_empty() {
                    return Err(Error::plan(format!("shuffle producer {id} has no keys")));
                }
                schema.project(keys)?;
                (
                    PlanNode::Producer {
                        child: Box::new(child),
                        partitioning: Partitioning::Hash { keys: keys.clone() },
                        outputs: self.edges(id),
                    },
                    schema,
                )
            }
            OperatorEncoding::IdbController {
                self_idb_id,
                arg_initial_input,
                arg_iteration_input,
                arg_eos_controller_input,
                ..
            } => {
                let (seed, schema) = self.child(fragment, id, *arg_initial_input)?;
                let (feedback, _) = self.child(fragment, id, *arg_iteration_input)?;
                let (control, _) = self.child(fragment, id, *arg_eos_controller_input)?;
                let mut edges = self.edges(id);
                if edges.len() != 1 || edges[0].destinations.len() != 1 {
                    return Err(Error::plan(format!(
                        "iterative unit {id} must report to one controller on one worker"
                    )));
                }
                let controller = edges.remove(0);
                (
                    PlanNode::IdbController {
                        idb_id: *self_idb_id,
                        seed: Box::new(seed),
                        feedback: Box::new(feedback),
                        control: Box::new(control),
                        controller,
                    },
                    schema,
                )
            }
            OperatorEncoding::EosController { arg_child, .. } => {
                let (child, schema) = self.child(fragment, id, *arg_child)?;
                if schema != eoi_report_schema() {
                    return Err(Error::plan(format!(
                        "end-of-stream controller {id} reads {schema}, not iteration reports"
                    )));
                }
                let mut participants = Vec::new();
                for idb in self.wiring.stops.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
                    let (idb_fragment, op) = self.index.get(*idb)?;
                    let OperatorEncoding::IdbController { self_idb_id, .. } = op else {
                        continue;
                    };
                    participants.extend(self.workers[idb_fragment].iter().map(|w| (*self_idb_id, *w)));
                }
                if participants.is_empty() {
                    return Err(Error::plan(format!(
                        "end-of-stream controller {id} controls no iterative unit"
                    )));
                }
                (
                    PlanNode::EosController {
                        child: Box::new(child),
                        participants,
                        outputs: self.edges(id),
                    },
                    schema,
                )
            }
            OperatorEncoding::SinkRoot { arg_child, .. } => {
                let (child, schema) = self.child(fragment, id, *arg_child)?;
                (
                    PlanNode::SinkRoot {
                        child: Box::new(child),
                    },
                    schema,
                )
            }
            OperatorEncoding::DbInsert {
                arg_child,
                relation_key,
                arg_overwrite_table,
                ..
            } => {
                let (child, schema) = self.child(fragment, id, *arg_child)?;
                (
                    PlanNode::InsertRoot {
                        child: Box::new(child),
                        relation: relation_key.clone(),
                        overwrite: *arg_overwrite_table,
                    },
                    schema,
                )
            }
        };
        self.schemas.insert(id, schema);
        Ok(node)
    }
}

enum Root {
    Explicit(OpId),
    /// A collecting consumer left without a root; it gets a discard root.
    Legacy(OpId),
}

/// Finds the single root of a fragment and checks that it reaches every
/// operator exactly once.
fn find_root(i: usize, fragment: &PlanFragmentEncoding) -> Result<Root> {
    let ids: BTreeSet<OpId> = fragment.operators.iter().map(OperatorEncoding::op_id).collect();
    let mut parents: HashMap<OpId, usize> = HashMap::new();
    for op in &fragment.operators {
        for child in op.children() {
            if !ids.contains(&child) {
                return Err(Error::plan(format!(
                    "operator {} of fragment {i} takes input {child} from outside the fragment",
                    op.op_id()
                )));
            }
            *parents.entry(child).or_default() += 1;
        }
    }
    if let Some((child, _)) = parents.iter().find(|(_, n)| **n > 1) {
        return Err(Error::plan(format!(
            "operator {child} of fragment {i} feeds more than one parent"
        )));
    }

    let roots: Vec<&OperatorEncoding> = fragment.operators.iter().filter(|op| op.is_root()).collect();
    let root = match roots.as_slice() {
        [root] => Root::Explicit(root.op_id()),
        [] => {
            let tops: Vec<&OperatorEncoding> = fragment
                .operators
                .iter()
                .filter(|op| !parents.contains_key(&op.op_id()))
                .collect();
            match tops.as_slice() {
                [top @ OperatorEncoding::CollectConsumer { .. }] => Root::Legacy(top.op_id()),
                _ => return Err(Error::plan(format!("fragment {i} has no root operator"))),
            }
        }
        many => {
            return Err(Error::plan(format!(
                "fragment {i} has {} root operators",
                many.len()
            )))
        }
    };
    let top = match &root {
        Root::Explicit(id) | Root::Legacy(id) => *id,
    };
    if parents.contains_key(&top) {
        return Err(Error::plan(format!("root {top} of fragment {i} has a parent")));
    }

    let by_id: HashMap<OpId, &OperatorEncoding> =
        fragment.operators.iter().map(|op| (op.op_id(), op)).collect();
    let mut reached = BTreeSet::new();
    let mut stack = vec![top];
    while let Some(id) = stack.pop() {
        if reached.insert(id) {
            if let Some(op) = by_id.get(&id) {
                stack.extend(op.children());
            }
        }
    }
    if reached.len() != ids.len() {
        let stray: Vec<_> = ids.difference(&reached).collect();
        return Err(Error::plan(format!(
            "operators {stray:?} of fragment {i} are not reachable from its root"
        )));
    }
    Ok(root)
}
