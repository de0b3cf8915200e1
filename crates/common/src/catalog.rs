use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};
use crate::ids::WorkerId;
use crate::schema::Schema;

/// Fully qualified name of a stored relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationKey {
    pub user: String,
    pub program: String,
    pub relation: String,
}

impl RelationKey {
    pub fn new(user: &str, program: &str, relation: &str) -> Self {
        Self {
            user: user.to_string(),
            program: program.to_string(),
            relation: relation.to_string(),
        }
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.user, self.program, self.relation)
    }
}

/// Read access to cluster metadata used while compiling a plan.
pub trait Catalog: Send + Sync {
    /// Workers holding a partition of `relation`, or `None` if it is unknown.
    fn workers_for_relation(&self, relation: &RelationKey) -> Option<BTreeSet<WorkerId>>;

    /// Workers currently considered alive (the coordinator is never included).
    fn alive_workers(&self) -> BTreeSet<WorkerId>;

    fn configuration_value(&self, key: &str) -> Option<String>;

    fn schema(&self, relation: &RelationKey) -> Result<Schema>;
}

struct RelationEntry {
    schema: Schema,
    workers: BTreeSet<WorkerId>,
}

/// In-memory [`Catalog`] backed by concurrent maps.
#[derive(Default)]
pub struct MemoryCatalog {
    relations: DashMap<RelationKey, RelationEntry>,
    alive: DashSet<WorkerId>,
    configuration: DashMap<String, String>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_relation(
        &self,
        relation: RelationKey,
        schema: Schema,
        workers: impl IntoIterator<Item = WorkerId>,
    ) {
        let workers = workers.into_iter().collect();
        self.relations
            .insert(relation, RelationEntry { schema, workers });
    }

    pub fn set_alive(&self, worker: WorkerId, alive: bool) {
        if alive {
            self.alive.insert(worker);
        } else {
            self.alive.remove(&worker);
        }
    }

    pub fn set_configuration(&self, key: &str, value: &str) {
        self.configuration
            .insert(key.to_string(), value.to_string());
    }
}

impl Catalog for MemoryCatalog {
    fn workers_for_relation(&self, relation: &RelationKey) -> Option<BTreeSet<WorkerId>> {
        self.relations
            .get(relation)
            .map(|entry| entry.workers.clone())
    }

    fn alive_workers(&self) -> BTreeSet<WorkerId> {
        self.alive.iter().map(|w| *w).collect()
    }

    fn configuration_value(&self, key: &str) -> Option<String> {
        self.configuration.get(key).map(|v| v.value().clone())
    }

    fn schema(&self, relation: &RelationKey) -> Result<Schema> {
        self.relations
            .get(relation)
            .map(|entry| entry.schema.clone())
            .ok_or_else(|| Error::Catalog(format!("relation {relation} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Type;

    #[test]
    fn registers_and_resolves_relations() {
        let catalog = MemoryCatalog::new();
        let key = RelationKey::new("public", "adhoc", "edges");
        catalog.register_relation(key.clone(), Schema::of(&[("src", Type::Int)]), [2, 1]);

        let workers = catalog.workers_for_relation(&key).unwrap();
        assert_eq!(workers.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(catalog.schema(&key).unwrap().len(), 1);

        let missing = RelationKey::new("public", "adhoc", "nodes");
        assert!(catalog.workers_for_relation(&missing).is_none());
        assert!(catalog.schema(&missing).is_err());
    }

    #[test]
    fn tracks_liveness() {
        let catalog = MemoryCatalog::new();
        catalog.set_alive(1, true);
        catalog.set_alive(2, true);
        catalog.set_alive(1, false);
        assert_eq!(catalog.alive_workers().into_iter().collect::<Vec<_>>(), vec![2]);
    }
}
