//! Storage boundary: where scans read from and insert roots write to.

use dashmap::DashMap;
use tessel_common::{Error, RelationKey, Result, TupleBatch};

pub trait Storage: Send + Sync {
    fn scan(&self, relation: &RelationKey) -> Result<Vec<TupleBatch>>;

    fn insert(&self, relation: &RelationKey, batch: TupleBatch) -> Result<()>;

    /// Drops all stored rows of `relation`; unknown relations are a no-op.
    fn truncate(&self, relation: &RelationKey) -> Result<()>;
}

/// Per-worker in-memory storage.
#[derive(Default)]
pub struct MemoryStorage {
    relations: DashMap<RelationKey, Vec<TupleBatch>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, relation: RelationKey, batches: Vec<TupleBatch>) {
        self.relations.insert(relation, batches);
    }

    pub fn num_rows(&self, relation: &RelationKey) -> usize {
        self.relations
            .get(relation)
            .map(|b| b.iter().map(TupleBatch::num_rows).sum())
            .unwrap_or(0)
    }
}

impl Storage for MemoryStorage {
    fn scan(&self, relation: &RelationKey) -> Result<Vec<TupleBatch>> {
        self.relations
            .get(relation)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::Catalog(format!("relation {relation} is not stored here")))
    }

    fn insert(&self, relation: &RelationKey, batch: TupleBatch) -> Result<()> {
        self.relations
            .entry(relation.clone())
            .or_default()
            .push(batch);
        Ok(())
    }

    fn truncate(&self, relation: &RelationKey) -> Result<()> {
        if let Some(mut batches) = self.relations.get_mut(relation) {
            batches.clear();
        }
        Ok(())
    }
}
