use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::CatalogKind;
use crate::store::StoreError;

/// Existence checks against the client/pet/employee/service catalog.
#[async_trait]
pub trait CatalogLookup: Send + Sync {
    async fn exists(&self, kind: CatalogKind, id: &str) -> Result<bool, StoreError>;
}

/// Catalog backed by in-process sets. Useful for embedding and tests.
#[derive(Default)]
pub struct InMemoryCatalog {
    entries: DashMap<CatalogKind, HashSet<String>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: CatalogKind, id: impl Into<String>) {
        self.entries.entry(kind).or_default().insert(id.into());
    }

    pub fn remove(&self, kind: CatalogKind, id: &str) {
        if let Some(mut set) = self.entries.get_mut(&kind) {
            set.remove(id);
        }
    }
}

#[async_trait]
impl CatalogLookup for InMemoryCatalog {
    async fn exists(&self, kind: CatalogKind, id: &str) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .get(&kind)
            .is_some_and(|set| set.contains(id)))
    }
}
