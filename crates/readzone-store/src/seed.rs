//! JSON fixtures for populating a store: `{ "books": [...], "drafts": [...] }`.

use std::path::Path;

use readzone_core::{CanonicalBook, Draft};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{MemoryCatalog, MemoryStore, StoreError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub books: Vec<CanonicalBook>,
    #[serde(default)]
    pub drafts: Vec<Draft>,
}

impl Seed {
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, StoreError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Build in-memory stores holding this seed.
    pub async fn into_memory(self) -> (MemoryStore, MemoryCatalog) {
        info!(
            books = self.books.len(),
            drafts = self.drafts.len(),
            "seeding in-memory stores"
        );
        let store = MemoryStore::new();
        for draft in self.drafts {
            store.insert_draft(draft).await;
        }
        (store, MemoryCatalog::with_books(self.books))
    }
}
