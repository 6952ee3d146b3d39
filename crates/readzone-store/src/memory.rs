//! In-memory draft store and catalog.
//!
//! `MemoryStore` keeps drafts and the audit log behind one async mutex. A
//! transaction owns the lock guard for its lifetime and stages writes, so
//! concurrent transactions on the same store serialise and an uncommitted
//! transaction leaves no trace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use readzone_core::{AuditRecord, CanonicalBook, Draft, DraftId};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::traits::{CatalogStore, DraftFilter, DraftOrder, DraftPatch, DraftStore, DraftTransaction};
use crate::StoreError;

#[derive(Debug, Default)]
struct State {
    drafts: HashMap<DraftId, Draft>,
    audit: Vec<AuditRecord>,
}

impl State {
    fn update_if_version(&mut self, id: &DraftId, expected_version: i64, patch: &DraftPatch) -> u64 {
        match self.drafts.get_mut(id) {
            Some(draft) if draft.version == expected_version => {
                patch.apply(draft);
                1
            }
            _ => 0,
        }
    }
}

/// Draft store held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a draft.
    pub async fn insert_draft(&self, draft: Draft) {
        let mut state = self.state.lock().await;
        state.drafts.insert(draft.id.clone(), draft);
    }

    /// Snapshot of the audit log, oldest first.
    pub async fn audit_log(&self) -> Vec<AuditRecord> {
        self.state.lock().await.audit.clone()
    }

    pub async fn draft_count(&self) -> usize {
        self.state.lock().await.drafts.len()
    }
}

#[async_trait]
impl DraftStore for MemoryStore {
    async fn find_by_id(&self, id: &DraftId) -> Result<Option<Draft>, StoreError> {
        Ok(self.state.lock().await.drafts.get(id).cloned())
    }

    async fn update_if_version(
        &self,
        id: &DraftId,
        expected_version: i64,
        patch: &DraftPatch,
    ) -> Result<u64, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .update_if_version(id, expected_version, patch))
    }

    async fn find_many(
        &self,
        filter: &DraftFilter,
        order: DraftOrder,
        limit: usize,
    ) -> Result<Vec<Draft>, StoreError> {
        let state = self.state.lock().await;
        let mut drafts: Vec<Draft> = state
            .drafts
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        match order {
            DraftOrder::LastAccessedDesc => drafts.sort_by(|a, b| {
                b.last_accessed
                    .cmp(&a.last_accessed)
                    .then_with(|| a.id.cmp(&b.id))
            }),
        }
        drafts.truncate(limit);
        Ok(drafts)
    }

    async fn begin(&self) -> Result<Box<dyn DraftTransaction>, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            staged: HashMap::new(),
            audit: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    staged: HashMap<DraftId, Draft>,
    audit: Vec<AuditRecord>,
}

#[async_trait]
impl DraftTransaction for MemoryTransaction {
    async fn update_if_version(
        &mut self,
        id: &DraftId,
        expected_version: i64,
        patch: &DraftPatch,
    ) -> Result<u64, StoreError> {
        let current = match self.staged.get(id) {
            Some(d) => Some(d.clone()),
            None => self.guard.drafts.get(id).cloned(),
        };
        match current {
            Some(mut draft) if draft.version == expected_version => {
                patch.apply(&mut draft);
                self.staged.insert(id.clone(), draft);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StoreError> {
        self.audit.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard,
            staged,
            audit,
        } = *self;
        debug!(drafts = staged.len(), audit = audit.len(), "committing memory transaction");
        guard.drafts.extend(staged);
        guard.audit.extend(audit);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Catalog held in memory, searched in insertion order.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    books: RwLock<Vec<CanonicalBook>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_books(books: Vec<CanonicalBook>) -> Self {
        Self {
            books: RwLock::new(books),
        }
    }

    pub async fn insert(&self, book: CanonicalBook) {
        self.books.write().await.push(book);
    }

    pub async fn len(&self) -> usize {
        self.books.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.books.read().await.is_empty()
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn find_by_isbn13(&self, isbn: &str) -> Result<Option<CanonicalBook>, StoreError> {
        let books = self.books.read().await;
        Ok(books
            .iter()
            .find(|b| b.isbn13.as_deref() == Some(isbn))
            .cloned())
    }

    async fn find_by_title_and_author_substring(
        &self,
        title: &str,
        author: &str,
    ) -> Result<Option<CanonicalBook>, StoreError> {
        let books = self.books.read().await;
        Ok(books
            .iter()
            .find(|b| contains_ci(&b.title, title) && b.authors.iter().any(|a| contains_ci(a, author)))
            .cloned())
    }

    async fn find_many_by_title_keyword(
        &self,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalBook>, StoreError> {
        let books = self.books.read().await;
        Ok(books
            .iter()
            .filter(|b| contains_ci(&b.title, keyword))
            .take(limit)
            .cloned()
            .collect())
    }
}
