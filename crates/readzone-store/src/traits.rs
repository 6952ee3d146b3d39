//! Collaborator contracts consumed by the reconciliation engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use readzone_core::{AuditRecord, BookId, CanonicalBook, Draft, DraftId, DraftStatus};

use crate::StoreError;

/// Fields written by a conditional draft update.
///
/// `version` is not part of the patch: every update that matches its
/// expected version advances it by exactly one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftPatch {
    pub resolved_book_id: Option<BookId>,
    pub clear_payload: bool,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl DraftPatch {
    /// Bind the draft to a canonical book and drop its raw payload.
    pub fn bind_book(book_id: &BookId, now: DateTime<Utc>) -> Self {
        Self {
            resolved_book_id: Some(book_id.clone()),
            clear_payload: true,
            last_accessed: Some(now),
        }
    }

    /// Touch the draft without changing its book reference (an edit).
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self {
            last_accessed: Some(now),
            ..Self::default()
        }
    }

    /// Apply the patch to an in-memory draft, bumping its version.
    pub fn apply(&self, draft: &mut Draft) {
        if let Some(book_id) = &self.resolved_book_id {
            draft.resolved_book_id = Some(book_id.clone());
        }
        if self.clear_payload {
            draft.payload = None;
        }
        if let Some(ts) = self.last_accessed {
            draft.last_accessed = ts;
        }
        draft.version += 1;
    }
}

/// Predicate for [`DraftStore::find_many`]. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftFilter {
    pub has_payload: Option<bool>,
    pub unresolved: Option<bool>,
    pub status: Option<DraftStatus>,
    pub accessed_since: Option<DateTime<Utc>>,
}

impl DraftFilter {
    /// Drafts eligible for reconciliation: payload present, no resolved
    /// book, still in `draft` status.
    pub fn sync_candidates() -> Self {
        Self {
            has_payload: Some(true),
            unresolved: Some(true),
            status: Some(DraftStatus::Draft),
            accessed_since: None,
        }
    }

    pub fn accessed_since(mut self, since: DateTime<Utc>) -> Self {
        self.accessed_since = Some(since);
        self
    }

    pub fn matches(&self, draft: &Draft) -> bool {
        if let Some(want) = self.has_payload
            && draft.payload.is_some() != want
        {
            return false;
        }
        if let Some(want) = self.unresolved
            && draft.resolved_book_id.is_none() != want
        {
            return false;
        }
        if let Some(status) = self.status
            && draft.status != status
        {
            return false;
        }
        if let Some(since) = self.accessed_since
            && draft.last_accessed < since
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DraftOrder {
    /// Most recently accessed first.
    #[default]
    LastAccessedDesc,
}

/// The draft CRUD store.
#[async_trait]
pub trait DraftStore: Send + Sync {
    async fn find_by_id(&self, id: &DraftId) -> Result<Option<Draft>, StoreError>;

    /// Compare-and-swap update. Returns the number of rows affected; zero
    /// means the draft is missing or its version moved past `expected_version`.
    async fn update_if_version(
        &self,
        id: &DraftId,
        expected_version: i64,
        patch: &DraftPatch,
    ) -> Result<u64, StoreError>;

    async fn find_many(
        &self,
        filter: &DraftFilter,
        order: DraftOrder,
        limit: usize,
    ) -> Result<Vec<Draft>, StoreError>;

    /// Open a transaction spanning draft writes and audit appends.
    async fn begin(&self) -> Result<Box<dyn DraftTransaction>, StoreError>;
}

/// A unit of work over the draft store. Dropping it without
/// [`commit`](Self::commit) discards every staged write.
#[async_trait]
pub trait DraftTransaction: Send {
    async fn update_if_version(
        &mut self,
        id: &DraftId,
        expected_version: i64,
        patch: &DraftPatch,
    ) -> Result<u64, StoreError>;

    /// Append to the audit log. Write-only; committed with the transaction.
    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Read-only view of the canonical book catalog.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_by_isbn13(&self, isbn: &str) -> Result<Option<CanonicalBook>, StoreError>;

    /// First book whose title contains `title` and one of whose authors
    /// contains `author`, both case-insensitively.
    async fn find_by_title_and_author_substring(
        &self,
        title: &str,
        author: &str,
    ) -> Result<Option<CanonicalBook>, StoreError>;

    /// Up to `limit` books whose title contains `keyword`, case-insensitively.
    async fn find_many_by_title_keyword(
        &self,
        keyword: &str,
        limit: usize,
    ) -> Result<Vec<CanonicalBook>, StoreError>;
}
