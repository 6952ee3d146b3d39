//! Versioned bind of a draft to a canonical book.

use chrono::Utc;
use readzone_core::{ActorId, AuditRecord, BookId, DraftId};
use readzone_store::{DraftPatch, DraftStore};
use tracing::{debug, warn};

use crate::SyncError;

/// Bind `draft_id` to `book_id` if the draft is still at `expected_version`.
///
/// In one transaction: set the book reference, clear the raw payload, advance
/// the version, touch `last_accessed`, and append a `BOOK_SYNCED` audit
/// record. Zero rows updated means another writer got there first and yields
/// [`SyncError::Conflict`]; nothing is retried here.
///
/// Returns the draft's new version.
pub async fn perform_sync(
    store: &dyn DraftStore,
    draft_id: &DraftId,
    book_id: &BookId,
    expected_version: i64,
    actor_id: &ActorId,
) -> Result<i64, SyncError> {
    let mut tx = store.begin().await?;

    let patch = DraftPatch::bind_book(book_id, Utc::now());
    let rows = tx.update_if_version(draft_id, expected_version, &patch).await?;
    if rows == 0 {
        tx.rollback().await?;
        warn!(draft_id = %draft_id, expected_version, "draft changed underneath sync");
        return Err(SyncError::Conflict {
            draft_id: draft_id.clone(),
            expected_version,
        });
    }

    let record = AuditRecord::book_synced(draft_id, actor_id, book_id, expected_version);
    tx.append_audit(&record).await?;
    tx.commit().await?;

    debug!(draft_id = %draft_id, book_id = %book_id, version = expected_version + 1, "draft bound to book");
    Ok(expected_version + 1)
}
