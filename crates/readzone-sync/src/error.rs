use readzone_core::DraftId;
use readzone_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("draft not found: {0}")]
    NotFound(DraftId),

    #[error("draft {0} has no book payload to reconcile")]
    NoPayload(DraftId),

    /// No candidate cleared the match threshold. `best_score` is the highest
    /// rejected score, if any candidate was scored at all.
    #[error("no match above threshold (best score {best_score:?})")]
    NoMatch { best_score: Option<u8> },

    #[error("version conflict on draft {draft_id} (expected version {expected_version})")]
    Conflict {
        draft_id: DraftId,
        expected_version: i64,
    },

    #[error("store error: {0}")]
    TransientStore(#[from] StoreError),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("sync task panicked: {0}")]
    Panicked(String),
}

impl SyncError {
    /// Short machine-readable category for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NoPayload(_) => "no_payload",
            Self::NoMatch { .. } => "no_match",
            Self::Conflict { .. } => "conflict",
            Self::TransientStore(_) => "transient_store",
            Self::Timeout { .. } => "timeout",
            Self::Panicked(_) => "panicked",
        }
    }
}
