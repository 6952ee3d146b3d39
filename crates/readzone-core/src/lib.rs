pub mod fingerprint;
pub mod model;
pub mod text;

pub use fingerprint::Fingerprint;
pub use model::{
    ActorId, AuditAction, AuditRecord, AuditState, BookId, BookMatch, BookPayload, CanonicalBook,
    Draft, DraftId, DraftStatus, MatchType, PayloadRecord, SyncAction,
};
pub use text::{extract_keywords, normalize_isbn, normalize_title};
