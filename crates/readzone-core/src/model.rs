//! Shared draft, catalog, and audit types for book reconciliation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text::normalize_isbn;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identifier of a review draft.
    DraftId
);
string_id!(
    /// Identifier of a canonical catalog book.
    BookId
);
string_id!(
    /// The user or process a write is attributed to in the audit log.
    ActorId
);

// ── Raw payload ──

/// Externally-sourced book metadata attached to a draft by a book search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookPayload {
    pub title: String,
    /// Ordered; the first entry is the primary author.
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    /// As delivered by the search API. May hold an ISBN-10 and an ISBN-13
    /// separated by whitespace.
    #[serde(default)]
    pub isbn: Option<String>,
}

impl BookPayload {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            authors: Vec::new(),
            publisher: None,
            isbn: None,
        }
    }

    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_isbn(mut self, isbn: impl Into<String>) -> Self {
        self.isbn = Some(isbn.into());
        self
    }

    pub fn first_author(&self) -> Option<&str> {
        self.authors
            .first()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
    }

    /// The ISBN used for catalog lookup.
    ///
    /// "8996991341 9788996991342" → "9788996991342". When no 13-character
    /// token is present the first token is used. `None` for a blank field.
    pub fn isbn13(&self) -> Option<String> {
        let raw = self.isbn.as_deref()?;
        let tokens: Vec<String> = raw
            .split_whitespace()
            .map(normalize_isbn)
            .filter(|t| !t.is_empty())
            .collect();
        tokens
            .iter()
            .find(|t| t.len() == 13)
            .or_else(|| tokens.first())
            .cloned()
    }
}

/// On-disk form of a raw payload. Stores parse it once at their boundary
/// and hand [`BookPayload`] values to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schema")]
pub enum PayloadRecord {
    #[serde(rename = "v1")]
    V1(BookPayload),
}

impl PayloadRecord {
    pub fn into_payload(self) -> BookPayload {
        match self {
            Self::V1(p) => p,
        }
    }

    pub fn from_json(json: &str) -> Result<BookPayload, serde_json::Error> {
        serde_json::from_str::<PayloadRecord>(json).map(Self::into_payload)
    }

    pub fn to_json(payload: &BookPayload) -> Result<String, serde_json::Error> {
        serde_json::to_string(&PayloadRecord::V1(payload.clone()))
    }
}

// ── Drafts and catalog ──

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    #[default]
    Draft,
    Published,
    Expired,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A user's in-progress review.
///
/// Invariant: `resolved_book_id.is_some()` implies `payload.is_none()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: DraftId,
    pub owner_id: ActorId,
    #[serde(default)]
    pub payload: Option<BookPayload>,
    #[serde(default)]
    pub resolved_book_id: Option<BookId>,
    #[serde(default)]
    pub version: i64,
    #[serde(default = "Utc::now")]
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub status: DraftStatus,
}

impl Draft {
    /// A fresh, unresolved draft carrying `payload`.
    pub fn with_payload(
        id: impl Into<DraftId>,
        owner: impl Into<ActorId>,
        payload: BookPayload,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner.into(),
            payload: Some(payload),
            resolved_book_id: None,
            version: 0,
            last_accessed: Utc::now(),
            status: DraftStatus::Draft,
        }
    }
}

/// Deduplicated catalog record. Read-only to the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalBook {
    pub id: BookId,
    #[serde(default)]
    pub isbn13: Option<String>,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub publisher: Option<String>,
}

// ── Matching ──

/// Which tier produced a match. Declared in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Isbn13,
    TitleAuthor,
    Fuzzy,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isbn13 => "isbn13",
            Self::TitleAuthor => "title_author",
            Self::Fuzzy => "fuzzy",
        }
    }
}

/// A candidate catalog book for a raw payload, scored 0–100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMatch {
    pub book_id: BookId,
    pub score: u8,
    pub match_type: MatchType,
}

// ── Audit ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    BookSynced,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BookSynced => "BOOK_SYNCED",
        }
    }
}

/// Snapshot of the draft fields an audited write touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditState {
    pub book_id: Option<BookId>,
    pub version: i64,
}

/// Append-only audit log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub draft_id: DraftId,
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub before: AuditState,
    pub after: AuditState,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Record of a draft bound to `book_id` at `expected_version`.
    pub fn book_synced(
        draft_id: &DraftId,
        actor_id: &ActorId,
        book_id: &BookId,
        expected_version: i64,
    ) -> Self {
        Self {
            draft_id: draft_id.clone(),
            actor_id: actor_id.clone(),
            action: AuditAction::BookSynced,
            before: AuditState {
                book_id: None,
                version: expected_version,
            },
            after: AuditState {
                book_id: Some(book_id.clone()),
                version: expected_version + 1,
            },
            timestamp: Utc::now(),
        }
    }
}

/// Per-draft result category of one reconciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Synced,
    NoMatch,
    Failed,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::NoMatch => "no_match",
            Self::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isbn13_prefers_thirteen_digit_token() {
        let p = BookPayload::new("x").with_isbn("8996991341 9788996991342");
        assert_eq!(p.isbn13().as_deref(), Some("9788996991342"));
    }

    #[test]
    fn isbn13_strips_hyphens() {
        let p = BookPayload::new("x").with_isbn("978-0-00-000000-1");
        assert_eq!(p.isbn13().as_deref(), Some("9780000000001"));
    }

    #[test]
    fn isbn13_falls_back_to_first_token() {
        let p = BookPayload::new("x").with_isbn("899699134x");
        assert_eq!(p.isbn13().as_deref(), Some("899699134X"));
    }

    #[test]
    fn isbn13_blank_is_none() {
        let p = BookPayload::new("x").with_isbn("   ");
        assert_eq!(p.isbn13(), None);
        assert_eq!(BookPayload::new("x").isbn13(), None);
    }

    #[test]
    fn first_author_skips_blank() {
        let p = BookPayload::new("x").with_authors(["  "]);
        assert_eq!(p.first_author(), None);
        let p = BookPayload::new("x").with_authors(["Jane Doe", "John Roe"]);
        assert_eq!(p.first_author(), Some("Jane Doe"));
    }

    #[test]
    fn payload_record_is_tagged() {
        let p = BookPayload::new("The Great Book").with_authors(["Jane Doe"]);
        let json = PayloadRecord::to_json(&p).unwrap();
        assert!(json.contains(r#""schema":"v1""#), "{json}");
        assert_eq!(PayloadRecord::from_json(&json).unwrap(), p);
    }

    #[test]
    fn payload_record_rejects_unknown_schema() {
        let json = r#"{"schema":"v9","title":"x"}"#;
        assert!(PayloadRecord::from_json(json).is_err());
    }

    #[test]
    fn payload_missing_optionals() {
        let json = r#"{"schema":"v1","title":"Only Title"}"#;
        let p = PayloadRecord::from_json(json).unwrap();
        assert!(p.authors.is_empty());
        assert!(p.isbn.is_none());
    }

    #[test]
    fn book_synced_audit_states() {
        let rec = AuditRecord::book_synced(
            &DraftId::from("d1"),
            &ActorId::from("u1"),
            &BookId::from("b1"),
            4,
        );
        assert_eq!(rec.action, AuditAction::BookSynced);
        assert_eq!(rec.before, AuditState { book_id: None, version: 4 });
        assert_eq!(
            rec.after,
            AuditState {
                book_id: Some(BookId::from("b1")),
                version: 5
            }
        );
    }

    #[test]
    fn match_type_priority_order() {
        assert!(MatchType::Isbn13 < MatchType::TitleAuthor);
        assert!(MatchType::TitleAuthor < MatchType::Fuzzy);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [DraftStatus::Draft, DraftStatus::Published, DraftStatus::Expired] {
            assert_eq!(DraftStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DraftStatus::parse("DRAFT"), None);
    }
}
