//! Deterministic cache keys for raw book payloads.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::BookPayload;
use crate::text::normalize_title;

/// Cache key for a raw payload.
///
/// `isbn:<isbn13>` when the payload carries an ISBN, otherwise
/// `ta:<normalised title>|<normalised first author>`. Two payloads that the
/// matcher would treat identically always share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(payload: &BookPayload) -> Self {
        if let Some(isbn) = payload.isbn13() {
            return Self(format!("isbn:{isbn}"));
        }
        let title = normalize_title(&payload.title);
        let author = payload.first_author().map(normalize_title).unwrap_or_default();
        Self(format!("ta:{title}|{author}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
