//! Tiered matching of raw book payloads against the canonical catalog.
//!
//! Tiers, in priority order:
//!
//! 1. ISBN-13 exact lookup (score 100), when the payload carries an ISBN
//! 2. Title plus first-author substring match (score 90), when authors are present
//! 3. Fuzzy title similarity over a few keyword candidates, only when tiers
//!    1 and 2 found nothing; a fuzzy candidate needs [`MATCH_THRESHOLD`]
//!
//! The highest score wins; equal scores go to the higher-priority tier.
//! Matching never writes.

use std::collections::HashSet;
use std::sync::Arc;

use readzone_core::{BookMatch, BookPayload, MatchType, extract_keywords, normalize_title};
use readzone_store::{CatalogStore, StoreError};
use tracing::debug;

/// Minimum score for a match to be accepted.
pub const MATCH_THRESHOLD: u8 = 70;
pub const ISBN_SCORE: u8 = 100;
pub const TITLE_AUTHOR_SCORE: u8 = 90;
/// Fuzzy score when one normalized title contains the other.
pub const FUZZY_CONTAINS_SCORE: u8 = 85;
/// Catalog rows fetched per fuzzy lookup.
pub const FUZZY_CANDIDATE_LIMIT: usize = 3;

/// Finds the best canonical book for a raw payload.
#[derive(Clone)]
pub struct Matcher {
    catalog: Arc<dyn CatalogStore>,
}

impl Matcher {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    /// Best accepted match for `payload`, or `None` when no tier produced a
    /// candidate at or above [`MATCH_THRESHOLD`].
    pub async fn find_best(&self, payload: &BookPayload) -> Result<Option<BookMatch>, StoreError> {
        let mut matches = Vec::new();

        if let Some(isbn) = payload.isbn13()
            && let Some(book) = self.catalog.find_by_isbn13(&isbn).await?
        {
            matches.push(BookMatch {
                book_id: book.id,
                score: ISBN_SCORE,
                match_type: MatchType::Isbn13,
            });
        }

        if let Some(author) = payload.first_author()
            && !payload.title.trim().is_empty()
            && let Some(book) = self
                .catalog
                .find_by_title_and_author_substring(payload.title.trim(), author)
                .await?
        {
            matches.push(BookMatch {
                book_id: book.id,
                score: TITLE_AUTHOR_SCORE,
                match_type: MatchType::TitleAuthor,
            });
        }

        if matches.is_empty()
            && let Some(keyword) = extract_keywords(&payload.title).into_iter().next()
        {
            let candidates = self
                .catalog
                .find_many_by_title_keyword(&keyword, FUZZY_CANDIDATE_LIMIT)
                .await?;
            for book in candidates {
                let score = title_similarity(&payload.title, &book.title);
                if score >= MATCH_THRESHOLD {
                    matches.push(BookMatch {
                        book_id: book.id,
                        score,
                        match_type: MatchType::Fuzzy,
                    });
                } else {
                    debug!(book_id = %book.id, score, "fuzzy candidate below threshold");
                }
            }
        }

        Ok(best_match(matches))
    }
}

/// Highest score; ties go to the higher-priority tier, then the earlier candidate.
fn best_match(matches: Vec<BookMatch>) -> Option<BookMatch> {
    matches.into_iter().reduce(|best, current| {
        if current.score > best.score
            || (current.score == best.score && current.match_type < best.match_type)
        {
            current
        } else {
            best
        }
    })
}

/// Similarity of two titles, 0 to 100.
///
/// Identical after normalization scores 100, containment scores
/// [`FUZZY_CONTAINS_SCORE`], anything else is the rounded share of distinct
/// words in common relative to the larger word set.
pub fn title_similarity(a: &str, b: &str) -> u8 {
    let na = normalize_title(a);
    let nb = normalize_title(b);
    if na.is_empty() || nb.is_empty() {
        return 0;
    }
    if na == nb {
        return 100;
    }
    if na.contains(&nb) || nb.contains(&na) {
        return FUZZY_CONTAINS_SCORE;
    }

    let wa: HashSet<&str> = na.split(' ').collect();
    let wb: HashSet<&str> = nb.split(' ').collect();
    let overlap = wa.intersection(&wb).count();
    let total = wa.len().max(wb.len());
    ((overlap as f64 / total as f64) * 100.0).round() as u8
}
