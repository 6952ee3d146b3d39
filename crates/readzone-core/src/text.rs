//! Text normalisation for book titles, author names, and ISBNs.
//!
//! Titles arrive from an external search API with inconsistent casing,
//! punctuation, and spacing ("The Great Book: Special Edition!" vs
//! "the great book special edition"). Matching and cache keys operate on the
//! normalised form so that cosmetic differences never split a book in two.
//!
//! # Rules
//!
//! - Lowercase (Unicode-aware, so Hangul and Latin titles behave alike)
//! - Drop every character that is neither alphanumeric nor whitespace
//! - Collapse whitespace runs to a single space and trim

/// Normalise a title (or author name) for comparison.
///
/// "  The Great Book:  Special Edition! " → "the great book special edition"
pub fn normalize_title(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Up to three search keywords from a title: normalised words longer than
/// one character, in title order.
///
/// The first keyword drives the catalog prefix lookup for fuzzy matching.
pub fn extract_keywords(title: &str) -> Vec<String> {
    normalize_title(title)
        .split(' ')
        .filter(|w| w.chars().count() > 1)
        .take(3)
        .map(str::to_string)
        .collect()
}

/// Normalise a single ISBN token: strip hyphens and whitespace, uppercase
/// the ISBN-10 check character.
///
/// "978-0-00-000000-1" → "9780000000001", "0-306-40615-x" → "030640615X"
pub fn normalize_isbn(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
