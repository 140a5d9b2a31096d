//! Stage transforms
//!
//! Extraction turns a staged file into text; scoring turns text plus the
//! target description into a [`ScoreCard`](docket_common::messages::ScoreCard).
//! Both report per-item results as an [`ItemOutcome`].

pub mod extract;
pub mod score;

pub use extract::{FileTextExtractor, TextExtractor};
pub use score::{HttpScorer, Scorer};

/// Result of transforming one item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome<T> {
    /// Item transformed
    Ok(T),
    /// This item failed; siblings are unaffected
    ItemError(String, String),
    /// The transform itself is unusable (e.g. endpoint down); every item of the batch fails
    Fatal(String),
}

impl<T> ItemOutcome<T> {
    pub fn item_error(item_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ItemOutcome::ItemError(item_id.into(), reason.into())
    }
}
