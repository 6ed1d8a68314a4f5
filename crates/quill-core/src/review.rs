//! Free-form reviews of a tracked file.
//!
//! A review is stored beside the correction records as one commit on
//! `refs/reviews/<id>`, whose tree holds the review as `review.json` and the
//! reviewed content as `target`. Like a correction it is keyed to a blob,
//! so it stays attached to the exact text that was reviewed.

use serde::{Deserialize, Serialize};

use crate::error::{QuillError, QuillResult};

/// Namespace of review refs.
pub const REVIEW_PREFIX: &str = "refs/reviews/";
/// Name of the review blob in a review tree.
pub const REVIEW_BLOB: &str = "review.json";
/// Name of the reviewed blob in a review tree.
pub const TARGET_BLOB: &str = "target";

/// A review and its suggested improvements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Assigned on write when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub review: String,
    #[serde(default)]
    pub improvements: Vec<Improvement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub original: String,
    pub replacement: String,
    pub reason: String,
    pub location: Span,
}

/// Start and end of a fragment in the reviewed text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

/// Ref name for review `id`; rejects ids that are empty or not a single
/// ref component.
pub fn review_ref(id: &str) -> QuillResult<String> {
    let name = format!("{REVIEW_PREFIX}{id}");
    if id.is_empty() || id.contains('/') || !git2::Reference::is_valid_name(&name) {
        return Err(QuillError::InvalidReviewId(id.to_string()));
    }
    Ok(name)
}
