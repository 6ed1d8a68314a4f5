//! quill-core — git-backed store for per-paragraph correction records.
//!
//! Every tracked text file is addressed by the git blob of its content.
//! Corrections of that blob live on their own commit chain under
//! `refs/spellcheck/<blob>`, apart from the branch that holds the text, so
//! workers can correct, merge, and sync records without touching the
//! author's history.

pub mod config;
pub mod dictionary;
pub mod error;
pub mod lock;
pub mod merge;
pub mod object;
pub mod paragraph;
pub mod record;
pub mod repo;
pub mod review;
pub mod schema;
pub mod sync;
pub mod worker;

pub use config::StoreConfig;
pub use error::{QuillError, QuillResult};
pub use record::CorrectionRecord;
pub use repo::{CorrectionKind, CorrectionQuery, CorrectionRepository, WriteMode};
pub use review::Review;
pub use sync::{SyncDriver, SyncReport};
pub use worker::{BackgroundLoop, Corrector, CorrectionSession, StoreState};
