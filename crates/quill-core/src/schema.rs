//! Record schema detection and migration.
//!
//! Two shapes have been written to `metadata` blobs over time. The legacy
//! shape kept a single flat judgment and a single alternative per paragraph;
//! the current shape is [`CorrectionRecord`]. Every read goes through
//! [`migrate`], which detects the shape and lifts legacy records.
//!
//! The schemas are mutually exclusive: a legacy paragraph requires `text`
//! and rejects unknown fields (so it can never carry `original`), while a
//! current paragraph requires `original`.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{QuillError, QuillResult};
use crate::record::{
    AlternativeText, CorrectionRecord, Judgment, JudgmentText, ParagraphInfo, SelectedText,
};

/// Model name given to legacy judgments that never recorded one.
pub const UNKNOWN_MODEL: &str = "unknown";
/// Style name given to the lone legacy alternative.
pub const STANDARD_STYLE: &str = "standard";

/// A stored record tagged with the schema it validated against.
#[derive(Debug, Clone, PartialEq)]
pub enum VersionedRecord {
    Legacy(LegacyRecord),
    Current(CorrectionRecord),
}

impl VersionedRecord {
    /// Validate `value` as legacy first, then as current.
    pub fn detect(value: &Value) -> QuillResult<Self> {
        let legacy_err = match LegacyRecord::deserialize(value) {
            Ok(legacy) if !legacy.paragraph_info.is_empty() => {
                return Ok(VersionedRecord::Legacy(legacy))
            }
            Ok(_) => "legacy records always carry paragraphs".to_string(),
            Err(e) => e.to_string(),
        };
        match CorrectionRecord::deserialize(value) {
            Ok(current) => Ok(VersionedRecord::Current(current)),
            Err(e) => Err(QuillError::CorruptRecord {
                legacy: legacy_err,
                current: e.to_string(),
            }),
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, VersionedRecord::Legacy(_))
    }

    /// The record in the current shape.
    pub fn into_current(self) -> CorrectionRecord {
        match self {
            VersionedRecord::Legacy(legacy) => legacy.lift(),
            VersionedRecord::Current(current) => current,
        }
    }
}

/// Detect and upgrade a stored record.
pub fn migrate(value: &Value) -> QuillResult<CorrectionRecord> {
    Ok(VersionedRecord::detect(value)?.into_current())
}

/// Parse a `metadata` blob and upgrade it.
pub fn parse_record(bytes: &[u8]) -> QuillResult<CorrectionRecord> {
    let value: Value = serde_json::from_slice(bytes)?;
    migrate(&value)
}

/// Record shape written before judgments were keyed by model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyRecord {
    #[serde(default)]
    pub time_in_ms: u64,
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Progress counter `{ value, of }`; recomputed on every write, not lifted.
    #[serde(default)]
    pub paragraph: Option<Value>,
    #[serde(rename = "paragraphInfo")]
    pub paragraph_info: Vec<LegacyParagraph>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LegacyParagraph {
    pub text: LegacyText,
    #[serde(default)]
    pub judgment: Option<LegacyJudgment>,
    #[serde(default)]
    pub edited: Option<String>,
    #[serde(default)]
    pub selected_text: Option<LegacySelection>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyText {
    pub original: String,
    pub alternative: String,
    pub correction: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LegacyJudgment {
    pub score: f64,
    pub good_points: String,
    pub bad_points: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacySelection {
    Original,
    Edited,
    Correction,
    Alternative,
}

impl LegacyRecord {
    fn lift(self) -> CorrectionRecord {
        CorrectionRecord {
            time_spent_ms: self.time_in_ms,
            messages: self.messages,
            paragraph_info: self
                .paragraph_info
                .into_iter()
                .map(LegacyParagraph::lift)
                .collect(),
        }
    }
}

impl LegacyParagraph {
    fn lift(self) -> ParagraphInfo {
        let model = self
            .judgment
            .as_ref()
            .and_then(|j| j.model.clone())
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string());

        let (score, good_points, bad_points) = match self.judgment {
            Some(j) => (j.score, vec![j.good_points], vec![j.bad_points]),
            None => (0.0, Vec::new(), Vec::new()),
        };

        let mut alternative = BTreeMap::new();
        alternative.insert(
            STANDARD_STYLE.to_string(),
            AlternativeText::Plain(self.text.alternative),
        );

        let selected_text = self.selected_text.map(|s| match s {
            LegacySelection::Original => SelectedText::Original,
            LegacySelection::Edited => SelectedText::Edited,
            LegacySelection::Correction => SelectedText::Correction {
                model: model.clone(),
            },
            LegacySelection::Alternative => SelectedText::Alternative {
                model: model.clone(),
                style: STANDARD_STYLE.to_string(),
            },
        });

        let mut judgment = BTreeMap::new();
        judgment.insert(
            model,
            Judgment {
                good_points,
                bad_points,
                score,
                text: JudgmentText {
                    correction: self.text.correction,
                    alternative,
                },
                ..Default::default()
            },
        );

        ParagraphInfo {
            original: self.text.original,
            edited: self.edited,
            selected_text,
            corrected: None,
            judgment,
        }
    }
}
