//! Correction records — the per-file, per-blob editorial metadata.
//!
//! A record is stored as pretty-printed JSON in the `metadata` blob of a
//! correction commit. Its `paragraphInfo` is index-aligned with the paragraph
//! segmentation of the blob it is keyed on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QuillError, QuillResult};

/// Separator placed between paragraphs when flattening a record.
pub const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// The full correction state for one blob of a tracked file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionRecord {
    /// Cumulative machine time spent producing this record.
    #[serde(default, alias = "time_in_ms")]
    pub time_spent_ms: u64,
    /// Append-only diagnostic log (usually markdown AST fragments).
    #[serde(default)]
    pub messages: Vec<Value>,
    /// One entry per paragraph of the keyed blob.
    pub paragraph_info: Vec<ParagraphInfo>,
}

/// Editorial state of a single paragraph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphInfo {
    /// Canonical paragraph text. Never rewritten once set.
    pub original: String,
    /// Human free-edit of the paragraph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<String>,
    /// Which variant is authoritative for the flattened text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<SelectedText>,
    /// Grammar-tool result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrected: Option<Corrected>,
    /// Model name -> judgment.
    #[serde(default)]
    pub judgment: BTreeMap<String, Judgment>,
}

/// The variant of a paragraph chosen as authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SelectedTextRepr", into = "SelectedTextRepr")]
pub enum SelectedText {
    Original,
    Edited,
    Corrected,
    /// A model's spelling/grammar correction.
    Correction { model: String },
    /// A model's stylistic alternative in the named style.
    Alternative { model: String, style: String },
}

/// Wire shape: `"original"`, `[model, "correction"]` or
/// `[model, "alternative", style]`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SelectedTextRepr {
    Plain(PlainChoice),
    Correction((String, CorrectionTag)),
    Alternative((String, AlternativeTag, String)),
}

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PlainChoice {
    Original,
    Edited,
    Corrected,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum CorrectionTag {
    Correction,
}

#[derive(Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AlternativeTag {
    Alternative,
}

impl From<SelectedTextRepr> for SelectedText {
    fn from(repr: SelectedTextRepr) -> Self {
        match repr {
            SelectedTextRepr::Plain(PlainChoice::Original) => SelectedText::Original,
            SelectedTextRepr::Plain(PlainChoice::Edited) => SelectedText::Edited,
            SelectedTextRepr::Plain(PlainChoice::Corrected) => SelectedText::Corrected,
            SelectedTextRepr::Correction((model, _)) => SelectedText::Correction { model },
            SelectedTextRepr::Alternative((model, _, style)) => {
                SelectedText::Alternative { model, style }
            }
        }
    }
}

impl From<SelectedText> for SelectedTextRepr {
    fn from(selected: SelectedText) -> Self {
        match selected {
            SelectedText::Original => SelectedTextRepr::Plain(PlainChoice::Original),
            SelectedText::Edited => SelectedTextRepr::Plain(PlainChoice::Edited),
            SelectedText::Corrected => SelectedTextRepr::Plain(PlainChoice::Corrected),
            SelectedText::Correction { model } => {
                SelectedTextRepr::Correction((model, CorrectionTag::Correction))
            }
            SelectedText::Alternative { model, style } => {
                SelectedTextRepr::Alternative((model, AlternativeTag::Alternative, style))
            }
        }
    }
}

/// Grammar-tool output for a paragraph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Corrected {
    /// The paragraph with all unambiguous replacements applied.
    pub text: String,
    /// Individual findings, offsets into `text` (in chars).
    #[serde(default)]
    pub corrections: Vec<CorrectionEntry>,
}

/// One grammar-tool finding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionEntry {
    pub message: String,
    #[serde(default)]
    pub short_message: String,
    /// The flagged fragment as it appeared before replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<Rule>,
    /// Start of the fragment in `corrected.text`, in UTF-16 code units.
    pub offset: usize,
    /// Length of the fragment, in UTF-16 code units.
    pub length: usize,
    #[serde(default)]
    pub alternative_replacement: Vec<String>,
}

/// Grammar-tool rule metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub category: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A model's verdict on one paragraph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Judgment {
    #[serde(default)]
    pub good_points: Vec<String>,
    #[serde(default)]
    pub bad_points: Vec<String>,
    #[serde(default, rename = "duration_ms", skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, rename = "prompt_tokens", skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    pub score: f64,
    pub text: JudgmentText,
    #[serde(default)]
    pub involved_characters: Vec<String>,
    /// Audit log of values changed by re-runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protocol: Vec<ProtocolEntry>,
}

/// The texts a model produced for a paragraph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgmentText {
    pub correction: String,
    /// Style name -> alternative phrasing.
    #[serde(default)]
    pub alternative: BTreeMap<String, AlternativeText>,
}

/// An alternative phrasing, optionally with timing data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AlternativeText {
    Plain(String),
    Timed {
        text: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_tokens: Option<u64>,
    },
}

impl AlternativeText {
    pub fn text(&self) -> &str {
        match self {
            AlternativeText::Plain(text) => text,
            AlternativeText::Timed { text, .. } => text,
        }
    }
}

/// A field-level change recorded when a model re-run disagrees with itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolEntry {
    pub style: String,
    pub description: String,
    #[serde(default)]
    pub old_value: Value,
    #[serde(default)]
    pub new_value: Value,
}

/// What one model run returns for a paragraph in one style.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResult {
    pub involved_characters: Vec<String>,
    pub correction: String,
    pub alternative: String,
    pub good_points: Vec<String>,
    pub bad_points: Vec<String>,
    pub score: f64,
}

impl CorrectionRecord {
    /// A fresh record with one untouched entry per paragraph.
    pub fn from_paragraphs<I, S>(paragraphs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            time_spent_ms: 0,
            messages: Vec::new(),
            paragraph_info: paragraphs
                .into_iter()
                .map(|p| ParagraphInfo::new(p.into()))
                .collect(),
        }
    }

    /// `(done, total)`: paragraphs with any correction or judgment.
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .paragraph_info
            .iter()
            .filter(|p| p.is_progressed())
            .count();
        (done, self.paragraph_info.len())
    }

    /// Join the authoritative text of every paragraph.
    pub fn flatten(&self) -> QuillResult<String> {
        let mut parts = Vec::with_capacity(self.paragraph_info.len());
        for (i, paragraph) in self.paragraph_info.iter().enumerate() {
            let text = paragraph
                .resolve_text()
                .map_err(|e| QuillError::BuildText(format!("paragraph {i}: {e}")))?;
            parts.push(text);
        }
        Ok(parts.join(PARAGRAPH_SEPARATOR))
    }
}

impl ParagraphInfo {
    pub fn new(original: String) -> Self {
        Self {
            original,
            ..Default::default()
        }
    }

    /// True once a grammar pass or any model has touched the paragraph.
    pub fn is_progressed(&self) -> bool {
        self.corrected.is_some() || !self.judgment.is_empty()
    }

    /// Resolve `selectedText` to a concrete string.
    ///
    /// Without a selection the first model (by name) supplies its correction,
    /// else the original is used. A selection naming a missing variant is an
    /// error rather than a silent fallback.
    pub fn resolve_text(&self) -> Result<String, String> {
        match &self.selected_text {
            None => Ok(self
                .judgment
                .values()
                .next()
                .map(|j| j.text.correction.clone())
                .unwrap_or_else(|| self.original.clone())),
            Some(SelectedText::Original) => Ok(self.original.clone()),
            Some(SelectedText::Edited) => self
                .edited
                .clone()
                .ok_or_else(|| "selected 'edited' but no edit exists".to_string()),
            Some(SelectedText::Corrected) => self
                .corrected
                .as_ref()
                .map(|c| c.text.clone())
                .ok_or_else(|| "selected 'corrected' but no grammar result exists".to_string()),
            Some(SelectedText::Correction { model }) => self
                .judgment
                .get(model)
                .map(|j| j.text.correction.clone())
                .ok_or_else(|| format!("no judgment from model '{model}'")),
            Some(SelectedText::Alternative { model, style }) => {
                let judgment = self
                    .judgment
                    .get(model)
                    .ok_or_else(|| format!("no judgment from model '{model}'"))?;
                judgment
                    .text
                    .alternative
                    .get(style)
                    .map(|a| a.text().to_string())
                    .ok_or_else(|| format!("model '{model}' has no alternative '{style}'"))
            }
        }
    }

    /// Store a model result for `style`, creating or updating the judgment.
    pub fn apply_model_result(&mut self, model: &str, style: &str, result: ModelResult) {
        match self.judgment.get_mut(model) {
            Some(judgment) => judgment.record_rerun(style, result),
            None => {
                let mut alternative = BTreeMap::new();
                alternative.insert(style.to_string(), AlternativeText::Plain(result.alternative));
                self.judgment.insert(
                    model.to_string(),
                    Judgment {
                        good_points: result.good_points,
                        bad_points: result.bad_points,
                        duration_ms: None,
                        prompt_tokens: None,
                        score: result.score,
                        text: JudgmentText {
                            correction: result.correction,
                            alternative,
                        },
                        involved_characters: result.involved_characters,
                        protocol: Vec::new(),
                    },
                );
            }
        }
    }
}

impl Judgment {
    /// Merge a re-run in another style: add the alternative and log every
    /// shared field whose value changed before taking the new value.
    pub fn record_rerun(&mut self, style: &str, result: ModelResult) {
        self.text
            .alternative
            .insert(style.to_string(), AlternativeText::Plain(result.alternative));

        if result.correction != self.text.correction {
            log_change(&mut self.protocol, style, "Correction changed", &self.text.correction, &result.correction);
            self.text.correction = result.correction;
        }
        if !same_items(&result.bad_points, &self.bad_points) {
            log_change(&mut self.protocol, style, "Bad Points changed", &self.bad_points, &result.bad_points);
            self.bad_points = result.bad_points;
        }
        if !same_items(&result.good_points, &self.good_points) {
            log_change(&mut self.protocol, style, "Good Points changed", &self.good_points, &result.good_points);
            self.good_points = result.good_points;
        }
        if result.score != self.score {
            log_change(&mut self.protocol, style, "Score changed", &self.score, &result.score);
            self.score = result.score;
        }
        if !same_items(&result.involved_characters, &self.involved_characters) {
            log_change(
                &mut self.protocol,
                style,
                "Involved Characters changed",
                &self.involved_characters,
                &result.involved_characters,
            );
            self.involved_characters = result.involved_characters;
        }
    }
}

fn log_change<T: Serialize + ?Sized>(
    protocol: &mut Vec<ProtocolEntry>,
    style: &str,
    description: &str,
    old: &T,
    new: &T,
) {
    protocol.push(ProtocolEntry {
        style: style.to_string(),
        description: description.to_string(),
        old_value: serde_json::to_value(old).unwrap_or(Value::Null),
        new_value: serde_json::to_value(new).unwrap_or(Value::Null),
    });
}

/// Multiset equality, ignoring order.
fn same_items(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<&String> = a.iter().collect();
    let mut b: Vec<&String> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}
