//! Field-level three-way merge of correction records.
//!
//! Used when a correction ref has diverged between this worker and the
//! remote. All three inputs are keyed on the same blob, so they share their
//! paragraph structure; anything else is a broken invariant, not a
//! conflict. Each paragraph merges independently. Conflicts never abort the
//! merge: they are resolved by a fixed rule and listed in the report.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{QuillError, QuillResult};
use crate::record::{AlternativeText, CorrectionRecord, Judgment, ParagraphInfo, ProtocolEntry};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a conflicting field was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Both values kept, framed by conflict markers.
    Markers,
    /// The remote value replaced the local one.
    RemoteWins,
}

/// One field where both sides changed the ancestor value differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    /// Paragraph index.
    pub paragraph: usize,
    /// Dotted field path, e.g. `judgment.m1.text.alternative.poetic`.
    pub field: String,
    pub resolution: Resolution,
}

/// The merged record and what had to be settled to produce it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: CorrectionRecord,
    pub conflicts: Vec<FieldConflict>,
}

impl MergeOutcome {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Result of a three-way comparison of one optional value.
#[derive(Debug, Clone, PartialEq)]
enum Pick<T> {
    Take(Option<T>),
    Conflict(T, T),
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge `local` and `remote`, which both descend from `ancestor`.
pub fn merge_records(
    ancestor: &CorrectionRecord,
    local: &CorrectionRecord,
    remote: &CorrectionRecord,
) -> QuillResult<MergeOutcome> {
    check_alignment(ancestor, local, remote)?;

    let mut conflicts = Vec::new();
    let paragraph_info = ancestor
        .paragraph_info
        .iter()
        .zip(&local.paragraph_info)
        .zip(&remote.paragraph_info)
        .enumerate()
        .map(|(i, ((a, l), r))| merge_paragraph(i, a, l, r, &mut conflicts))
        .collect();

    let local_delta = local.time_spent_ms.saturating_sub(ancestor.time_spent_ms);
    let remote_delta = remote.time_spent_ms.saturating_sub(ancestor.time_spent_ms);

    let record = CorrectionRecord {
        time_spent_ms: ancestor
            .time_spent_ms
            .saturating_add(local_delta)
            .saturating_add(remote_delta),
        messages: append_only(&ancestor.messages, &local.messages, &remote.messages),
        paragraph_info,
    };

    Ok(MergeOutcome { record, conflicts })
}

/// A record with the same paragraphs as `like` and nothing else.
///
/// Stands in for the ancestor when two sides share no history.
pub fn empty_ancestor(like: &CorrectionRecord) -> CorrectionRecord {
    CorrectionRecord::from_paragraphs(like.paragraph_info.iter().map(|p| p.original.clone()))
}

/// Frame two irreconcilable texts the way git does.
pub fn conflict_markers(local: &str, remote: &str) -> String {
    format!("<<<<<<< local\n{local}\n=======\n{remote}\n>>>>>>> remote")
}

fn check_alignment(
    ancestor: &CorrectionRecord,
    local: &CorrectionRecord,
    remote: &CorrectionRecord,
) -> QuillResult<()> {
    let counts = (
        ancestor.paragraph_info.len(),
        local.paragraph_info.len(),
        remote.paragraph_info.len(),
    );
    if counts.0 != counts.1 || counts.0 != counts.2 {
        return Err(QuillError::MergeInvariant(format!(
            "paragraph counts differ (ancestor {}, local {}, remote {})",
            counts.0, counts.1, counts.2
        )));
    }
    for (i, ((a, l), r)) in ancestor
        .paragraph_info
        .iter()
        .zip(&local.paragraph_info)
        .zip(&remote.paragraph_info)
        .enumerate()
    {
        if a.original != l.original || a.original != r.original {
            return Err(QuillError::MergeInvariant(format!(
                "paragraph {i} has a different original text"
            )));
        }
    }
    Ok(())
}

fn merge_paragraph(
    index: usize,
    ancestor: &ParagraphInfo,
    local: &ParagraphInfo,
    remote: &ParagraphInfo,
    conflicts: &mut Vec<FieldConflict>,
) -> ParagraphInfo {
    let edited = match three_way(
        ancestor.edited.as_ref(),
        local.edited.as_ref(),
        remote.edited.as_ref(),
    ) {
        Pick::Take(value) => value,
        Pick::Conflict(l, r) => {
            conflicts.push(FieldConflict {
                paragraph: index,
                field: "edited".to_string(),
                resolution: Resolution::Markers,
            });
            Some(conflict_markers(&l, &r))
        }
    };

    let mut judgment = local.judgment.clone();
    for (model, remote_judgment) in &remote.judgment {
        let merged = match local.judgment.get(model) {
            Some(local_judgment) => merge_judgment(
                index,
                model,
                ancestor.judgment.get(model),
                local_judgment,
                remote_judgment,
                conflicts,
            ),
            None => remote_judgment.clone(),
        };
        judgment.insert(model.clone(), merged);
    }

    ParagraphInfo {
        original: ancestor.original.clone(),
        edited,
        selected_text: remote
            .selected_text
            .clone()
            .or_else(|| local.selected_text.clone()),
        corrected: remote.corrected.clone().or_else(|| local.corrected.clone()),
        judgment,
    }
}

fn merge_judgment(
    index: usize,
    model: &str,
    ancestor: Option<&Judgment>,
    local: &Judgment,
    remote: &Judgment,
    conflicts: &mut Vec<FieldConflict>,
) -> Judgment {
    let mut merged = remote.clone();

    let empty = BTreeMap::new();
    let ancestor_alts = ancestor.map(|a| &a.text.alternative).unwrap_or(&empty);
    let styles: BTreeSet<&String> = ancestor_alts
        .keys()
        .chain(local.text.alternative.keys())
        .chain(remote.text.alternative.keys())
        .collect();

    let mut alternative: BTreeMap<String, AlternativeText> = BTreeMap::new();
    for style in styles {
        let pick = three_way(
            ancestor_alts.get(style),
            local.text.alternative.get(style),
            remote.text.alternative.get(style),
        );
        let value = match pick {
            Pick::Take(value) => value,
            Pick::Conflict(_, r) => {
                conflicts.push(FieldConflict {
                    paragraph: index,
                    field: format!("judgment.{model}.text.alternative.{style}"),
                    resolution: Resolution::RemoteWins,
                });
                Some(r)
            }
        };
        if let Some(value) = value {
            alternative.insert(style.clone(), value);
        }
    }
    merged.text.alternative = alternative;

    let ancestor_correction = ancestor.map(|a| &a.text.correction);
    merged.text.correction = if ancestor_correction != Some(&remote.text.correction) {
        if ancestor_correction != Some(&local.text.correction)
            && local.text.correction != remote.text.correction
        {
            conflicts.push(FieldConflict {
                paragraph: index,
                field: format!("judgment.{model}.text.correction"),
                resolution: Resolution::RemoteWins,
            });
        }
        remote.text.correction.clone()
    } else {
        local.text.correction.clone()
    };

    let ancestor_protocol: &[ProtocolEntry] = ancestor.map(|a| a.protocol.as_slice()).unwrap_or(&[]);
    merged.protocol = append_only(ancestor_protocol, &local.protocol, &remote.protocol);

    merged
}

/// Equal → keep; one side unchanged → the other; one side absent → the
/// present one; otherwise a conflict.
fn three_way<T: PartialEq + Clone>(
    ancestor: Option<&T>,
    local: Option<&T>,
    remote: Option<&T>,
) -> Pick<T> {
    if local == remote {
        return Pick::Take(local.cloned());
    }
    if local == ancestor {
        return Pick::Take(remote.cloned());
    }
    if remote == ancestor {
        return Pick::Take(local.cloned());
    }
    match (local, remote) {
        (Some(l), Some(r)) => Pick::Conflict(l.clone(), r.clone()),
        (Some(l), None) => Pick::Take(Some(l.clone())),
        (None, r) => Pick::Take(r.cloned()),
    }
}

/// Ancestor entries, then what local appended, then what remote appended.
fn append_only<T: PartialEq + Clone>(ancestor: &[T], local: &[T], remote: &[T]) -> Vec<T> {
    let mut out = ancestor.to_vec();
    out.extend(additions(ancestor, local).into_iter().cloned());
    out.extend(additions(ancestor, remote).into_iter().cloned());
    out
}

fn additions<'a, T: PartialEq>(ancestor: &'a [T], side: &'a [T]) -> Vec<&'a T> {
    if side.starts_with(ancestor) {
        side[ancestor.len()..].iter().collect()
    } else {
        side.iter().filter(|e| !ancestor.contains(e)).collect()
    }
}
