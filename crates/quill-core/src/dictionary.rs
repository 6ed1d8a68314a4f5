//! User dictionary and the read-time spelling filter.
//!
//! Once a word is in the dictionary, grammar-tool findings that flag it as
//! misspelled are dropped when a record is read and the flagged word is put
//! back into `corrected.text`. Stored records are never rewritten.

use std::collections::HashSet;

use crate::record::{CorrectionEntry, CorrectionRecord, Corrected, Rule};

/// Rule category the grammar tool uses for misspellings.
pub const SPELLING_CATEGORY: &str = "TYPOS";

/// Case-insensitive word set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dictionary {
    words: HashSet<String>,
}

impl Dictionary {
    /// Parse a dictionary file: one word per line, `#` comments and blank
    /// lines ignored.
    pub fn parse(text: &str) -> Self {
        let words = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_lowercase)
            .collect();
        Self { words }
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(&word.trim().to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Drop spelling findings for dictionary words in every paragraph.
    pub fn filter(&self, record: &mut CorrectionRecord) {
        if self.is_empty() {
            return;
        }
        for paragraph in &mut record.paragraph_info {
            if let Some(corrected) = paragraph.corrected.as_mut() {
                self.filter_corrected(corrected);
            }
        }
    }

    fn filter_corrected(&self, corrected: &mut Corrected) {
        let mut entries = std::mem::take(&mut corrected.corrections);
        entries.sort_by_key(|e| e.offset);

        // Offsets count UTF-16 code units, as the grammar tool reports them.
        let mut text: Vec<u16> = corrected.text.encode_utf16().collect();
        // Filled back to front; entries already here lie after any later splice.
        let mut kept: Vec<CorrectionEntry> = Vec::with_capacity(entries.len());

        for entry in entries.into_iter().rev() {
            let spelling = entry.rule.as_ref().is_some_and(is_spelling_rule);
            let restorable = entry
                .original
                .as_deref()
                .filter(|word| spelling && self.contains(word));
            let end = entry.offset.checked_add(entry.length);
            match (restorable, end) {
                (Some(word), Some(end)) if end <= text.len() => {
                    let restored: Vec<u16> = word.encode_utf16().collect();
                    let delta = restored.len() as isize - entry.length as isize;
                    text.splice(entry.offset..end, restored);
                    for later in &mut kept {
                        later.offset = (later.offset as isize + delta).max(0) as usize;
                    }
                }
                _ => kept.push(entry),
            }
        }

        kept.reverse();
        corrected.corrections = kept;
        corrected.text = String::from_utf16_lossy(&text);
    }
}

/// True for rules that flag misspellings rather than grammar or style.
pub fn is_spelling_rule(rule: &Rule) -> bool {
    rule.category == SPELLING_CATEGORY
        || rule.id.contains("SPELLER")
        || rule.id.contains("SPELLING")
}
