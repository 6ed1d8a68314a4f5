//! Paragraph segmentation of tracked markdown files.
//!
//! The file is parsed as CommonMark and split into its top-level blocks.
//! Non-paragraph blocks (headings, quotes, lists, rules, code, tables, html)
//! are not corrected on their own: they attach to the paragraph that
//! follows them, so a heading travels with the first paragraph of its
//! section. Trailing non-paragraph blocks form a final group of their own.
//!
//! Every group is the source slice from its first block to its last, so the
//! text between blocks is kept exactly as written.

use std::ops::Range;

use pulldown_cmark::{Event, Options, Parser, Tag};

/// A top-level block: its byte range in the source and whether it is a
/// paragraph.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    range: Range<usize>,
    paragraph: bool,
}

/// Split `text` into the paragraph sequence a record is aligned with.
pub fn segment(text: &str) -> Vec<String> {
    let blocks = top_level_blocks(text);

    // Walk backwards so prefixes can be prepended to the paragraph after them.
    let mut groups: Vec<Range<usize>> = Vec::new();
    for block in blocks.into_iter().rev() {
        match groups.last_mut() {
            Some(group) if !block.paragraph => group.start = block.range.start,
            _ => groups.push(block.range),
        }
    }
    groups.reverse();

    groups
        .into_iter()
        .map(|range| text[range].trim_end().to_string())
        .filter(|group| !group.is_empty())
        .collect()
}

fn top_level_blocks(text: &str) -> Vec<Block> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut open: Option<Block> = None;

    for (event, range) in Parser::new_ext(text, options).into_offset_iter() {
        match event {
            Event::Start(tag) => {
                if depth == 0 {
                    open = Some(Block {
                        range: range.clone(),
                        paragraph: matches!(tag, Tag::Paragraph),
                    });
                }
                depth += 1;
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(mut block) = open.take() {
                        block.range.end = block.range.end.max(range.end);
                        blocks.push(block);
                    }
                }
            }
            // Leaf blocks without a container, e.g. thematic breaks.
            _ if depth == 0 => blocks.push(Block {
                range,
                paragraph: false,
            }),
            _ => {}
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_paragraphs() {
        let text = "First paragraph\nstill first.\n\nSecond one.\n";
        assert_eq!(
            segment(text),
            vec!["First paragraph\nstill first.", "Second one."]
        );
    }

    #[test]
    fn test_heading_attaches_to_next_paragraph() {
        let text = "# Chapter 1\n\nIt was night.\n\n## Part 2\n\nMorning came.";
        assert_eq!(
            segment(text),
            vec!["# Chapter 1\n\nIt was night.", "## Part 2\n\nMorning came."]
        );
    }

    #[test]
    fn test_setext_heading_attaches_to_next_paragraph() {
        let text = "Kapitel Eins\n============\n\nEs war Nacht.";
        assert_eq!(
            segment(text),
            vec!["Kapitel Eins\n============\n\nEs war Nacht."]
        );
    }

    #[test]
    fn test_hash_without_space_is_a_paragraph() {
        let text = "#wichtig war der Tag.\n\nDanach kam Regen.";
        assert_eq!(
            segment(text),
            vec!["#wichtig war der Tag.", "Danach kam Regen."]
        );
    }

    #[test]
    fn test_trailing_prefix_forms_own_group() {
        let text = "Body.\n\n---";
        assert_eq!(segment(text), vec!["Body.", "---"]);
    }

    #[test]
    fn test_fenced_code_with_blank_lines_stays_whole() {
        let text = "```\na\n\nb\n```\n\nAfter.";
        assert_eq!(segment(text), vec!["```\na\n\nb\n```\n\nAfter."]);
    }

    #[test]
    fn test_multiple_blank_lines_collapse() {
        assert_eq!(segment("a\n\n\n\nb"), vec!["a", "b"]);
    }

    #[test]
    fn test_empty_text_has_no_paragraphs() {
        assert!(segment("").is_empty());
        assert!(segment("\n\n  \n").is_empty());
    }

    #[test]
    fn test_list_attaches_forward() {
        let text = "- one\n- two\n\nSummary.";
        assert_eq!(segment(text), vec!["- one\n- two\n\nSummary."]);
    }

    #[test]
    fn test_quote_and_table_attach_forward() {
        let text = "> Zitat\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\nText.";
        assert_eq!(segment(text).len(), 1);
        assert!(segment(text)[0].starts_with("> Zitat"));
        assert!(segment(text)[0].ends_with("Text."));
    }
}
