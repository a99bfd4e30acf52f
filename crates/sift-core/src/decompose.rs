//! Comment decomposition
//!
//! Splits a review comment into atomic items. A comment with two or more
//! top-level markdown list entries yields one item per entry, plus one item
//! per free-standing paragraph outside the lists; only a colon-terminated
//! lead-in directly introducing a list is folded away. Anything
//! else yields exactly one item covering the whole comment. Decomposition
//! never returns an empty list.

use crate::model::{Comment, Item, ItemStatus};
use crate::util::{collapse_whitespace, truncate};
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

/// Maximum characters kept in an item summary.
pub const MAX_SUMMARY_CHARS: usize = 100;

const EMPTY_SUMMARY: &str = "(empty comment)";

/// One extracted unit of work, before it is bound to a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecomposedItem {
    pub summary: String,
    pub category: String,
}

impl DecomposedItem {
    fn from_text(text: &str) -> Self {
        Self {
            category: categorize(text).to_string(),
            summary: truncate(text, MAX_SUMMARY_CHARS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    ListEntry(String),
    Paragraph(String),
}

impl Block {
    fn text(&self) -> &str {
        match self {
            Block::ListEntry(text) | Block::Paragraph(text) => text,
        }
    }
}

/// Decompose a comment body. Always returns at least one item.
pub fn decompose(body: &str) -> Vec<DecomposedItem> {
    let blocks: Vec<Block> = top_level_blocks(body)
        .into_iter()
        .map(|block| match block {
            Block::ListEntry(text) => Block::ListEntry(collapse_whitespace(&text)),
            Block::Paragraph(text) => Block::Paragraph(collapse_whitespace(&text)),
        })
        .filter(|block| !block.text().is_empty())
        .collect();

    let entries = blocks
        .iter()
        .filter(|block| matches!(block, Block::ListEntry(_)))
        .count();
    if entries < 2 {
        // Fail closed: one item for the whole comment.
        return vec![DecomposedItem {
            summary: fallback_summary(body),
            category: categorize(body).to_string(),
        }];
    }

    blocks
        .iter()
        .enumerate()
        .filter(|(index, block)| !is_lead_in(block, blocks.get(index + 1)))
        .map(|(_, block)| DecomposedItem::from_text(block.text()))
        .collect()
}

/// A colon-terminated paragraph introducing the list right after it.
fn is_lead_in(block: &Block, next: Option<&Block>) -> bool {
    matches!(block, Block::Paragraph(text) if text.ends_with(':'))
        && matches!(next, Some(Block::ListEntry(_)))
}

/// Build the items for a comment, numbering sequences from `first_sequence`.
pub fn items_for_comment(comment: &Comment, first_sequence: usize) -> Vec<Item> {
    decompose(&comment.body)
        .into_iter()
        .enumerate()
        .map(|(ordinal, part)| Item {
            id: Item::make_id(&comment.id, ordinal),
            parent_comment_id: comment.id.clone(),
            sequence: first_sequence + ordinal,
            summary: part.summary,
            category: part.category,
            location: comment.location.clone(),
            status: ItemStatus::Pending,
        })
        .collect()
}

fn fallback_summary(body: &str) -> String {
    let first_line = body
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("```"))
        .map(|line| line.trim_start_matches(['#', '>', ' ']))
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty());

    match first_line {
        Some(line) => truncate(&line, MAX_SUMMARY_CHARS),
        None => EMPTY_SUMMARY.to_string(),
    }
}

/// Top-level list entries and paragraphs, in document order. Nested list
/// text stays with its parent entry. Code blocks, headings and block quotes
/// are not requests and are skipped.
fn top_level_blocks(body: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut list_depth = 0usize;
    let mut item_depth = 0usize;
    let mut quote_depth = 0usize;
    let mut in_code_block = false;
    let mut entry: Option<String> = None;
    let mut paragraph: Option<String> = None;

    for event in Parser::new_ext(body, Options::ENABLE_TASKLISTS) {
        match event {
            Event::Start(Tag::List(_)) => list_depth += 1,
            Event::End(TagEnd::List(_)) => list_depth = list_depth.saturating_sub(1),
            Event::Start(Tag::BlockQuote(_)) => quote_depth += 1,
            Event::End(TagEnd::BlockQuote(_)) => quote_depth = quote_depth.saturating_sub(1),
            Event::Start(Tag::Item) => {
                item_depth += 1;
                if list_depth == 1 && item_depth == 1 && quote_depth == 0 {
                    entry = Some(String::new());
                } else if let Some(buf) = entry.as_mut() {
                    buf.push(' ');
                }
            }
            Event::End(TagEnd::Item) => {
                if list_depth == 1 && item_depth == 1 {
                    if let Some(text) = entry.take() {
                        blocks.push(Block::ListEntry(text));
                    }
                }
                item_depth = item_depth.saturating_sub(1);
            }
            Event::Start(Tag::Paragraph) if list_depth == 0 && quote_depth == 0 => {
                paragraph = Some(String::new());
            }
            Event::End(TagEnd::Paragraph) => {
                if let Some(text) = paragraph.take() {
                    blocks.push(Block::Paragraph(text));
                } else if let Some(buf) = entry.as_mut() {
                    buf.push(' ');
                }
            }
            Event::Start(Tag::CodeBlock(_)) => in_code_block = true,
            Event::End(TagEnd::CodeBlock) => in_code_block = false,
            Event::Text(text) | Event::Code(text) if !in_code_block => {
                if let Some(buf) = paragraph.as_mut().or(entry.as_mut()) {
                    buf.push_str(&text);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if let Some(buf) = paragraph.as_mut().or(entry.as_mut()) {
                    buf.push(' ');
                }
            }
            _ => {}
        }
    }

    blocks
}

/// Keyword table checked in order; first hit wins.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("security", &["security", "injection", "xss", "csrf", "secret", "credential", "sanitize", "escape"]),
    ("null-safety", &["null", "none", "nil", "undefined", "optional", "unwrap", "nullable"]),
    ("error-handling", &["error", "exception", "panic", "raise", "throw", "catch", "fallible", "retry"]),
    ("async", &["async", "await", "concurren", "thread", "race", "lock", "blocking", "deadlock"]),
    ("performance", &["performance", "slow", "alloc", "complexity", "cache", "perf", "o(n"]),
    ("testing", &["test", "coverage", "assert", "fixture", "mock"]),
    ("naming", &["rename", "naming", "name ", "identifier", "typo"]),
    ("docs", &["doc", "comment", "readme", "docstring", "explain"]),
    ("style", &["format", "style", "indent", "whitespace", "lint", "nit"]),
];

/// Deterministic grouping tag for duplicate spotting.
pub fn categorize(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    for (category, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return category;
        }
    }
    "general"
}
