//! Markdown rendering of digest entries into Telegram-sized messages.
use anyhow::Result;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::warn;

use crate::config::Pipeline;
use crate::model::{DigestEntry, DEFAULT_CATEGORY};

/// Telegram's limit for one text message, in characters.
pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;
/// Room kept free in every message for the `(i/n)` header.
const HEADER_RESERVE: usize = 50;
const BLOCK_SEPARATOR: &str = "\n\n";
const ELLIPSIS: &str = "...";

/// Rendered messages plus the ids of the entries that made it into them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormattedDigest {
    pub messages: Vec<String>,
    pub article_ids: Vec<String>,
}

pub trait Formatter: Send + Sync {
    /// `today` is stamped into the `(i/n)` header of multi-message digests.
    fn build_messages(&self, entries: &[DigestEntry], today: NaiveDate) -> Result<FormattedDigest>;
}

#[derive(Debug, Clone, Default)]
pub struct MarkdownFormatter {
    /// 0 means no cap.
    max_messages: usize,
}

/// One rendered line and the entry it came from (none for headings).
struct Line {
    text: String,
    id: Option<String>,
}

#[derive(Default)]
struct Draft {
    text: String,
    chars: usize,
    ids: Vec<String>,
}

impl Draft {
    fn is_empty(&self) -> bool {
        self.chars == 0
    }

    fn push(&mut self, text: &str, id: Option<&str>) {
        self.text.push_str(text);
        self.chars += text.chars().count();
        if let Some(id) = id {
            self.ids.push(id.to_string());
        }
    }
}

impl MarkdownFormatter {
    pub fn new(max_messages: usize) -> Self {
        Self { max_messages }
    }

    pub fn from_config(cfg: &Pipeline) -> Self {
        Self::new(cfg.max_total_messages)
    }

    /// Render with an explicit date for the multi-message header.
    pub fn render(&self, entries: &[DigestEntry], date: NaiveDate) -> FormattedDigest {
        if entries.is_empty() {
            return FormattedDigest::default();
        }
        let blocks = category_blocks(entries);
        let mut drafts = pack(blocks);

        if self.max_messages > 0 && drafts.len() > self.max_messages {
            warn!(
                built = drafts.len(),
                cap = self.max_messages,
                "digest exceeds message cap; dropping trailing messages"
            );
            drafts.truncate(self.max_messages);
        }

        let total = drafts.len();
        let mut out = FormattedDigest::default();
        for (i, draft) in drafts.into_iter().enumerate() {
            out.article_ids.extend(draft.ids);
            if total == 1 {
                out.messages.push(draft.text);
                continue;
            }
            let header = format!(
                "Daily digest ({}/{}) - {}\n\n",
                i + 1,
                total,
                date.format("%-d %B %Y")
            );
            let room = TELEGRAM_MAX_MESSAGE_CHARS.saturating_sub(header.chars().count());
            out.messages.push(header + &truncate_chars(&draft.text, room));
        }
        out
    }
}

impl Formatter for MarkdownFormatter {
    fn build_messages(&self, entries: &[DigestEntry], today: NaiveDate) -> Result<FormattedDigest> {
        Ok(self.render(entries, today))
    }
}

fn category_blocks(entries: &[DigestEntry]) -> Vec<Vec<Line>> {
    let mut by_category: BTreeMap<&str, Vec<&DigestEntry>> = BTreeMap::new();
    for entry in entries {
        let category = match entry.category.trim() {
            "" => DEFAULT_CATEGORY,
            c => c,
        };
        by_category.entry(category).or_default().push(entry);
    }

    by_category
        .into_iter()
        .map(|(category, entries)| {
            let mut lines = Vec::with_capacity(entries.len() + 1);
            lines.push(Line {
                text: format!("*{}*", escape_markdown(category)),
                id: None,
            });
            for entry in entries {
                lines.push(Line {
                    text: format!(
                        "[{}]({}) - {}",
                        link_text(&entry.title),
                        entry.url.trim(),
                        escape_markdown(&entry.summary)
                    ),
                    id: Some(entry.id.clone()),
                });
            }
            lines
        })
        .collect()
}

/// Pack category blocks into message drafts. A block is only split across
/// messages when it cannot fit in one on its own.
fn pack(blocks: Vec<Vec<Line>>) -> Vec<Draft> {
    let budget = TELEGRAM_MAX_MESSAGE_CHARS - HEADER_RESERVE;
    let mut drafts = Vec::new();
    let mut current = Draft::default();

    for block in blocks {
        let text = block.iter().map(|l| l.text.as_str()).collect::<Vec<_>>().join("\n");
        let len = text.chars().count();

        if len > budget {
            if !current.is_empty() {
                drafts.push(std::mem::take(&mut current));
            }
            for line in block {
                let line_text = truncate_chars(&line.text, budget);
                let line_len = line_text.chars().count();
                let sep = if current.is_empty() { 0 } else { 1 };
                if !current.is_empty() && current.chars + sep + line_len > budget {
                    drafts.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push("\n", None);
                }
                current.push(&line_text, line.id.as_deref());
            }
            continue;
        }

        let sep_len = if current.is_empty() { 0 } else { BLOCK_SEPARATOR.len() };
        if !current.is_empty() && current.chars + sep_len + len > budget {
            drafts.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(BLOCK_SEPARATOR, None);
        }
        current.text.push_str(&text);
        current.chars += len;
        current
            .ids
            .extend(block.into_iter().filter_map(|l| l.id));
    }
    if !current.is_empty() {
        drafts.push(current);
    }
    drafts
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let mut out: String = text.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

/// Legacy Markdown: escape the characters that open an entity.
fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.trim().chars() {
        if matches!(ch, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Link text cannot carry escapes, so brackets are swapped out instead.
fn link_text(title: &str) -> String {
    title
        .trim()
        .chars()
        .map(|c| match c {
            '[' => '(',
            ']' => ')',
            c => c,
        })
        .collect()
}
