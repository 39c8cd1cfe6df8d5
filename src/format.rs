//! Context Formatter (spec §4.G): renders aggregated documents into the
//! markdown block the gateway splices into the model's context. The
//! opening/closing markers are bit-stable strings the gateway's own
//! pre/post processing greps for, so they are never reformatted or wrapped.

use crate::config::RecallConfig;
use crate::model::{AggregatedDoc, BlockSource};

pub const OPENING_MARKER: &str = "<!-- recall-context:start -->";
pub const CLOSING_MARKER: &str = "<!-- recall-context:end -->";
const PREAMBLE: &str = "The notes below may be relevant to the current request. Use them only if they help; otherwise ignore them.";
const NO_RESULTS_BODY: &str = "No results found.";
const MAX_BLOCKS_PER_DOC: usize = 5;
const CHARS_PER_TOKEN: usize = 4;

/// Minimum remaining budget worth spending on a truncated linked-doc body
/// (spec §4.G: "minimum useful room ≈60 chars or skip").
const MIN_USEFUL_ROOM: usize = 60;

fn render_linked_doc(doc: &AggregatedDoc, remaining_budget: usize) -> Option<String> {
    let block = doc.blocks.first()?;
    if block.source != BlockSource::LinkedDoc {
        return None;
    }
    let markdown = block.markdown.as_deref().unwrap_or("");
    let updated = doc.updated_at.as_deref().unwrap_or("unknown");
    let header = format!("## 🔗 {} ({})\n```markdown\n", doc.hpath, updated);
    let footer = "\n```\n";
    let room = remaining_budget.saturating_sub(header.len() + footer.len());
    if room < MIN_USEFUL_ROOM && markdown.chars().count() > room {
        return None;
    }

    let mut out = header;
    if markdown.chars().count() > room {
        let truncated: String = markdown.chars().take(room).collect();
        out.push_str(&truncated);
        out.push_str("...");
    } else {
        out.push_str(markdown);
    }
    out.push_str(footer);
    Some(out)
}

fn render_regular_doc(doc: &AggregatedDoc, config: &RecallConfig) -> String {
    let updated = doc.updated_at.as_deref().unwrap_or("unknown");
    let mut out = format!("## 📄 {} ({})\n", doc.hpath, updated);
    let mut ranked = doc.blocks.clone();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    for block in ranked.into_iter().take(MAX_BLOCKS_PER_DOC) {
        out.push_str(&format!("- {}\n", block.first_line()));
        let rest = block.rest_lines();
        if !rest.is_empty() {
            let excerpt = truncate_chars(&rest, config.block_excerpt_max_chars);
            for line in excerpt.lines() {
                out.push_str(&format!("  {line}\n"));
            }
        }
    }
    out
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

fn render_doc(doc: &AggregatedDoc, config: &RecallConfig, remaining_budget: usize) -> Option<String> {
    match render_linked_doc(doc, remaining_budget) {
        Some(rendered) => Some(rendered),
        None if doc.blocks.first().map(|b| b.source) == Some(BlockSource::LinkedDoc) => None,
        None => Some(render_regular_doc(doc, config)),
    }
}

/// Renders `docs` into the final context block, truncating in document
/// order once the approximate token budget (`maxContextTokens * 4` chars)
/// is exhausted (spec §4.G). An empty `docs` still yields a well-formed
/// block carrying a "no results" body, matching the retrieval engine's
/// choice to treat an all-paths-failed search as a successful empty
/// result rather than an error.
pub fn format_context(docs: &[AggregatedDoc], config: &RecallConfig) -> String {
    let budget = config.max_context_tokens * CHARS_PER_TOKEN;
    let mut out = String::new();
    out.push_str(OPENING_MARKER);
    out.push('\n');
    out.push_str(PREAMBLE);
    out.push('\n');

    if docs.is_empty() {
        out.push_str(NO_RESULTS_BODY);
        out.push('\n');
        out.push_str(CLOSING_MARKER);
        return out;
    }

    for doc in docs {
        let remaining = budget.saturating_sub(out.len() + CLOSING_MARKER.len() + 1);
        let Some(rendered) = render_doc(doc, config, remaining) else {
            continue;
        };
        if out.len() + rendered.len() + CLOSING_MARKER.len() + 1 > budget {
            break;
        }
        out.push_str(&rendered);
    }

    out.push_str(CLOSING_MARKER);
    out
}
