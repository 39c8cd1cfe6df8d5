//! Index Sync Service (spec §4.C): pulls documents out of the remote note
//! store and materializes them into the local index, both as a one-time
//! initial sync and as a periodic incremental pass.

use std::collections::HashSet;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::client::NoteStoreClient;
use crate::config::IndexConfig;
use crate::error::{RecallError, Result};
use crate::model::{Document, Section};
use crate::store::IndexStore;

fn ial_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{:[^}]*\}").unwrap())
}

fn list_marker_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+").unwrap())
}

/// Strips SiYuan's kramdown IAL attribute blocks (`{: id="..." ...}`) so the
/// dedup and section-split passes see plain markdown (spec §4.C "sanitize").
pub fn sanitize_kramdown(raw: &str) -> String {
    ial_pattern().replace_all(raw, "").to_string()
}

/// Sliding-window line dedup: a line is dropped if an equivalent line
/// (after stripping a leading list marker) already appeared within the last
/// `window` lines. This absorbs SiYuan's habit of repeating list items
/// across nested block refs without flattening real repeated content far
/// apart in the document (spec §4.C).
pub fn dedup_lines(text: &str, window: usize) -> String {
    if window == 0 {
        return text.to_string();
    }
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();
    for line in text.lines() {
        let normalized = list_marker_pattern().replace(line, "").trim().to_string();
        if !normalized.is_empty() && seen.iter().any(|s| s == &normalized) {
            continue;
        }
        out.push(line);
        seen.push(normalized);
        if seen.len() > window {
            seen.remove(0);
        }
    }
    out.join("\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

/// Splits sanitized markdown into sections at any heading whose level is in
/// `heading_levels` (spec §3 Section, §4.C section splitting rules). Content
/// before the first matching heading becomes section 0 if non-blank.
pub fn split_sections(doc_id: &str, markdown: &str, heading_levels: &[u8], section_max_chars: usize) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current_level = 0u8;
    let mut current_lines: Vec<&str> = Vec::new();
    let mut line_index = 0usize;
    let mut start_index = 0usize;
    let mut any_heading_seen = false;

    let flush = |lines: &[&str], level: u8, start: usize, sections: &mut Vec<Section>| {
        let joined = lines.join("\n");
        if joined.trim().is_empty() {
            return;
        }
        let content = truncate_chars(joined.trim(), section_max_chars);
        sections.push(Section {
            id: Section::synthetic_id(doc_id, level, start),
            doc_id: doc_id.to_string(),
            content,
        });
    };

    for line in markdown.lines() {
        if let Some(level) = heading_level(line) {
            if heading_levels.contains(&level) {
                flush(&current_lines, current_level, start_index, &mut sections);
                current_lines = vec![line];
                current_level = level;
                start_index = line_index;
                any_heading_seen = true;
                line_index += 1;
                continue;
            }
        }
        current_lines.push(line);
        line_index += 1;
    }

    // If no configured heading level ever matched, no sections are produced
    // at all — not even a single section wrapping the whole document (spec
    // §4.C: "If no configured level matches, no sections are produced
    // (doc-level content only)").
    if any_heading_seen {
        flush(&current_lines, current_level, start_index, &mut sections);
    }
    sections
}

fn heading_level(line: &str) -> Option<u8> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    if trimmed.as_bytes().get(hashes) != Some(&b' ') {
        return None;
    }
    Some(hashes as u8)
}

fn row_str(row: &Value, field: &str) -> Option<String> {
    row.get(field).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub struct IndexSyncService {
    client: NoteStoreClient,
    config: IndexConfig,
    excluded: HashSet<String>,
}

impl IndexSyncService {
    pub fn new(client: NoteStoreClient, config: IndexConfig) -> Self {
        let mut excluded: HashSet<String> = config.skip_notebook_names.iter().cloned().collect();
        if let Some(privacy) = &config.privacy_notebook {
            excluded.insert(privacy.clone());
        }
        Self {
            client,
            config,
            excluded,
        }
    }

    pub fn excluded_notebook_names(&self) -> Vec<String> {
        self.excluded.iter().cloned().collect()
    }

    async fn fetch_doc_blocks(&self, box_id: &str, since: Option<&str>) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let filter = match since {
                Some(ts) => format!("AND updated > '{}'", ts.replace('\'', "")),
                None => String::new(),
            };
            let stmt = format!(
                "SELECT id, content, hpath, updated, box FROM blocks WHERE type = 'd' AND box = '{}' {} ORDER BY updated DESC LIMIT {} OFFSET {}",
                box_id.replace('\'', ""),
                filter,
                self.config.sql_page_size,
                offset
            );
            let page = self.client.sql(&stmt).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            rows.extend(page);
            offset += page_len;
            if page_len < self.config.sql_page_size {
                break;
            }
        }
        Ok(rows)
    }

    async fn materialize_doc(&self, row: &Value, notebook_name: &str) -> Result<Option<(Document, Vec<Section>)>> {
        let Some(id) = row_str(row, "id") else {
            return Ok(None);
        };
        let kramdown = self.client.get_block_kramdown(&id).await?;
        let sanitized = sanitize_kramdown(&kramdown.kramdown);
        let deduped_doc = if self.config.doc_content_dedup_lines {
            dedup_lines(&sanitized, self.config.doc_content_dedup_window_size)
        } else {
            sanitized.clone()
        };

        let mut sections = if self.config.section_dedup_lines {
            split_sections(
                &id,
                &dedup_lines(&sanitized, self.config.section_dedup_window_size),
                &self.config.section_heading_levels,
                self.config.section_max_chars,
            )
        } else {
            split_sections(
                &id,
                &sanitized,
                &self.config.section_heading_levels,
                self.config.section_max_chars,
            )
        };
        sections.truncate(self.config.max_sections_to_index);

        let doc = Document {
            id: id.clone(),
            title: row_str(row, "content").unwrap_or_default(),
            hpath: row_str(row, "hpath").unwrap_or_default(),
            notebook_id: row_str(row, "box").unwrap_or_default(),
            notebook_name: notebook_name.to_string(),
            updated_at: row_str(row, "updated").unwrap_or_default(),
            tags: None,
            markdown: sanitized,
            content: deduped_doc,
        };
        Ok(Some((doc, sections)))
    }

    /// Fetches and materializes every row in `rows` concurrently, bounded by
    /// `index.maxConcurrentFetches` (spec §9 "Throughput vs remote
    /// politeness": large notebooks would otherwise open one markdown fetch
    /// per doc, unbounded). One failed doc is logged and dropped; it never
    /// aborts the rest of the batch.
    async fn materialize_batch(&self, rows: &[Value], notebook_name: &str) -> Vec<(Document, Vec<Section>)> {
        let cap = self.config.max_concurrent_fetches.max(1);
        stream::iter(rows.iter())
            .map(|row| async move {
                match self.materialize_doc(row, notebook_name).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(notebook = %notebook_name, error = %e, "failed to fetch doc during sync");
                        None
                    }
                }
            })
            .buffer_unordered(cap)
            .filter_map(|pair| async move { pair })
            .collect()
            .await
    }

    /// Full pull of every non-excluded notebook, ignoring `lastSyncTime`
    /// (spec §4.C initial sync).
    pub async fn initial_sync(&self, store: &IndexStore) -> Result<usize> {
        let started_at = Utc::now().to_rfc3339();
        let notebooks = self.client.list_notebooks().await?;
        let mut total = 0;
        for nb in notebooks {
            if self.excluded.contains(&nb.name) {
                continue;
            }
            let rows = self.fetch_doc_blocks(&nb.id, None).await?;
            let batch = self.materialize_batch(&rows, &nb.name).await;
            total += store.sync_documents(batch).await?;
        }
        store.update_sync_time(&started_at).await?;
        Ok(total)
    }

    /// Pulls everything updated since `lastSyncTime` and reconciles
    /// deletions. The sync timestamp is sampled *before* the query runs and
    /// is only advanced on success, so a block updated mid-run is picked up
    /// again on the next tick rather than silently skipped (spec §4.C
    /// at-least-once semantics, §9 Open Question).
    pub async fn incremental_sync(&self, store: &IndexStore) -> Result<usize> {
        let since = store.get_last_sync_time().await?;
        let Some(since) = since else {
            return self.initial_sync(store).await;
        };
        let started_at = Utc::now().to_rfc3339();
        let notebooks = self.client.list_notebooks().await?;
        let mut total = 0;
        for nb in notebooks {
            if self.excluded.contains(&nb.name) {
                continue;
            }
            let rows = self.fetch_doc_blocks(&nb.id, Some(&since)).await?;
            let batch = self.materialize_batch(&rows, &nb.name).await;
            total += store.sync_documents(batch).await?;

            if let Err(e) = self.reconcile_deletions(store, &nb.id, &nb.name).await {
                tracing::warn!(notebook = %nb.name, error = %e, "deletion reconciliation failed");
            }
        }
        store.update_sync_time(&started_at).await?;
        Ok(total)
    }

    /// Detects docs present in the notebook's deletion-tracking view but
    /// absent from `blocks`, and marks them deleted locally. SiYuan surfaces
    /// removed doc ids via the same `blocks` table query filtered by
    /// `box`/`path` going empty, so the cheap reconciliation is: ask for
    /// every live doc id in the notebook, mark anything this store still
    /// has indexed that isn't in that set (spec §4.C "detect deletions").
    async fn reconcile_deletions(&self, store: &IndexStore, box_id: &str, _notebook_name: &str) -> Result<()> {
        let stmt = format!(
            "SELECT id FROM blocks WHERE type = 'd' AND box = '{}'",
            box_id.replace('\'', "")
        );
        let live_rows = self.client.sql(&stmt).await?;
        let live_ids: HashSet<String> = live_rows.iter().filter_map(|r| row_str(r, "id")).collect();

        for id in store.doc_ids_for_notebook(box_id).await? {
            if !live_ids.contains(&id) {
                store.mark_deleted(&id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_ial_blocks() {
        let raw = "# Title\n{: id=\"20260101-abc\" updated=\"20260101\"}\nBody text";
        let out = sanitize_kramdown(raw);
        assert!(!out.contains("id=\"20260101-abc\""));
        assert!(out.contains("Body text"));
    }

    #[test]
    fn dedup_lines_drops_repeats_within_window() {
        let text = "- item one\nfiller\n- item one\n- item two";
        let out = dedup_lines(text, 5);
        assert_eq!(out.matches("item one").count(), 1);
        assert!(out.contains("item two"));
    }

    #[test]
    fn dedup_lines_keeps_repeats_outside_window() {
        let mut lines: Vec<String> = vec!["- repeat".to_string()];
        for i in 0..10 {
            lines.push(format!("filler {i}"));
        }
        lines.push("- repeat".to_string());
        let text = lines.join("\n");
        let out = dedup_lines(&text, 3);
        assert_eq!(out.matches("repeat").count(), 2);
    }

    #[test]
    fn split_sections_splits_at_configured_level() {
        let md = "intro\n## First\nbody one\n## Second\nbody two";
        let sections = split_sections("doc1", md, &[2], 1000);
        assert_eq!(sections.len(), 3);
        assert!(sections[0].content.contains("intro"));
        assert!(sections[1].content.contains("First"));
        assert!(sections[2].content.contains("Second"));
    }

    #[test]
    fn split_sections_produces_nothing_when_no_heading_matches() {
        let md = "just prose\nwith no headings at all\n### only an h3";
        let sections = split_sections("doc1", md, &[2], 1000);
        assert!(sections.is_empty());
    }

    #[test]
    fn split_sections_truncates_long_sections() {
        let body = "x".repeat(50);
        let md = format!("## H\n{body}");
        let sections = split_sections("doc1", &md, &[2], 10);
        assert!(sections[0].content.ends_with("..."));
    }
}
