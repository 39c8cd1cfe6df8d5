//! Retrieval Engine (spec §4.E): runs the configured search paths, scores
//! and dedups the resulting blocks, then aggregates them into ranked
//! documents for the formatter.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde_json::Value;

use crate::client::NoteStoreClient;
use crate::config::{RecallConfig, SearchPath};
use crate::model::{AggregatedDoc, Block, BlockSource, Intent, KeywordCoverage};
use crate::store::IndexStore;

pub struct RetrievalEngine<'a> {
    client: &'a NoteStoreClient,
    store: &'a IndexStore,
    config: &'a RecallConfig,
}

fn cjk_keyword_count(keywords: &[String]) -> usize {
    keywords
        .iter()
        .filter(|k| k.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c)))
        .count()
}

/// Spec §4.E stage-1 "phrase-AND" condition and the minimum-coverage
/// condition share this shape: "intents with >= 2 CJK keywords and <= 4
/// total keywords".
fn is_cjk_phrase_intent(keywords: &[String]) -> bool {
    cjk_keyword_count(keywords) >= 2 && keywords.len() <= 4
}

/// Builds the stage-1 FTS query (spec §4.E "fts" path): a phrase-AND
/// intersection for CJK-heavy short intents, a wide `OR` for long
/// multi-keyword queries, or the query verbatim otherwise.
fn build_fts_query(keywords: &[String], normalized_query: &str) -> String {
    if is_cjk_phrase_intent(keywords) {
        return keywords
            .iter()
            .map(|k| format!("\"{}\"", k.replace('"', "")))
            .join(" ");
    }
    if normalized_query.chars().count() >= 18 && keywords.len() >= 2 {
        return keywords
            .iter()
            .map(|k| format!("\"{}\"", k.replace('"', "")))
            .join(" OR ");
    }
    format!("\"{}\"", normalized_query.replace('"', ""))
}

/// Up to the 2 longest intent keywords that aren't themselves configured
/// topic keywords (spec §4.E "Anchor narrowing").
fn anchor_keywords(keywords: &[String], topic_keywords: &[String]) -> Vec<String> {
    let mut candidates: Vec<&String> = keywords
        .iter()
        .filter(|k| !topic_keywords.iter().any(|t| t.eq_ignore_ascii_case(k)))
        .collect();
    candidates.sort_by(|a, b| b.len().cmp(&a.len()));
    candidates.into_iter().take(2).cloned().collect()
}

/// Escapes `\`, `%`, and `_` so a keyword containing LIKE wildcard
/// characters is matched literally (spec §4.E "sql" path: `LIKE '%k_i%'
/// ESCAPE '\'`).
fn escape_like(keyword: &str) -> String {
    keyword
        .replace('\'', "")
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn build_sql_like_clause(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|k| format!("content LIKE '%{}%' ESCAPE '\\'", escape_like(k)))
        .join(" OR ")
}

fn row_str(row: &Value, field: &str) -> Option<String> {
    row.get(field).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// `max(0, 0.3 - days_since * 0.01)` (spec §4.E scoring "Recency").
fn recency_bonus(updated_at: Option<&str>) -> f64 {
    let Some(updated_at) = updated_at else { return 0.0 };
    let Ok(parsed) = DateTime::parse_from_rfc3339(updated_at) else {
        return 0.0;
    };
    let age_days = (Utc::now() - parsed.with_timezone(&Utc)).num_days().max(0) as f64;
    (0.3 - age_days * 0.01).max(0.0)
}

/// `max(0, 0.8 - min(0.8, rank))` — rank is "smaller is better" (spec §4.E
/// scoring, §4.B `Search`).
fn native_rank_bonus(native_rank: Option<f64>) -> f64 {
    match native_rank {
        Some(r) => (0.8 - r.max(0.0).min(0.8)).max(0.0),
        None => 0.0,
    }
}

/// Per-keyword content/hpath hit bonuses (spec §4.E scoring: "+0.35 in
/// content; +0.15 in hpath" per keyword).
fn keyword_bonus(content_lower: &str, hpath_lower: &str, keywords: &[String]) -> f64 {
    let mut bonus = 0.0;
    for k in keywords {
        let k = k.to_lowercase();
        if content_lower.contains(&k) {
            bonus += 0.35;
        }
        if hpath_lower.contains(&k) {
            bonus += 0.15;
        }
    }
    bonus
}

/// Whole-query hit bonus (spec §4.E scoring: query length >= 3 chars,
/// "+1.2 in content; +0.6 in hpath").
fn query_bonus(content_lower: &str, hpath_lower: &str, query_lower: &str) -> f64 {
    if query_lower.chars().count() < 3 {
        return 0.0;
    }
    let mut bonus = 0.0;
    if content_lower.contains(query_lower) {
        bonus += 1.2;
    }
    if hpath_lower.contains(query_lower) {
        bonus += 0.6;
    }
    bonus
}

/// Scores a block per spec §4.E: base weight by source, plus whole-query
/// and per-keyword hit bonuses, plus recency and native-rank bonuses, all
/// summed and then multiplied by the source's base weight.
fn score_block(mut block: Block, keywords: &[String], query_lower: &str) -> Block {
    let content_lower = block.content.to_lowercase();
    let hpath_lower = block.hpath.to_lowercase();
    let base = block.source.base_weight();
    let sum = query_bonus(&content_lower, &hpath_lower, query_lower)
        + keyword_bonus(&content_lower, &hpath_lower, keywords)
        + recency_bonus(block.updated_at.as_deref())
        + native_rank_bonus(block.native_rank);
    block.score = base * sum;
    block
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(client: &'a NoteStoreClient, store: &'a IndexStore, config: &'a RecallConfig) -> Self {
        Self { client, store, config }
    }

    async fn run_fts(&self, intent: &Intent, query_text: &str) -> Vec<Block> {
        let query = build_fts_query(&intent.keywords, query_text);
        match self
            .store
            .search(&query, self.config.two_stage.candidate_limit_per_path)
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .map(|r| Block {
                    id: r.block_id,
                    root_id: r.doc_id,
                    hpath: r.hpath,
                    content: r.content,
                    updated_at: r.updated_at,
                    source: BlockSource::Fts,
                    score: 0.0,
                    native_rank: Some(r.rank),
                    markdown: None,
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "fts search path failed");
                Vec::new()
            }
        }
    }

    async fn run_fulltext(&self, query_text: &str) -> Vec<Block> {
        match self
            .client
            .search_full_text(query_text, 1, self.config.two_stage.candidate_limit_per_path as u32, None)
            .await
        {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| {
                    let id = row_str(row, "id")?;
                    Some(Block {
                        root_id: row_str(row, "rootID").unwrap_or_else(|| id.clone()),
                        id,
                        hpath: row_str(row, "path").or_else(|| row_str(row, "hPath")).unwrap_or_default(),
                        content: row_str(row, "content").unwrap_or_default(),
                        updated_at: row_str(row, "updated"),
                        source: BlockSource::Fulltext,
                        score: 0.0,
                        native_rank: None,
                        markdown: None,
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "fulltext search path failed");
                Vec::new()
            }
        }
    }

    async fn run_sql(&self, intent: &Intent) -> Vec<Block> {
        if intent.keywords.is_empty() {
            return Vec::new();
        }
        let time_clause = intent
            .time_range
            .as_ref()
            .map(|tr| format!(" AND updated > '{}'", tr.since.replace('\'', "")))
            .unwrap_or_default();
        let stmt = format!(
            "SELECT id, content, hpath, updated, box FROM blocks WHERE ({}){} AND type != 'd' AND content IS NOT NULL AND TRIM(content) != '' ORDER BY updated DESC LIMIT {}",
            build_sql_like_clause(&intent.keywords),
            time_clause,
            self.config.two_stage.candidate_limit_per_path
        );
        match self.client.sql(&stmt).await {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| {
                    let id = row_str(row, "id")?;
                    Some(Block {
                        root_id: id.clone(),
                        id,
                        hpath: row_str(row, "hpath").unwrap_or_default(),
                        content: row_str(row, "content").unwrap_or_default(),
                        updated_at: row_str(row, "updated"),
                        source: BlockSource::Sql,
                        score: 0.0,
                        native_rank: None,
                        markdown: None,
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "sql search path failed");
                Vec::new()
            }
        }
    }

    /// Runs every configured search path, scores and dedups blocks (keeping
    /// the highest-scoring copy of a repeated block id), and applies the
    /// two-stage cap/limit before aggregation (spec §4.E).
    async fn candidate_blocks(&self, intent: &Intent, query_text: &str) -> Vec<Block> {
        let mut blocks = Vec::new();
        for path in &self.config.search_paths {
            let mut path_blocks = match path {
                SearchPath::Fts => self.run_fts(intent, query_text).await,
                SearchPath::Fulltext => self.run_fulltext(query_text).await,
                SearchPath::Sql => self.run_sql(intent).await,
            };
            blocks.append(&mut path_blocks);
        }

        let query_lower = query_text.to_lowercase();
        let scored: Vec<Block> = blocks
            .into_iter()
            .map(|b| score_block(b, &intent.keywords, &query_lower))
            .collect();

        let mut best_by_id: HashMap<String, Block> = HashMap::new();
        for block in scored {
            best_by_id
                .entry(block.id.clone())
                .and_modify(|existing| {
                    if block.score > existing.score {
                        *existing = block.clone();
                    }
                })
                .or_insert(block);
        }

        let mut deduped: Vec<Block> = best_by_id.into_values().collect();
        deduped.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        if !self.config.two_stage.enabled {
            deduped.truncate(self.config.two_stage.final_block_limit);
            return deduped;
        }

        let mut per_doc_count: HashMap<String, usize> = HashMap::new();
        let mut capped = Vec::new();
        for block in deduped {
            let count = per_doc_count.entry(block.root_id.clone()).or_insert(0);
            if *count >= self.config.two_stage.per_doc_block_cap {
                continue;
            }
            *count += 1;
            capped.push(block);
            if capped.len() >= self.config.two_stage.final_block_limit {
                break;
            }
        }
        capped
    }

    /// Groups blocks by document, scores each document, filters by minimum
    /// keyword coverage, and applies topic/anchor narrowing with graceful
    /// fallback when narrowing would drop every candidate (spec §4.E
    /// "Aggregation into documents", §9 narrowing order decision).
    pub async fn search(&self, intent: &Intent, query_text: &str) -> Vec<AggregatedDoc> {
        let blocks = self.candidate_blocks(intent, query_text).await;
        if blocks.is_empty() {
            return Vec::new();
        }

        let mut by_doc: HashMap<String, Vec<Block>> = HashMap::new();
        for block in blocks {
            by_doc.entry(block.root_id.clone()).or_default().push(block);
        }

        let mut docs: Vec<AggregatedDoc> = by_doc
            .into_iter()
            .map(|(doc_id, mut group)| {
                group.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
                dedup_by_content_prefix(&mut group);

                let top_n = group.len().min(5);
                let avg_top = group[..top_n].iter().map(|b| b.score).sum::<f64>() / top_n as f64;

                let hpath = group[0].hpath.clone();
                let hpath_lower = hpath.to_lowercase();

                // Coverage scans path + blocks (spec §4.E "Compute
                // keywordCoverage ... by scanning path + blocks"); the score
                // boost counts only path hits ("0.1 x matched_path_keywords").
                let mut matched_keywords: Vec<String> = Vec::new();
                let mut matched_path_keywords = 0usize;
                for k in &intent.keywords {
                    let k_lower = k.to_lowercase();
                    let in_path = hpath_lower.contains(&k_lower);
                    let in_blocks = group.iter().any(|b| b.content.to_lowercase().contains(&k_lower));
                    if in_path {
                        matched_path_keywords += 1;
                    }
                    if in_path || in_blocks {
                        matched_keywords.push(k.clone());
                    }
                }
                let coverage = KeywordCoverage {
                    matched_count: matched_keywords.len(),
                    matched_keywords,
                };
                let keyword_boost = matched_path_keywords as f64 * 0.1;
                let score = (1.0 - (-avg_top).exp()) + keyword_boost;
                let updated_at = group
                    .iter()
                    .filter_map(|b| b.updated_at.clone())
                    .max();

                AggregatedDoc {
                    doc_id,
                    hpath,
                    updated_at,
                    score,
                    coverage,
                    blocks: group,
                }
            })
            .collect();

        let min_coverage = if is_cjk_phrase_intent(&intent.keywords) { 2 } else { 1 };
        if !intent.keywords.is_empty() {
            docs = narrow_with_fallback(docs, |d| d.coverage.matched_count >= min_coverage);
        }

        // Topic narrowing only engages when a configured topic keyword
        // actually appears in the query (spec §4.E "if any configured
        // topicKeywords appear in the query"); it then checks the hpath and
        // each block's top-line heading only, not the full body — a doc that
        // merely mentions a topic deep in its content does not count as
        // "about" that topic.
        let query_lower_for_topics = query_text.to_lowercase();
        let topic_in_query = self
            .config
            .topic_keywords
            .iter()
            .any(|t| query_lower_for_topics.contains(&t.to_lowercase()));
        if topic_in_query {
            docs = narrow_with_fallback(docs, |d| {
                self.config.topic_keywords.iter().any(|t| {
                    let t = t.to_lowercase();
                    d.hpath.to_lowercase().contains(&t)
                        || d.blocks.iter().any(|b| {
                            let first = b.first_line();
                            first.trim_start().starts_with('#') && first.to_lowercase().contains(&t)
                        })
                })
            });
        }

        let anchors = anchor_keywords(&intent.keywords, &self.config.topic_keywords);
        if !anchors.is_empty() {
            docs = narrow_with_fallback(docs, |d| {
                anchors.iter().any(|a| d.coverage.matched_keywords.iter().any(|k| k.eq_ignore_ascii_case(a)))
            });
        }

        docs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        docs.truncate(self.config.max_docs);
        docs
    }
}

fn dedup_by_content_prefix(blocks: &mut Vec<Block>) {
    let mut seen_prefixes: HashSet<String> = HashSet::new();
    blocks.retain(|b| {
        let prefix: String = b.content.chars().take(50).collect();
        seen_prefixes.insert(prefix)
    });
}

/// Filters `docs` by `predicate`, but falls back to the unfiltered set if
/// the predicate would drop every document (spec §9: topic and anchor
/// narrowing each apply with graceful fall-back rather than ever zeroing
/// out a non-empty result set).
fn narrow_with_fallback<F: Fn(&AggregatedDoc) -> bool>(docs: Vec<AggregatedDoc>, predicate: F) -> Vec<AggregatedDoc> {
    if docs.is_empty() {
        return docs;
    }
    let narrowed: Vec<AggregatedDoc> = docs.iter().filter(|d| predicate(d)).cloned().collect();
    if narrowed.is_empty() {
        docs
    } else {
        narrowed
    }
}
