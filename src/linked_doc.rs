//! Linked-Doc Resolver (spec §4.F): finds SiYuan block ids referenced
//! directly in the prompt (pasted links, bare ids) and resolves them into
//! synthetic `Block` entities so they always appear in the formatted
//! context, independent of the retrieval engine's scoring.

use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::client::NoteStoreClient;
use crate::config::LinkedDocConfig;
use crate::model::{Block, BlockSource};
use crate::sync::sanitize_kramdown;

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{14}-[a-z0-9]{7}").unwrap())
}

fn url_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s)\]]+").unwrap())
}

/// Extracts every 14-digit-timestamp + 7-char-suffix block id referenced in
/// `text`: inside URL query params, URL path segments, and bare in running
/// text. Ids are deduped in first-seen order and capped at `max_count`
/// (spec §4.F).
pub fn extract_linked_ids(text: &str, config: &LinkedDocConfig) -> Vec<String> {
    if !config.enabled {
        return Vec::new();
    }

    let mut found = Vec::new();
    let mut allowed_url_seen = false;
    for m in url_pattern().find_iter(text) {
        let raw_url = m.as_str();
        if let Ok(url) = Url::parse(raw_url) {
            if !config.host_keywords.is_empty() {
                let host = url.host_str().unwrap_or("");
                let href = url.as_str();
                if !config
                    .host_keywords
                    .iter()
                    .any(|k| host.contains(k.as_str()) || href.contains(k.as_str()))
                {
                    continue;
                }
            }
            allowed_url_seen = true;
            for id in id_pattern().find_iter(raw_url) {
                found.push(id.as_str().to_string());
            }
        }
    }

    // Bare ids in running text are only trusted once an allowed URL has
    // vouched for the prompt, or when there's no allowlist to violate
    // (spec §4.F step 3).
    if config.host_keywords.is_empty() || allowed_url_seen {
        for id in id_pattern().find_iter(text) {
            found.push(id.as_str().to_string());
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut deduped = Vec::new();
    for id in found {
        if seen.insert(id.clone()) {
            deduped.push(id);
        }
        if deduped.len() >= config.max_count {
            break;
        }
    }
    deduped
}

pub fn has_linked_doc_reference(text: &str, config: &LinkedDocConfig) -> bool {
    !extract_linked_ids(text, config).is_empty()
}

/// Resolves each id to a synthesized `Block` carrying the full sanitized
/// markdown (spec §4.F). Kramdown fetch failures fall back to a minimal
/// placeholder block rather than dropping the reference (§4.F "best
/// effort"); only a missing block (no kramdown and no block info at all) is
/// skipped.
pub async fn resolve(client: &NoteStoreClient, ids: &[String]) -> Vec<Block> {
    let mut blocks = Vec::new();
    for id in ids {
        match client.get_block_kramdown(id).await {
            Ok(kramdown) => {
                let sanitized = sanitize_kramdown(&kramdown.kramdown);
                let hpath = client
                    .get_block_info(id)
                    .await
                    .ok()
                    .and_then(|info| info.hpath)
                    .unwrap_or_else(|| format!("[linked:{id}]"));
                blocks.push(Block {
                    id: id.clone(),
                    root_id: id.clone(),
                    hpath,
                    content: sanitized.clone(),
                    updated_at: None,
                    source: BlockSource::LinkedDoc,
                    score: 1.0,
                    native_rank: None,
                    markdown: Some(sanitized),
                });
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "failed to resolve linked doc, using placeholder");
                blocks.push(Block {
                    id: id.clone(),
                    root_id: id.clone(),
                    hpath: format!("[linked:{id}]"),
                    content: String::new(),
                    updated_at: None,
                    source: BlockSource::LinkedDoc,
                    score: 1.0,
                    native_rank: None,
                    markdown: None,
                });
            }
        }
    }
    blocks
}

/// Merges linked-doc blocks into retrieval results, deduping by doc id —
/// a block already surfaced by retrieval is left where it is rather than
/// replaced by the linked-doc synthesis (spec §4.F "merge").
pub fn merge_unique(mut linked: Vec<Block>, existing_doc_ids: &std::collections::HashSet<String>) -> Vec<Block> {
    linked.retain(|b| !existing_doc_ids.contains(&b.root_id));
    linked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LinkedDocConfig {
        LinkedDocConfig {
            enabled: true,
            host_keywords: vec![],
            max_count: 3,
        }
    }

    #[test]
    fn extracts_bare_id_from_text() {
        let ids = extract_linked_ids("check out 20260115093000-ab3xyz9 for context", &cfg());
        assert_eq!(ids, vec!["20260115093000-ab3xyz9"]);
    }

    #[test]
    fn extracts_id_from_url_query_param() {
        let ids = extract_linked_ids(
            "see http://127.0.0.1:6806/stage/build/app/siyuan.html?id=20260115093000-ab3xyz9#",
            &cfg(),
        );
        assert_eq!(ids, vec!["20260115093000-ab3xyz9"]);
    }

    #[test]
    fn dedups_and_caps_at_max_count() {
        let mut config = cfg();
        config.max_count = 1;
        let ids = extract_linked_ids(
            "20260115093000-ab3xyz9 and again 20260115093000-ab3xyz9 and 20260115093001-cd4wyz8",
            &config,
        );
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn host_keyword_allowlist_filters_urls() {
        let mut config = cfg();
        config.host_keywords = vec!["notes.internal".to_string()];
        let ids = extract_linked_ids(
            "http://example.com/x?id=20260115093000-ab3xyz9",
            &config,
        );
        assert!(ids.is_empty());
    }

    #[test]
    fn disabled_config_finds_nothing() {
        let mut config = cfg();
        config.enabled = false;
        let ids = extract_linked_ids("20260115093000-ab3xyz9", &config);
        assert!(ids.is_empty());
    }
}
