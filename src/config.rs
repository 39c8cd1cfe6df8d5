//! Configuration schema (spec §6) and merge/precedence chain: `defaults <
//! file < gateway overrides < env`. File parsing is a convenience — the
//! host gateway decides where the file lives and when to reload it — but
//! the precedence chain itself is this crate's responsibility since
//! `lifecycle::register` (§4.H) names it as its first step.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SiyuanConfig {
    pub api_url: String,
    pub api_token: String,
}

impl Default for SiyuanConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:6806".to_string(),
            api_token: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub enabled: bool,
    pub db_path: String,
    pub sync_interval_ms: u64,
    pub privacy_notebook: Option<String>,
    pub archive_notebook: Option<String>,
    pub skip_notebook_names: Vec<String>,
    pub section_heading_levels: Vec<u8>,
    pub max_sections_to_index: usize,
    pub section_max_chars: usize,
    pub section_dedup_lines: bool,
    pub section_dedup_window_size: usize,
    pub doc_content_dedup_lines: bool,
    pub doc_content_dedup_window_size: usize,
    pub sql_page_size: usize,
    /// Not in spec.md's recognized option list verbatim but called out in
    /// §9 as a follow-up fold-in: caps concurrent markdown fetches during
    /// initial sync so large notebooks don't open thousands of requests at
    /// once.
    pub max_concurrent_fetches: usize,
    pub cleanup_age_days: i64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: "./recall-index.db".to_string(),
            sync_interval_ms: 5 * 60 * 1000,
            privacy_notebook: None,
            archive_notebook: None,
            skip_notebook_names: Vec::new(),
            section_heading_levels: vec![2],
            max_sections_to_index: 200,
            section_max_chars: 1200,
            section_dedup_lines: true,
            section_dedup_window_size: 200,
            doc_content_dedup_lines: true,
            doc_content_dedup_window_size: 400,
            sql_page_size: 200,
            max_concurrent_fetches: 4,
            cleanup_age_days: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoStageConfig {
    pub enabled: bool,
    pub candidate_limit_per_path: usize,
    pub final_block_limit: usize,
    pub per_doc_block_cap: usize,
}

impl Default for TwoStageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            candidate_limit_per_path: 100,
            final_block_limit: 40,
            per_doc_block_cap: 6,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPath {
    Fts,
    Fulltext,
    Sql,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkedDocConfig {
    pub enabled: bool,
    pub host_keywords: Vec<String>,
    pub max_count: usize,
}

impl Default for LinkedDocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host_keywords: Vec::new(),
            max_count: 3,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub enabled: bool,
    pub min_prompt_length: usize,
    pub max_context_tokens: usize,
    pub max_docs: usize,
    pub max_keywords: usize,
    pub search_paths: Vec<SearchPath>,
    pub topic_keywords: Vec<String>,
    pub skip_intent_types: Vec<String>,
    pub block_excerpt_max_chars: usize,
    pub two_stage: TwoStageConfig,
    pub linked_doc: Option<LinkedDocConfig>,
    pub request_timeout_ms: u64,
    pub skip_phrases: Vec<String>,
    pub force_phrases: Vec<String>,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_prompt_length: 6,
            max_context_tokens: 2000,
            max_docs: 5,
            max_keywords: 12,
            search_paths: vec![SearchPath::Fts, SearchPath::Fulltext, SearchPath::Sql],
            topic_keywords: Vec::new(),
            skip_intent_types: vec!["chat".to_string(), "command".to_string()],
            block_excerpt_max_chars: 540,
            two_stage: TwoStageConfig::default(),
            linked_doc: None,
            request_timeout_ms: 10_000,
            skip_phrases: vec![
                "不用回忆".to_string(),
                "don't recall".to_string(),
                "no context".to_string(),
            ],
            force_phrases: vec![
                "查一下我的笔记".to_string(),
                "search my notes".to_string(),
            ],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub siyuan: SiyuanConfig,
    pub index: IndexConfig,
    pub recall: RecallConfig,
    pub linked_doc: LinkedDocConfig,
}

impl Config {
    /// Reads an optional TOML config file. Missing file is not an error —
    /// defaults apply — but a present-and-unparsable file is `ErrConfig`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RecallError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| RecallError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Applies a gateway-supplied override on top of `self`. Within a
    /// provided section every field from `other` wins, matching the
    /// coarse-grained precedence rule in spec §6.
    pub fn merge(mut self, other: PartialConfig) -> Self {
        if let Some(siyuan) = other.siyuan {
            self.siyuan = siyuan;
        }
        if let Some(index) = other.index {
            self.index = index;
        }
        if let Some(recall) = other.recall {
            self.recall = recall;
        }
        if let Some(linked_doc) = other.linked_doc {
            self.linked_doc = linked_doc;
        }
        self
    }

    /// `SIYUAN_API_URL` / `SIYUAN_API_TOKEN` always win, applied last.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("SIYUAN_API_URL") {
            self.siyuan.api_url = url;
        }
        if let Ok(token) = std::env::var("SIYUAN_API_TOKEN") {
            self.siyuan.api_token = token;
        }
        self
    }

    /// Resolves `recall.linked_doc`, falling back to the top-level
    /// `linked_doc` section for backward compatibility (spec §6 notes both
    /// locations are accepted).
    pub fn linked_doc(&self) -> LinkedDocConfig {
        self.recall
            .linked_doc
            .clone()
            .unwrap_or_else(|| self.linked_doc.clone())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.index.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.recall.request_timeout_ms)
    }

    /// Loads the merged configuration: `defaults < file < gateway < env`,
    /// the exact chain §4.H's `register()` names as its first step.
    pub fn load(file_path: Option<&Path>, gateway_overrides: Option<PartialConfig>) -> Result<Self> {
        let mut cfg = match file_path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        if let Some(overrides) = gateway_overrides {
            cfg = cfg.merge(overrides);
        }
        Ok(cfg.apply_env_overrides())
    }
}

/// A partially-specified config used for the "gateway overrides" layer —
/// only the sections actually supplied by the host are non-`None`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PartialConfig {
    pub siyuan: Option<SiyuanConfig>,
    pub index: Option<IndexConfig>,
    pub recall: Option<RecallConfig>,
    pub linked_doc: Option<LinkedDocConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.recall.max_context_tokens, 2000);
        assert_eq!(cfg.recall.two_stage.per_doc_block_cap, 6);
        assert_eq!(cfg.recall.two_stage.final_block_limit, 40);
        assert_eq!(cfg.index.sync_interval_ms, 300_000);
        assert_eq!(cfg.linked_doc.max_count, 3);
    }

    // `SIYUAN_API_URL` is process-wide state; serialize against any other
    // test in this binary that depends on a specific `siyuan.api_url`
    // (e.g. `hooks::tests`, `lifecycle` doctests) so they can't observe a
    // value mutated here mid-run.
    #[test]
    #[serial_test::serial(siyuan_env)]
    fn env_overrides_win() {
        // SAFETY: test-only, serialized against other siyuan_env tests.
        unsafe {
            std::env::set_var("SIYUAN_API_URL", "http://example.test:6806");
        }
        let cfg = Config::default().apply_env_overrides();
        assert_eq!(cfg.siyuan.api_url, "http://example.test:6806");
        unsafe {
            std::env::remove_var("SIYUAN_API_URL");
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::from_file("/nonexistent/path/recall.toml").unwrap();
        assert_eq!(cfg.recall.max_docs, 5);
    }

    #[test]
    fn linked_doc_backward_compat() {
        let mut cfg = Config::default();
        cfg.linked_doc.max_count = 7;
        assert_eq!(cfg.linked_doc().max_count, 7);

        cfg.recall.linked_doc = Some(LinkedDocConfig {
            max_count: 2,
            ..Default::default()
        });
        assert_eq!(cfg.linked_doc().max_count, 2);
    }
}
