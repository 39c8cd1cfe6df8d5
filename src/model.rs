//! Shared data model (spec §3): documents, sections, and the retrieval-time
//! `Block` view. These are plain data — no behavior — shared by the index
//! store, sync service, retrieval engine, and formatter.

use serde::{Deserialize, Serialize};

/// A logical note, identified by a stable opaque id (spec §3 Document).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub title: String,
    /// Hierarchical path, leading `/<notebook>/<segments...>`.
    pub hpath: String,
    pub notebook_id: String,
    pub notebook_name: String,
    pub updated_at: String,
    pub tags: Option<Vec<String>>,
    pub markdown: String,
    /// Dedup-compressed markdown used as the document-level FTS body.
    pub content: String,
}

impl Document {
    /// Infers the notebook name for exclusion checks: the caller-supplied
    /// `notebook_name`, falling back to the first path segment of `hpath`
    /// (spec §4.B notebook exclusion policy).
    pub fn inferred_notebook_name(&self) -> &str {
        if !self.notebook_name.is_empty() {
            return &self.notebook_name;
        }
        self.hpath
            .trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or("")
    }
}

/// A markdown subrange split at a configured heading level (spec §3
/// Section). The synthetic id is `"<docId>::h<level>::<lineIndex>"`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Section {
    pub id: String,
    pub doc_id: String,
    pub content: String,
}

impl Section {
    pub fn synthetic_id(doc_id: &str, level: u8, line_index: usize) -> String {
        format!("{doc_id}::h{level}::{line_index}")
    }
}

/// The origin search path that produced a `Block`, preserved so the
/// retrieval engine can weight and tag results (spec §4.E).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockSource {
    Fts,
    Fulltext,
    Sql,
    LinkedDoc,
}

impl BlockSource {
    /// Base scoring weight per spec §4.E: fts=1.0, fulltext=0.9, sql=0.75.
    /// Linked docs are synthesized with a fixed score of 1 and never pass
    /// through the scorer, so they have no base weight of their own.
    pub fn base_weight(self) -> f64 {
        match self {
            BlockSource::Fts => 1.0,
            BlockSource::Fulltext => 0.9,
            BlockSource::Sql => 0.75,
            BlockSource::LinkedDoc => 1.0,
        }
    }
}

/// The unit returned by any search path (spec §3 Block / retrieval view).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub id: String,
    pub root_id: String,
    pub hpath: String,
    pub content: String,
    pub updated_at: Option<String>,
    pub source: BlockSource,
    pub score: f64,
    /// Native FTS rank, if the path surfaced one (spec §4.E scoring: "if
    /// the block carries a native FTS rank"). SQLite FTS5's `rank` is
    /// smaller-is-better; this is that raw value, pre-transform.
    pub native_rank: Option<f64>,
    /// Present only for synthesized linked-doc entities (spec §4.F): the
    /// full markdown of the resolved note, rendered verbatim by the
    /// formatter instead of as an excerpt.
    pub markdown: Option<String>,
}

impl Block {
    pub fn first_line(&self) -> &str {
        self.content.lines().next().unwrap_or("").trim()
    }

    pub fn rest_lines(&self) -> String {
        self.content
            .lines()
            .skip(1)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }
}

/// Coverage bookkeeping attached to an aggregated document (spec §4.E
/// "keywordCoverage").
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct KeywordCoverage {
    pub matched_count: usize,
    pub matched_keywords: Vec<String>,
}

/// A document after block aggregation (spec §4.E "Aggregation into
/// documents"), ready for the formatter.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AggregatedDoc {
    pub doc_id: String,
    pub hpath: String,
    pub updated_at: Option<String>,
    pub score: f64,
    pub coverage: KeywordCoverage,
    pub blocks: Vec<Block>,
}

/// Outcome of intent gating (spec §4.D).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateDecision {
    pub should: bool,
    pub reason: String,
}

impl GateDecision {
    pub fn new(should: bool, reason: impl Into<String>) -> Self {
        Self {
            should,
            reason: reason.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Chat,
    Command,
    Review,
    Search,
    Query,
}

impl IntentType {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentType::Chat => "chat",
            IntentType::Command => "command",
            IntentType::Review => "review",
            IntentType::Search => "search",
            IntentType::Query => "query",
        }
    }
}

/// A detected time window, e.g. from "last week" (spec §4.D Time range).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimeRange {
    pub days: i64,
    pub since: String,
}

/// The analyzer's output describing what the prompt is asking for (spec
/// §4.D).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub keywords: Vec<String>,
    pub time_range: Option<TimeRange>,
    pub r#type: IntentType,
}
