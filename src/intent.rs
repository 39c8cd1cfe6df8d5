//! Intent Analyzer (spec §4.D): decides whether a prompt should trigger
//! recall at all, and if so extracts the keywords and time window used by
//! the retrieval engine.

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;

use crate::config::RecallConfig;
use crate::model::{GateDecision, Intent, IntentType, TimeRange};

const FRAMING_PARTICLES: &[&str] = &["告诉我", "帮我", "的", "了", "吗", "呢", "啊", "呀", "吧"];

const LATIN_STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "to", "of", "in", "on", "for", "and", "or",
    "my", "me", "i", "you", "it", "this", "that", "do", "does", "did", "please", "can", "could",
    "about", "with",
];

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "你好", "嗨", "早上好", "晚上好", "good morning", "good evening",
];

fn command_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[/!]").unwrap())
}

fn cjk_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\p{Han}+").unwrap())
}

fn latin_word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z][A-Za-z0-9_-]*").unwrap())
}

fn time_phrases() -> &'static [(&'static str, i64)] {
    &[
        ("today", 1),
        ("今天", 1),
        ("yesterday", 2),
        ("昨天", 2),
        ("last week", 7),
        ("this week", 7),
        ("本周", 7),
        ("上周", 7),
        ("past week", 7),
        ("last month", 30),
        ("this month", 30),
        ("本月", 30),
        ("上个月", 30),
        ("past month", 30),
    ]
}

/// Strips the matched prefix of a force phrase from the remaining prompt so
/// it isn't re-extracted as a keyword itself (spec §4.D rule 2).
fn strip_prefix_ci<'a>(text: &'a str, phrase: &str) -> &'a str {
    let lower = text.to_lowercase();
    if let Some(pos) = lower.find(&phrase.to_lowercase()) {
        let end = pos + phrase.len();
        if end <= text.len() {
            return text[end..].trim_start();
        }
    }
    text
}

/// True when `prompt` contains a configured explicit-skip phrase (spec
/// §4.D rule 1). Used on its own by the lifecycle coordinator to veto even
/// the linked-doc bypass (spec §4.F "Bypass"), since that rule always wins
/// regardless of whether recall itself is enabled.
pub fn is_explicit_skip(prompt: &str, config: &RecallConfig) -> bool {
    let lower = prompt.trim().to_lowercase();
    config.skip_phrases.iter().any(|p| lower.contains(&p.to_lowercase()))
}

/// Runs the seven ordered gating rules (spec §4.D "Gating") and returns
/// both the decision and the text keyword extraction should run against
/// (narrowed when a force phrase was stripped).
pub fn gate<'a>(prompt: &'a str, config: &RecallConfig, has_linked_doc_reference: bool) -> (GateDecision, &'a str) {
    let trimmed = prompt.trim();
    let lower = trimmed.to_lowercase();

    if !config.enabled {
        return (GateDecision::new(false, "recall disabled"), trimmed);
    }

    for phrase in &config.skip_phrases {
        if lower.contains(&phrase.to_lowercase()) {
            return (GateDecision::new(false, "explicit_skip"), trimmed);
        }
    }

    for phrase in &config.force_phrases {
        if lower.contains(&phrase.to_lowercase()) {
            let narrowed = strip_prefix_ci(trimmed, phrase);
            return (GateDecision::new(true, "explicit_force"), narrowed);
        }
    }

    if has_linked_doc_reference {
        return (GateDecision::new(true, "linked_doc"), trimmed);
    }

    if trimmed.chars().count() < config.min_prompt_length {
        return (GateDecision::new(false, "too_short"), trimmed);
    }

    if is_greeting(&lower) {
        return (GateDecision::new(false, "greeting"), trimmed);
    }

    let intent_type = detect_intent_type(trimmed, &lower);
    if config.skip_intent_types.contains(&intent_type.as_str().to_string()) {
        return (GateDecision::new(false, format!("intent_{}", intent_type.as_str())), trimmed);
    }

    (GateDecision::new(true, "default"), trimmed)
}

fn is_greeting(lower: &str) -> bool {
    let stripped = lower.trim_end_matches(|c: char| "!！?？。.".contains(c));
    GREETINGS.iter().any(|g| stripped == *g) && stripped.chars().count() < 12
}

fn detect_intent_type(original: &str, lower: &str) -> IntentType {
    if command_prefix().is_match(original) {
        return IntentType::Command;
    }
    if ["review", "check this", "检查", "看一下", "review this"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return IntentType::Review;
    }
    if ["search", "find", "查找", "搜索", "查一下"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return IntentType::Search;
    }
    if lower.ends_with('?')
        || lower.ends_with('？')
        || ["what", "why", "how", "when", "where", "什么", "为什么", "怎么"]
            .iter()
            .any(|k| lower.contains(k))
    {
        return IntentType::Query;
    }
    IntentType::Chat
}

/// Extracts up to `max_keywords` search keywords from `text` (spec §4.D
/// "Keyword extraction"). CJK runs of length >= 2 are kept whole; runs of
/// length >= 5 also contribute overlapping 2-grams so a long compound term
/// still matches shorter FTS tokens. Latin words are lowercased and
/// stopword-filtered; for the Latin set only, keywords are deduped, sorted
/// longest-first, and any keyword that is a substring of an already-kept
/// keyword is dropped (CJK keywords are exempt since short CJK runs are
/// frequently meaningful on their own).
/// Removes every duplicate (not just consecutive ones, unlike `Vec::dedup`)
/// while preserving first-seen order.
fn dedup_preserve_order(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.clone())).collect()
}

pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let mut cleaned = text.to_string();
    for particle in FRAMING_PARTICLES {
        cleaned = cleaned.replace(particle, " ");
    }

    let mut cjk_keywords = Vec::new();
    for m in cjk_run().find_iter(&cleaned) {
        let run = m.as_str();
        let chars: Vec<char> = run.chars().collect();
        if chars.len() >= 2 {
            cjk_keywords.push(run.to_string());
        }
        if chars.len() >= 5 {
            for window in chars.windows(2).take(20) {
                cjk_keywords.push(window.iter().collect());
            }
        }
    }
    let cjk_keywords = dedup_preserve_order(cjk_keywords);

    let mut latin_keywords: Vec<String> = latin_word()
        .find_iter(&cleaned)
        .map(|m| m.as_str().to_lowercase())
        .filter(|w| w.len() > 1 && !LATIN_STOPWORDS.contains(&w.as_str()))
        .collect();
    latin_keywords.sort_by(|a, b| b.len().cmp(&a.len()));
    latin_keywords.dedup();
    let mut kept_latin: Vec<String> = Vec::new();
    for word in latin_keywords {
        if kept_latin.iter().any(|k: &String| k.contains(&word)) {
            continue;
        }
        kept_latin.push(word);
    }

    let mut all = cjk_keywords;
    all.extend(kept_latin);
    let mut all = dedup_preserve_order(all);
    all.truncate(max_keywords);
    all
}

/// Detects a trailing time-range phrase and maps it to a day count and an
/// absolute `since` timestamp (spec §4.D "Time range").
pub fn extract_time_range(text: &str) -> Option<TimeRange> {
    let lower = text.to_lowercase();
    for (phrase, days) in time_phrases() {
        if lower.contains(phrase) {
            let since = (Utc::now() - chrono::Duration::days(*days)).to_rfc3339();
            return Some(TimeRange { days: *days, since });
        }
    }
    None
}

pub fn analyze(text: &str, config: &RecallConfig) -> Intent {
    Intent {
        keywords: extract_keywords(text, config.max_keywords),
        time_range: extract_time_range(text),
        r#type: detect_intent_type(text, &text.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RecallConfig {
        RecallConfig::default()
    }

    #[test]
    fn skip_phrase_blocks_recall() {
        let (decision, _) = gate("don't recall anything about this please", &cfg(), false);
        assert!(!decision.should);
    }

    #[test]
    fn force_phrase_wins_and_strips_prefix() {
        let (decision, narrowed) = gate("search my notes about rust ownership", &cfg(), false);
        assert!(decision.should);
        assert_eq!(narrowed, "about rust ownership");
    }

    #[test]
    fn short_prompt_is_skipped() {
        let (decision, _) = gate("hi ok", &cfg(), false);
        assert!(!decision.should);
        assert_eq!(decision.reason, "too_short");
    }

    #[test]
    fn command_intent_reason_has_intent_prefix() {
        let (decision, _) = gate("/help please show commands", &cfg(), false);
        assert!(!decision.should);
        assert!(decision.reason.starts_with("intent_"));
    }

    #[test]
    fn greeting_is_skipped() {
        let (decision, _) = gate("hello there friend", &cfg(), false);
        assert!(!decision.should);
    }

    #[test]
    fn linked_doc_reference_bypasses_other_rules() {
        let (decision, _) = gate("hi", &cfg(), true);
        assert!(decision.should);
        assert_eq!(decision.reason, "linked_doc");
    }

    #[test]
    fn chat_intent_is_excluded_by_default() {
        let (decision, _) = gate("just chatting about nothing specific today", &cfg(), false);
        assert!(!decision.should);
    }

    #[test]
    fn extracts_cjk_run_and_bigrams_for_long_runs() {
        let kws = extract_keywords("请帮我查找关于项目进度的笔记", 20);
        assert!(kws.iter().any(|k| k == "项目进度"));
        assert!(kws.iter().any(|k| k.chars().count() == 2));
    }

    #[test]
    fn dedups_non_adjacent_repeated_bigrams_across_separate_cjk_runs() {
        let kws = extract_keywords("项目进度汇报 其他内容 项目进度情况", 50);
        let count = |needle: &str| kws.iter().filter(|k| k.as_str() == needle).count();
        assert_eq!(count("项目"), 1);
        assert_eq!(count("进度"), 1);
    }

    #[test]
    fn extracts_latin_keywords_and_drops_substrings() {
        let kws = extract_keywords("tell me about ownership and borrowing in rust", 20);
        assert!(kws.contains(&"ownership".to_string()));
        assert!(kws.contains(&"borrowing".to_string()));
        assert!(!kws.contains(&"own".to_string()));
    }

    #[test]
    fn time_range_detects_last_week() {
        let tr = extract_time_range("what did I write last week about taxes").unwrap();
        assert_eq!(tr.days, 7);
    }

    #[test]
    fn query_intent_detected_for_question() {
        let t = detect_intent_type("what did I decide about the budget?", "what did i decide about the budget?");
        assert_eq!(t, IntentType::Query);
    }
}
