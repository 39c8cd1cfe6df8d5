//! End-to-end tests driving the real hook surface (`hooks::router`) against
//! a `Lifecycle` built from test config, exercising the concrete scenarios
//! in the specification's testable-properties section.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use recall_sidecar::config::{Config, LinkedDocConfig, PartialConfig, RecallConfig, SearchPath, SiyuanConfig};
use recall_sidecar::hooks;
use recall_sidecar::lifecycle::Lifecycle;
use recall_sidecar::model::{Document, Section};

/// Builds a `Lifecycle` pointed at an unreachable note-store (so recall
/// always falls back to the local FTS index) with indexing disabled, since
/// these tests seed the local index directly rather than syncing.
async fn test_lifecycle(recall: RecallConfig, linked_doc: LinkedDocConfig) -> Arc<Lifecycle> {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.index.db_path = dir.keep().join("index.db").to_str().unwrap().to_string();
    config.index.enabled = false;
    config.siyuan = SiyuanConfig {
        api_url: "http://127.0.0.1:1".to_string(),
        api_token: String::new(),
    };
    config.recall = recall;
    config.linked_doc = linked_doc;

    let overrides = PartialConfig {
        siyuan: Some(config.siyuan.clone()),
        index: Some(config.index.clone()),
        recall: Some(config.recall.clone()),
        linked_doc: Some(config.linked_doc.clone()),
    };
    Lifecycle::register(None, Some(overrides)).await.unwrap()
}

async fn post_prompt(lifecycle: Arc<Lifecycle>, prompt: &str) -> Value {
    let app = hooks::router(lifecycle);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/hooks/before-agent-start")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({ "prompt": prompt }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn doc(id: &str, hpath: &str, content: &str) -> (Document, Vec<Section>) {
    (
        Document {
            id: id.to_string(),
            title: hpath.rsplit('/').next().unwrap_or(hpath).to_string(),
            hpath: hpath.to_string(),
            notebook_id: "nb1".to_string(),
            notebook_name: "default".to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            tags: None,
            markdown: content.to_string(),
            content: content.to_string(),
        },
        Vec::new(),
    )
}

/// Scenario 1 (spec §8): force phrase stripped, recall runs against the
/// local index, output carries the `## 📄` header and the substring "Rust".
#[tokio::test]
async fn force_search_stripping_surfaces_matching_doc() {
    let mut recall = RecallConfig::default();
    recall.search_paths = vec![SearchPath::Fts];
    let lifecycle = test_lifecycle(recall, LinkedDocConfig::default()).await;

    let (d, sections) = doc("doc1", "/notes/rust", "Rust ownership rules explained in depth");
    lifecycle.store().index_document(d, sections).await.unwrap();

    let json = post_prompt(lifecycle, "search my notes for Rust ownership rules").await;
    assert_ne!(json["skipped"], true);
    let context = json["prependContext"].as_str().unwrap();
    assert!(context.contains("## 📄"));
    assert!(context.contains("Rust"));
}

/// Scenario 2 (spec §8): a slash command is skipped with an `intent_`
/// prefixed reason and an empty context, with no note-store traffic — the
/// lifecycle is built against an unreachable URL, so any attempted call
/// would surface as a hang/error rather than a silent pass.
#[tokio::test]
async fn slash_command_is_skipped_with_intent_reason() {
    let lifecycle = test_lifecycle(RecallConfig::default(), LinkedDocConfig::default()).await;
    let json = post_prompt(lifecycle, "/help please show commands").await;
    assert_eq!(json["prependContext"], "");
    assert_eq!(json["skipped"], true);
    assert!(json["reason"].as_str().unwrap().starts_with("intent_"));
}

/// Scenario 3 (spec §8): a short prompt that only carries a linked-doc
/// reference still bypasses the min-length gate and resolves the block.
#[tokio::test]
async fn linked_doc_reference_bypasses_min_length() {
    let mut server = mockito::Server::new_async().await;
    let _kramdown = server
        .mock("POST", "/api/block/getBlockKramdown")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"code":0,"msg":"","data":{"id":"20220802180638-lhtbfty","kramdown":"# Linked note\nbody text"}}"#)
        .create_async()
        .await;
    let _info = server
        .mock("POST", "/api/block/getBlockInfo")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"code":0,"msg":"","data":{"hpath":"/notes/linked","updated":"20260101120000"}}"#)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.index.db_path = dir.keep().join("index.db").to_str().unwrap().to_string();
    config.index.enabled = false;
    config.siyuan = SiyuanConfig { api_url: server.url(), api_token: String::new() };
    config.recall.min_prompt_length = 10;
    let overrides = PartialConfig {
        siyuan: Some(config.siyuan.clone()),
        index: Some(config.index.clone()),
        recall: Some(config.recall.clone()),
        linked_doc: Some(config.linked_doc.clone()),
    };
    let lifecycle = Lifecycle::register(None, Some(overrides)).await.unwrap();

    let json = post_prompt(lifecycle, "http://127.0.0.1:9081?id=20220802180638-lhtbfty").await;
    assert_ne!(json["skipped"], true);
    let context = json["prependContext"].as_str().unwrap();
    assert!(context.contains("```markdown"));
    assert!(context.contains("Linked note"));
}

/// Scenario 4 (spec §8): a host-keyword allowlist that the link's host
/// doesn't satisfy blocks resolution entirely; `getBlockKramdown` is never
/// called (mockito's `.expect(0)` asserts this) and the context stays empty.
#[tokio::test]
async fn host_keyword_allowlist_blocks_non_matching_link() {
    let mut server = mockito::Server::new_async().await;
    let kramdown_mock = server
        .mock("POST", "/api/block/getBlockKramdown")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"code":0,"msg":"","data":{"id":"x","kramdown":"whatever"}}"#)
        .expect(0)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.index.db_path = dir.keep().join("index.db").to_str().unwrap().to_string();
    config.index.enabled = false;
    config.siyuan = SiyuanConfig { api_url: server.url(), api_token: String::new() };
    config.recall.min_prompt_length = 10;
    config.linked_doc = LinkedDocConfig {
        enabled: true,
        host_keywords: vec!["allowed.example.com".to_string()],
        max_count: 3,
    };
    let overrides = PartialConfig {
        siyuan: Some(config.siyuan.clone()),
        index: Some(config.index.clone()),
        recall: Some(config.recall.clone()),
        linked_doc: Some(config.linked_doc.clone()),
    };
    let lifecycle = Lifecycle::register(None, Some(overrides)).await.unwrap();

    let json = post_prompt(lifecycle, "http://127.0.0.1:9081?id=20220802180638-lhtbfty").await;
    assert_eq!(json["prependContext"], "");
    kramdown_mock.assert_async().await;
}

/// Scenario 5 (spec §8): two-stage diversity cap limits the final block
/// count and caps per-document contributions, driven straight through the
/// retrieval engine rather than the HTTP surface since it inspects block
/// counts the formatted markdown doesn't expose directly.
#[tokio::test]
async fn two_stage_diversity_cap_limits_blocks_per_doc() {
    use recall_sidecar::model::{Intent, IntentType};
    use recall_sidecar::retrieval::RetrievalEngine;

    let mut recall = RecallConfig::default();
    recall.two_stage.enabled = true;
    recall.two_stage.candidate_limit_per_path = 50;
    recall.two_stage.final_block_limit = 5;
    recall.two_stage.per_doc_block_cap = 2;
    recall.search_paths = vec![SearchPath::Fts];

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.keep().join("index.db").to_str().unwrap().to_string();
    let store = recall_sidecar::store::IndexStore::open(&db_path, Vec::new()).await.unwrap();

    for doc_id in ["A", "B", "C"] {
        let sections: Vec<Section> = (0..20)
            .map(|i| Section {
                id: format!("{doc_id}-{i}"),
                doc_id: doc_id.to_string(),
                content: format!("keyword hit number {i} about rust ownership"),
            })
            .collect();
        let (document, _) = doc(doc_id, &format!("/notes/{doc_id}"), "rust ownership overview");
        store.index_document(document, sections).await.unwrap();
    }

    let client = recall_sidecar::client::NoteStoreClient::new("http://127.0.0.1:1", "", std::time::Duration::from_secs(1));
    let engine = RetrievalEngine::new(&client, &store, &recall);
    let intent = Intent { keywords: vec!["rust".to_string(), "ownership".to_string()], time_range: None, r#type: IntentType::Query };
    let docs = engine.search(&intent, "rust ownership").await;

    let total_blocks: usize = docs.iter().map(|d| d.blocks.len()).sum();
    assert!(total_blocks <= recall.two_stage.final_block_limit);
    for d in &docs {
        assert!(d.blocks.len() <= recall.two_stage.per_doc_block_cap);
    }
}

/// Scenario 6 (spec §8): with `topicKeywords=["简历"]` configured, only the
/// document whose `hpath` contains the topic keyword survives narrowing —
/// the other document only matches in its content, not its path.
#[tokio::test]
async fn topic_narrowing_keeps_only_path_match() {
    use recall_sidecar::model::{Intent, IntentType};
    use recall_sidecar::retrieval::RetrievalEngine;

    let mut recall = RecallConfig::default();
    recall.search_paths = vec![SearchPath::Fts];
    recall.topic_keywords = vec!["简历".to_string()];

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.keep().join("index.db").to_str().unwrap().to_string();
    let store = recall_sidecar::store::IndexStore::open(&db_path, Vec::new()).await.unwrap();

    let (resume_doc, _) = doc("resume", "/个人/【简历】resume", "工作经历 项目经验 简历内容");
    store.index_document(resume_doc, Vec::new()).await.unwrap();
    let (health_doc, _) = doc("health", "/杂项/健康", "关于简历写作的一些零散笔记");
    store.index_document(health_doc, Vec::new()).await.unwrap();

    let client = recall_sidecar::client::NoteStoreClient::new("http://127.0.0.1:1", "", std::time::Duration::from_secs(1));
    let engine = RetrievalEngine::new(&client, &store, &recall);
    let intent = Intent { keywords: vec!["简历".to_string()], time_range: None, r#type: IntentType::Query };
    let docs = engine.search(&intent, "简历").await;

    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].doc_id, "resume");
}
