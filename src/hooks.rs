//! HTTP surface exposing the gateway's event hooks (spec §6 "External
//! interfaces"). The event bus itself and the conversation write/routing
//! subsystem are out of scope; this module only needs to accept the three
//! calls the gateway makes into a sidecar plugin and answer them.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::lifecycle::Lifecycle;

#[derive(Debug, Deserialize)]
struct BeforeAgentStart {
    prompt: String,
}

#[derive(Debug, Serialize)]
struct BeforeAgentStartResponse {
    #[serde(rename = "prependContext")]
    prepend_context: String,
    skipped: bool,
    reason: String,
}

async fn before_agent_start(
    State(lifecycle): State<Arc<Lifecycle>>,
    Json(req): Json<BeforeAgentStart>,
) -> Json<BeforeAgentStartResponse> {
    let outcome = match lifecycle.recall(&req.prompt).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::warn!(error = %e, "recall failed, returning empty context");
            crate::lifecycle::RecallOutcome { context: String::new(), skipped: true, reason: "error".to_string() }
        }
    };
    Json(BeforeAgentStartResponse {
        prepend_context: outcome.context,
        skipped: outcome.skipped,
        reason: outcome.reason,
    })
}

async fn agent_end(Json(_payload): Json<Value>) -> Json<Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn command_new(Json(_payload): Json<Value>) -> Json<Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn health(State(lifecycle): State<Arc<Lifecycle>>) -> Json<Value> {
    lifecycle.ensure_initialized().await;
    let stats = lifecycle.store().stats().await.ok();
    Json(serde_json::json!({
        "indexed_docs": stats.as_ref().map(|s| s.total_docs),
        "indexed_blocks": stats.as_ref().map(|s| s.total_blocks),
        "last_sync": stats.as_ref().and_then(|s| s.last_sync.clone()),
    }))
}

pub fn router(lifecycle: Arc<Lifecycle>) -> Router {
    Router::new()
        .route("/hooks/before-agent-start", post(before_agent_start))
        .route("/hooks/agent-end", post(agent_end))
        .route("/hooks/command/new", post(command_new))
        .route("/health", axum::routing::get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(lifecycle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_lifecycle() -> Arc<Lifecycle> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::default();
        config.index.db_path = dir.keep().join("index.db").to_str().unwrap().to_string();
        config.siyuan.api_url = "http://127.0.0.1:1".to_string();
        let path = None;
        let overrides = crate::config::PartialConfig {
            siyuan: Some(config.siyuan.clone()),
            index: Some(config.index.clone()),
            recall: Some(config.recall.clone()),
            linked_doc: Some(config.linked_doc.clone()),
        };
        Lifecycle::register(path, Some(overrides)).await.unwrap()
    }

    // These tests build a `Lifecycle` with a fixed `siyuan.api_url` override
    // and must not interleave with `config::tests::env_overrides_win`, which
    // mutates the `SIYUAN_API_URL` process environment variable that
    // `Config::load` applies on top of any override.
    #[tokio::test]
    #[serial_test::serial(siyuan_env)]
    async fn agent_end_acknowledges() {
        let app = router(test_lifecycle().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hooks/agent-end")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    #[serial_test::serial(siyuan_env)]
    async fn before_agent_start_returns_empty_context_for_short_prompt() {
        let app = router(test_lifecycle().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hooks/before-agent-start")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prompt":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["prependContext"], "");
        assert_eq!(json["skipped"], true);
        assert_eq!(json["reason"], "too_short");
    }

    #[tokio::test]
    #[serial_test::serial(siyuan_env)]
    async fn before_agent_start_skips_slash_command_with_intent_reason() {
        let app = router(test_lifecycle().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/hooks/before-agent-start")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"prompt":"/help please show commands"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["prependContext"], "");
        assert_eq!(json["skipped"], true);
        assert!(json["reason"].as_str().unwrap().starts_with("intent_"));
    }
}
