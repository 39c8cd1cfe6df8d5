//! Typed wrapper over the remote note-store HTTP API (spec §4.A / §6). All
//! calls POST JSON with a bearer token; every response uses the envelope
//! `{code, msg, data}` — a non-zero `code` fails with `RecallError::Remote`.
//!
//! The one genuinely tricky bit is `appendBlock`/`createDocWithMd`: the
//! store's `data` field shows up as an object, an array of objects, an
//! `{ids:[...]}` bag, or a bare id string depending on version. Rather than
//! special-casing each call site, `WriteResult` models the sum type once
//! and `WriteResult::into_id` normalizes all four into `{id}` (spec §4.A
//! "Contract notes", §9 "Dynamic response shapes").

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RecallError, Result};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub available: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notebook {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockInfo {
    pub hpath: Option<String>,
    pub updated: Option<String>,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockKramdown {
    pub id: String,
    pub kramdown: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SearchFullTextData {
    #[serde(default)]
    blocks: Vec<Value>,
}

/// The four shapes `appendBlock`/`createDocWithMd` are known to return.
/// Anything else fails with `RecallError::Protocol` at normalization time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WriteResult {
    Object { id: String },
    Array(Vec<WriteResultObject>),
    IdsBag { ids: Vec<String> },
    Bare(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteResultObject {
    pub id: String,
}

impl WriteResult {
    pub fn into_id(self) -> Result<String> {
        match self {
            WriteResult::Object { id } => Ok(id),
            WriteResult::Array(items) => items
                .into_iter()
                .next()
                .map(|o| o.id)
                .ok_or_else(|| RecallError::Protocol("empty write result array".into())),
            WriteResult::IdsBag { ids } => ids
                .into_iter()
                .next()
                .ok_or_else(|| RecallError::Protocol("empty ids bag".into())),
            WriteResult::Bare(id) => Ok(id),
        }
    }
}

#[derive(Clone)]
pub struct NoteStoreClient {
    http: Client,
    base_url: String,
    api_token: String,
}

impl NoteStoreClient {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client build must succeed with a plain timeout config");
        Self {
            http,
            base_url: base_url.into(),
            api_token: api_token.into(),
        }
    }

    async fn post_envelope<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: Value,
    ) -> Result<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let envelope: Envelope<T> = resp.json().await?;
        if envelope.code != 0 {
            return Err(RecallError::Remote {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        envelope
            .data
            .ok_or_else(|| RecallError::Protocol("missing data in envelope".into()))
    }

    /// Never throws: timeouts and connection errors become
    /// `available=false` with `error` set (spec §4.A).
    pub async fn health_check(&self) -> HealthStatus {
        #[derive(Deserialize)]
        struct VersionData {
            version: String,
        }
        match self
            .post_envelope::<VersionData>("/api/system/version", Value::Object(Default::default()))
            .await
        {
            Ok(v) => HealthStatus {
                available: true,
                version: Some(v.version),
                error: None,
            },
            Err(e) => HealthStatus {
                available: false,
                version: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Forwards a read-only SQL statement; returns the raw row array.
    pub async fn sql(&self, stmt: &str) -> Result<Vec<Value>> {
        self.post_envelope("/api/query/sql", serde_json::json!({ "stmt": stmt }))
            .await
    }

    pub async fn search_full_text(
        &self,
        query: &str,
        page: u32,
        size: u32,
        sort: Option<&str>,
    ) -> Result<Vec<Value>> {
        let mut body = serde_json::json!({ "query": query, "page": page, "size": size });
        if let Some(sort) = sort {
            body["sort"] = Value::String(sort.to_string());
        }
        let data: SearchFullTextData = self
            .post_envelope("/api/search/fullTextSearchBlock", body)
            .await?;
        Ok(data.blocks)
    }

    pub async fn get_block_info(&self, id: &str) -> Result<BlockInfo> {
        self.post_envelope("/api/block/getBlockInfo", serde_json::json!({ "id": id }))
            .await
    }

    pub async fn get_block_kramdown(&self, id: &str) -> Result<BlockKramdown> {
        self.post_envelope(
            "/api/block/getBlockKramdown",
            serde_json::json!({ "id": id }),
        )
        .await
    }

    pub async fn list_notebooks(&self) -> Result<Vec<Notebook>> {
        #[derive(Deserialize)]
        struct NotebooksData {
            notebooks: Vec<Notebook>,
        }
        let data: NotebooksData = self
            .post_envelope("/api/notebook/lsNotebooks", Value::Object(Default::default()))
            .await?;
        Ok(data.notebooks)
    }

    // --- Write-side (used only by the out-of-scope writer; specified here
    // only for completeness per spec §4.A). ---

    pub async fn append_block(&self, parent_id: &str, markdown: &str) -> Result<String> {
        let data: WriteResult = self
            .post_envelope(
                "/api/block/appendBlock",
                serde_json::json!({ "parentID": parent_id, "data": markdown, "dataType": "markdown" }),
            )
            .await?;
        data.into_id()
    }

    pub async fn update_block(&self, id: &str, markdown: &str) -> Result<String> {
        let data: WriteResult = self
            .post_envelope(
                "/api/block/updateBlock",
                serde_json::json!({ "id": id, "data": markdown, "dataType": "markdown" }),
            )
            .await?;
        data.into_id()
    }

    pub async fn create_doc_with_markdown(&self, notebook_id: &str, path: &str, markdown: &str) -> Result<String> {
        let data: WriteResult = self
            .post_envelope(
                "/api/filetree/createDocWithMd",
                serde_json::json!({ "notebook": notebook_id, "path": path, "markdown": markdown }),
            )
            .await?;
        data.into_id()
    }

    pub async fn set_block_attrs(&self, id: &str, attrs: Value) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/api/attr/setBlockAttrs", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "id": id, "attrs": attrs }))
            .send()
            .await?;
        let envelope: Envelope<Value> = resp.json().await?;
        if envelope.code != 0 {
            return Err(RecallError::Remote {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        Ok(())
    }

    pub async fn get_doc_by_path(&self, notebook_id: &str, path: &str) -> Result<Value> {
        self.post_envelope(
            "/api/filetree/getDocByPath",
            serde_json::json!({ "notebook": notebook_id, "path": path }),
        )
        .await
    }
}
