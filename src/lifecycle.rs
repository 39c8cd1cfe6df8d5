//! Lifecycle & Health Coordinator (spec §4.H): the single entry point the
//! HTTP hooks call into. Owns config load, component construction, the
//! background initial-sync + periodic-sync startup sequence, and the
//! cached note-store availability flag that lets recall degrade to
//! local-index-only search instead of failing outright.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::client::NoteStoreClient;
use crate::config::{Config, PartialConfig, SearchPath};
use crate::error::Result;
use crate::format;
use crate::intent;
use crate::jobs::{PeriodicJob, ReentrancyGuard};
use crate::linked_doc;
use crate::model::{AggregatedDoc, KeywordCoverage};
use crate::retrieval::RetrievalEngine;
use crate::store::IndexStore;
use crate::sync::IndexSyncService;

struct SyncJob {
    client: NoteStoreClient,
    store: Arc<IndexStore>,
    sync_service: Arc<IndexSyncService>,
    available: Arc<AtomicBool>,
    interval: Duration,
    cleanup_age_days: i64,
}

#[async_trait]
impl PeriodicJob for SyncJob {
    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_job(&self) {
        let health = self.client.health_check().await;
        self.available.store(health.available, Ordering::SeqCst);
        if !health.available {
            tracing::warn!("note store unavailable, skipping incremental sync tick");
            return;
        }
        match self.sync_service.incremental_sync(&self.store).await {
            Ok(n) => tracing::debug!(documents = n, "incremental sync complete"),
            Err(e) => tracing::warn!(error = %e, "incremental sync failed"),
        }

        // Hard cleanup of soft-deleted docs runs alongside the periodic sync
        // tick (spec §3 Lifecycles: "hard cleanup removes registry + FTS rows
        // atomically after cleanupAgeDays").
        match self.store.cleanup_old_deleted(self.cleanup_age_days).await {
            Ok(n) if n > 0 => tracing::debug!(removed = n, "cleaned up old soft-deleted docs"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cleanup of old soft-deleted docs failed"),
        }
    }
}

fn linked_blocks_to_docs(blocks: Vec<crate::model::Block>) -> Vec<AggregatedDoc> {
    blocks
        .into_iter()
        .map(|block| AggregatedDoc {
            doc_id: block.root_id.clone(),
            hpath: block.hpath.clone(),
            updated_at: block.updated_at.clone(),
            score: 1.0,
            coverage: KeywordCoverage::default(),
            blocks: vec![block],
        })
        .collect()
}

pub struct Lifecycle {
    config: Config,
    client: NoteStoreClient,
    store: Arc<IndexStore>,
    sync_service: Arc<IndexSyncService>,
    available: Arc<AtomicBool>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Lifecycle {
    /// Loads config, constructs every component synchronously, then hands
    /// back the handle while initial sync and the periodic timer continue
    /// in a background task (spec §4.H `register`).
    pub async fn register(file_path: Option<&Path>, gateway_overrides: Option<PartialConfig>) -> Result<Arc<Self>> {
        let config = Config::load(file_path, gateway_overrides)?;
        let client = NoteStoreClient::new(
            config.siyuan.api_url.clone(),
            config.siyuan.api_token.clone(),
            config.request_timeout(),
        );

        let mut excluded: Vec<String> = config.index.skip_notebook_names.clone();
        if let Some(privacy) = &config.index.privacy_notebook {
            excluded.push(privacy.clone());
        }
        let store = Arc::new(IndexStore::open(&config.index.db_path, excluded).await?);
        let sync_service = Arc::new(IndexSyncService::new(client.clone(), config.index.clone()));

        let (ready_tx, ready_rx) = watch::channel(false);

        let handle = Arc::new(Self {
            config,
            client,
            store,
            sync_service,
            available: Arc::new(AtomicBool::new(false)),
            ready_tx,
            ready_rx,
        });

        let bg = handle.clone();
        tokio::spawn(async move {
            bg.background_init().await;
        });

        Ok(handle)
    }

    async fn background_init(self: &Arc<Self>) {
        let health = self.client.health_check().await;
        self.available.store(health.available, Ordering::SeqCst);

        if health.available && self.config.index.enabled {
            let needs_initial = self
                .store
                .get_last_sync_time()
                .await
                .ok()
                .flatten()
                .is_none();
            if needs_initial {
                if let Err(e) = self.sync_service.initial_sync(&self.store).await {
                    tracing::warn!(error = %e, "initial sync failed, continuing with local-index-only recall");
                }
            }

            let job = Arc::new(ReentrancyGuard::new(SyncJob {
                client: self.client.clone(),
                store: self.store.clone(),
                sync_service: self.sync_service.clone(),
                available: self.available.clone(),
                interval: self.config.sync_interval(),
                cleanup_age_days: self.config.index.cleanup_age_days,
            }));
            crate::jobs::spawn_periodic_job(job);
        } else if !health.available {
            tracing::warn!("note store unreachable at startup, recall will serve from the local index only");
        }

        let _ = self.ready_tx.send(true);
    }

    /// Awaits the background init sequence without ever erroring — callers
    /// in the request path should fall through to best-effort recall even
    /// if initial sync never completed (spec §4.H "never crashes the
    /// handler").
    pub async fn ensure_initialized(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// One reconnect attempt when the cached flag says unavailable, so a
    /// note store that recovered between timer ticks is noticed promptly
    /// (spec §4.H health/reconnect policy) without probing on every call.
    async fn refresh_availability(&self) -> bool {
        if self.available.load(Ordering::SeqCst) {
            return true;
        }
        let health = self.client.health_check().await;
        self.available.store(health.available, Ordering::SeqCst);
        health.available
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs a full initial sync unconditionally, ignoring `lastSyncTime`
    /// (used by the `sync --force-initial` CLI subcommand).
    pub async fn force_initial_sync(&self) -> Result<usize> {
        self.sync_service.initial_sync(&self.store).await
    }

    /// Runs one incremental sync pass on demand (used by the `sync` CLI
    /// subcommand, outside the periodic timer).
    pub async fn run_incremental_sync(&self) -> Result<usize> {
        self.sync_service.incremental_sync(&self.store).await
    }

    /// End-to-end recall for one prompt: gate, analyze intent, retrieve,
    /// resolve linked docs, format. Degrades to the local FTS path only
    /// when the note store is marked unavailable.
    pub async fn recall(&self, prompt: &str) -> Result<RecallOutcome> {
        self.ensure_initialized().await;

        // The explicit-skip phrase always wins, even over the linked-doc
        // bypass below (spec §4.F "Bypass" is conditioned on it).
        if intent::is_explicit_skip(prompt, &self.config.recall) {
            return Ok(RecallOutcome::skipped("explicit_skip"));
        }

        let linked_cfg = self.config.linked_doc();
        let linked_ids = linked_doc::extract_linked_ids(prompt, &linked_cfg);
        let has_linked = !linked_ids.is_empty();

        // Linked-doc resolution runs independent of §4.D gating and even
        // when recall is globally disabled: in that mode no search paths
        // run and only linked docs are emitted (spec §4.F "Bypass").
        if !self.config.recall.enabled {
            if has_linked && linked_cfg.enabled {
                let linked_blocks = linked_doc::resolve(&self.client, &linked_ids).await;
                let docs = linked_blocks_to_docs(linked_blocks);
                let context = format::format_context(&docs, &self.config.recall);
                return Ok(RecallOutcome::recalled(context));
            }
            return Ok(RecallOutcome::skipped("recall_disabled"));
        }

        let (decision, narrowed) = intent::gate(prompt, &self.config.recall, has_linked);
        tracing::debug!(should_recall = decision.should, reason = %decision.reason, "intent gate decision");
        if !decision.should {
            return Ok(RecallOutcome::skipped(decision.reason));
        }

        // The remote client is only needed when a configured search path
        // actually calls it (fulltext/sql) or when there are linked docs to
        // resolve; a local-FTS-only call with no linked docs never touches
        // the note store, so skip the reconnect probe entirely (spec §2:
        // "The recall path requires A only when F has work or when B is
        // disabled/unavailable").
        let needs_remote = (has_linked && linked_cfg.enabled)
            || self
                .config
                .recall
                .search_paths
                .iter()
                .any(|p| !matches!(p, SearchPath::Fts));
        let available = if needs_remote { self.refresh_availability().await } else { true };
        let mut effective_config = self.config.recall.clone();
        if !available {
            effective_config.search_paths = vec![SearchPath::Fts];
        }

        let intent = intent::analyze(narrowed, &effective_config);
        let engine = RetrievalEngine::new(&self.client, &self.store, &effective_config);
        let mut docs = engine.search(&intent, narrowed).await;

        if has_linked && linked_cfg.enabled {
            let existing_ids: HashSet<String> = docs.iter().map(|d| d.doc_id.clone()).collect();
            let linked_blocks = linked_doc::resolve(&self.client, &linked_ids).await;
            let mut linked_docs = linked_blocks_to_docs(linked_doc::merge_unique(linked_blocks, &existing_ids));
            // Linked docs are prepended ahead of retrieval results (spec §4.F "Merging").
            linked_docs.append(&mut docs);
            docs = linked_docs;
        }

        // No useful results is equivalent to recall-disabled: no context is
        // injected rather than a "No results found" body (spec §7
        // "User-visible behavior").
        if docs.is_empty() {
            return Ok(RecallOutcome::skipped("no_results"));
        }

        let context = format::format_context(&docs, &effective_config);
        Ok(RecallOutcome::recalled(context))
    }
}

/// The result of one `recall` call: `prependContext`/`skipped`/`reason` in
/// spec §8 vocabulary (informational hook-response names, normative
/// semantics). `skipped` mirrors `!GateDecision.should` when the gate ran at
/// all; `reason` carries the gate's reason string, or a coordinator-level
/// reason ("explicit_skip", "recall_disabled") when the gate never ran.
#[derive(Clone, Debug, Default)]
pub struct RecallOutcome {
    pub context: String,
    pub skipped: bool,
    pub reason: String,
}

impl RecallOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self { context: String::new(), skipped: true, reason: reason.into() }
    }

    fn recalled(context: String) -> Self {
        Self { context, skipped: false, reason: "recalled".to_string() }
    }
}
