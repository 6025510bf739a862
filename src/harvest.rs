//! Page-session entrypoint.
//!
//! A [`Harvester`] is built from one [`HarvestConfig`] and bound to one page
//! at a time. `initialize` locates the configured stores and instruments
//! their sequences (once per page load). `paginate` runs the scroll / extract
//! / merge loop and returns the deduplicated record set.

use crate::core::config::HarvestConfig;
use crate::core::error::{HarvestResult, WatchError};
use crate::core::sandbox::{CaptureRequest, PageDriver};
use crate::core::types::PaginationOutcome;
use crate::extraction::record_extractor::{Extraction, RecordExtractor};
use crate::extraction::record_shape::Classifier;
use crate::extraction::store_locator::{LocatedStore, StoreLocator};
use crate::features::live_sequence::LiveSequence;
use crate::features::sequence_watcher::{
    AppendHandler, Disposer, SequenceTarget, SequenceWatcher, StrategyKind,
};
use crate::features::watch_registry::{Signature, WatchRegistry};
use crate::sync::channel_merger::ChannelMerger;
use crate::sync::network::{NetworkChannel, NetworkDecoder};
use crate::sync::paginator::{extraction_request, PaginationPolicy, Paginator};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Resolves a field path inside a located store to a watchable sequence.
#[async_trait]
pub trait SequenceSource: Send + Sync {
    async fn sequence_at(
        &self,
        store: &LocatedStore,
        path: &str,
    ) -> Option<Arc<dyn SequenceTarget>>;
}

/// In-process sequences registered by `(store, path)`.
#[derive(Default, Clone)]
pub struct LocalSequences {
    sequences: HashMap<(String, String), LiveSequence>,
}

impl LocalSequences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, store: &str, path: &str, sequence: LiveSequence) -> &mut Self {
        self.sequences
            .insert((store.to_string(), path.to_string()), sequence);
        self
    }
}

#[async_trait]
impl SequenceSource for LocalSequences {
    async fn sequence_at(
        &self,
        store: &LocatedStore,
        path: &str,
    ) -> Option<Arc<dyn SequenceTarget>> {
        let seq = self
            .sequences
            .get(&(store.name.clone(), path.to_string()))?
            .clone();
        Some(Arc::new(seq))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchFailure {
    pub store: String,
    pub path: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedEntry {
    pub store: String,
    pub path: String,
    pub signature: Signature,
    pub strategy: StrategyKind,
}

/// What one initialization call achieved.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitSummary {
    pub stores_found: Vec<String>,
    pub stores_missing: Vec<String>,
    pub sequences_instrumented: usize,
    /// Sequences skipped because an earlier call already instrumented them.
    pub already_instrumented: usize,
    pub watched: Vec<WatchedEntry>,
    pub failures: Vec<WatchFailure>,
    /// Native-subscription teardown handles, for the caller.
    #[serde(skip)]
    pub disposers: Vec<Disposer>,
}

impl InitSummary {
    fn fail(&mut self, store: &str, path: Option<&str>, error: WatchError) {
        warn!(
            "store `{}`{}: {}",
            store,
            path.map(|p| format!(" path `{p}`")).unwrap_or_default(),
            error
        );
        self.failures.push(WatchFailure {
            store: store.to_string(),
            path: path.map(str::to_string),
            error: error.to_string(),
        });
    }
}

/// Everything one CLI run produced.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestReport {
    pub url: String,
    pub init: InitSummary,
    pub outcome: PaginationOutcome,
}

pub struct Harvester {
    config: HarvestConfig,
    locator: StoreLocator,
    extractor: RecordExtractor,
    merger: ChannelMerger,
    decoder: NetworkDecoder,
    pagination: PaginationPolicy,
    watcher: SequenceWatcher,
    handlers: HashMap<String, Arc<dyn AppendHandler>>,
    /// Store locations per document generation (`timeOrigin` bits).
    located: Mutex<HashMap<(u64, String), LocatedStore>>,
}

impl Harvester {
    pub fn new(config: HarvestConfig) -> Self {
        Self::with_registry(config, Arc::new(WatchRegistry::new()))
    }

    /// Share a registry between harvesters bound to the same page.
    pub fn with_registry(config: HarvestConfig, registry: Arc<WatchRegistry>) -> Self {
        let keys = config.resolve_record_keys();
        let extractor =
            RecordExtractor::new(config.resolve_extractor(), Classifier::standard(keys.clone()));
        let decoder = NetworkDecoder::new(Classifier::standard(keys), config.resolve_list_keys());
        Self {
            locator: StoreLocator::new(config.resolve_locator()),
            extractor,
            merger: ChannelMerger::new(config.resolve_merge()),
            decoder,
            pagination: config.resolve_pagination(),
            watcher: SequenceWatcher::new(registry, config.resolve_watch_queue_capacity()),
            handlers: HashMap::new(),
            located: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn pagination_policy(&self) -> &PaginationPolicy {
        &self.pagination
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        self.watcher.registry()
    }

    /// Make `handler` available to sequences configured with `name`.
    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn AppendHandler>) -> &mut Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }

    /// Locate every configured store and instrument its sequences.
    ///
    /// Only a sandbox failure is returned as an error; missing stores, bad
    /// paths and install failures are reported in the summary.
    pub async fn initialize(
        &self,
        driver: &dyn PageDriver,
        source: &dyn SequenceSource,
    ) -> HarvestResult<InitSummary> {
        let mut summary = InitSummary::default();
        if self.config.stores.is_empty() {
            return Ok(summary);
        }

        let locator = self.locator.options();
        let request = CaptureRequest {
            anchors: self
                .config
                .stores
                .iter()
                .flat_map(|s| s.anchors.iter().cloned())
                .collect(),
            class_fragment: String::new(),
            max_candidates: 0,
            scan_cap: locator.scan_cap,
            max_depth: locator.max_depth,
            keys: self.config.stores.iter().map(|s| s.name.clone()).collect(),
            scope: None,
        };
        let snapshot = driver.capture(&request).await?;
        let generation = snapshot.time_origin.to_bits();

        for store_cfg in &self.config.stores {
            let located =
                self.locate_cached(generation, &snapshot, &store_cfg.name, &store_cfg.anchors);
            let Some(store) = located else {
                summary.stores_missing.push(store_cfg.name.clone());
                let missing = WatchError::StoreNotFound(store_cfg.name.clone());
                summary.fail(&store_cfg.name, None, missing);
                continue;
            };
            summary.stores_found.push(store.name.clone());

            for seq_cfg in &store_cfg.sequences {
                let Some(handler) = self.handlers.get(&seq_cfg.handler).cloned() else {
                    summary.fail(
                        &store.name,
                        Some(&seq_cfg.path),
                        WatchError::UnknownHandler(seq_cfg.handler.clone()),
                    );
                    continue;
                };
                let Some(target) = source.sequence_at(&store, &seq_cfg.path).await else {
                    summary.fail(
                        &store.name,
                        Some(&seq_cfg.path),
                        WatchError::SequenceNotArray(format!("{}.{}", store.name, seq_cfg.path)),
                    );
                    continue;
                };

                match self.watcher.watch(target, handler).await {
                    Ok(mut watched) => {
                        summary.sequences_instrumented += 1;
                        if let Some(disposer) = watched.take_disposer() {
                            summary.disposers.push(disposer);
                        }
                        summary.watched.push(WatchedEntry {
                            store: store.name.clone(),
                            path: seq_cfg.path.clone(),
                            signature: watched.signature.clone(),
                            strategy: watched.strategy,
                        });
                    }
                    Err(e) if e.is_benign() => {
                        debug!("{}.{}: {}", store.name, seq_cfg.path, e);
                        summary.already_instrumented += 1;
                    }
                    Err(e) => summary.fail(&store.name, Some(&seq_cfg.path), e),
                }
            }
        }

        info!(
            "initialized: {} stores found, {} missing, {} sequences instrumented, {} already instrumented, {} failures",
            summary.stores_found.len(),
            summary.stores_missing.len(),
            summary.sequences_instrumented,
            summary.already_instrumented,
            summary.failures.len()
        );
        Ok(summary)
    }

    fn locate_cached(
        &self,
        generation: u64,
        snapshot: &crate::extraction::snapshot::PageSnapshot,
        name: &str,
        anchors: &[String],
    ) -> Option<LocatedStore> {
        let key = (generation, name.to_string());
        if let Some(hit) = self.located.lock().ok().and_then(|m| m.get(&key).cloned()) {
            return Some(hit);
        }
        let found = self.locator.locate(snapshot, name, anchors)?;
        if let Ok(mut cache) = self.located.lock() {
            cache.retain(|(g, _), _| *g == generation);
            cache.insert(key, found.clone());
        }
        Some(found)
    }

    /// One RecordExtractor pass over the currently rendered window.
    pub async fn extract_once(&self, driver: &dyn PageDriver) -> HarvestResult<Extraction> {
        let request = extraction_request(&self.pagination.container, &self.extractor);
        let snapshot = driver.capture(&request).await?;
        Ok(self.extractor.extract_within(
            &snapshot,
            &self.pagination.container,
            chrono::Utc::now().timestamp_millis(),
        ))
    }

    pub async fn paginate(
        &self,
        driver: &dyn PageDriver,
        network: &dyn NetworkChannel,
    ) -> HarvestResult<PaginationOutcome> {
        Paginator::new(&self.pagination, &self.extractor, &self.merger, &self.decoder)
            .run(driver, network)
            .await
    }
}
