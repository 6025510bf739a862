use crate::core::error::{HarvestError, HarvestResult};
use crate::core::sandbox::ScrollEdge;
use crate::extraction::record_extractor::ExtractorOptions;
use crate::extraction::record_shape::RecordKeys;
use crate::extraction::store_locator::LocatorOptions;
use crate::sync::channel_merger::{ContentPriority, MergePolicy};
use crate::sync::network::NetworkDecoder;
use crate::sync::paginator::PaginationPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// HarvestConfig: file-based config loader (harvest.json) with env-var fallback
// ---------------------------------------------------------------------------

pub const CONFIG_FILE_NAME: &str = "harvest.json";

pub const ENV_CONFIG_PATH: &str = "THREAD_HARVEST_CONFIG";
pub const ENV_SETTLE_MS: &str = "THREAD_HARVEST_SETTLE_MS";
pub const ENV_ATTEMPT_BUDGET: &str = "THREAD_HARVEST_ATTEMPT_BUDGET";
pub const ENV_NO_GROWTH_STREAK: &str = "THREAD_HARVEST_NO_GROWTH_STREAK";
pub const ENV_MAX_DEPTH: &str = "THREAD_HARVEST_MAX_DEPTH";
pub const ENV_DEBUG: &str = "THREAD_HARVEST_DEBUG";
pub const ENV_CHROME_EXECUTABLE: &str = "CHROME_EXECUTABLE";

/// One sequence to watch inside a store.
#[derive(serde::Deserialize, serde::Serialize, Default, Clone, Debug, PartialEq)]
pub struct SequenceConfig {
    /// Dot-separated field path from the store object, e.g. `messages.items`.
    pub path: String,
    /// Name of a handler registered on the `Harvester`.
    pub handler: String,
}

#[derive(serde::Deserialize, serde::Serialize, Default, Clone, Debug, PartialEq)]
pub struct StoreConfig {
    pub name: String,
    /// Candidate anchor selectors, tried in order.
    #[serde(default)]
    pub anchors: Vec<String>,
    #[serde(default)]
    pub sequences: Vec<SequenceConfig>,
}

/// Field-name overrides. A present list replaces the built-in one.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct RecordKeysConfig {
    pub id: Option<Vec<String>>,
    pub content: Option<Vec<String>>,
    pub participant: Option<Vec<String>>,
    pub author_name: Option<Vec<String>>,
    pub parent: Option<Vec<String>>,
    pub timestamp: Option<Vec<String>>,
    pub direction: Option<Vec<String>>,
    pub outbound_flags: Option<Vec<String>>,
    pub inbound_flags: Option<Vec<String>>,
    pub containers: Option<Vec<String>>,
    pub conversation_markers: Option<Vec<String>>,
}

impl RecordKeysConfig {
    pub fn resolve(&self) -> RecordKeys {
        let mut keys = RecordKeys::default();
        let pairs: [(&Option<Vec<String>>, &mut Vec<String>); 11] = [
            (&self.id, &mut keys.id),
            (&self.content, &mut keys.content),
            (&self.participant, &mut keys.participant),
            (&self.author_name, &mut keys.author_name),
            (&self.parent, &mut keys.parent),
            (&self.timestamp, &mut keys.timestamp),
            (&self.direction, &mut keys.direction),
            (&self.outbound_flags, &mut keys.outbound_flags),
            (&self.inbound_flags, &mut keys.inbound_flags),
            (&self.containers, &mut keys.containers),
            (&self.conversation_markers, &mut keys.conversation_markers),
        ];
        for (over, slot) in pairs {
            if let Some(list) = over.as_ref().filter(|l| !l.is_empty()) {
                *slot = list.clone();
            }
        }
        keys
    }
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ExtractionConfig {
    /// Virtualized scroll container selector.
    pub container_selector: Option<String>,
    /// Class-name fragment for candidate item nodes. Default: `message`.
    pub class_fragment: Option<String>,
    pub max_content_chars: Option<usize>,
    pub max_nodes: Option<usize>,
    /// Upward walk depth per candidate. Default: 20.
    pub max_depth: Option<usize>,
    /// Author id of the logged-in account; records from it count as outbound.
    pub self_author_id: Option<String>,
    #[serde(default)]
    pub keys: RecordKeysConfig,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct PaginationConfig {
    pub edge: Option<ScrollEdge>,
    pub settle_ms: Option<u64>,
    pub settle_jitter_ms: Option<u64>,
    pub attempt_budget: Option<u32>,
    pub no_growth_streak: Option<u32>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct NetworkConfig {
    /// Regex matched against response URLs of the record-listing endpoint.
    pub endpoint_pattern: Option<String>,
    pub buffer_capacity: Option<usize>,
    pub list_keys: Option<Vec<String>>,
    /// Capacity of each watched sequence's delivery queue. Default: 1024.
    pub watch_queue_capacity: Option<usize>,
}

#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct MergeConfig {
    pub content_priority: Option<ContentPriority>,
    pub timestamp_tolerance_ms: Option<i64>,
}

/// Top-level config loaded from `harvest.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct HarvestConfig {
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub pagination: PaginationConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    /// Store-locator walk depth. Default: 30.
    pub max_depth: Option<usize>,
    pub debug: Option<bool>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    let v = std::env::var(name).ok()?;
    let v = v.trim().to_ascii_lowercase();
    if v.is_empty() {
        return None;
    }
    Some(matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}

fn non_blank(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl HarvestConfig {
    pub fn from_json(contents: &str) -> HarvestResult<Self> {
        serde_json::from_str(contents).map_err(|e| HarvestError::Config(e.to_string()))
    }

    /// Debug logging: JSON `debug` → `THREAD_HARVEST_DEBUG` → `false`.
    pub fn resolve_debug(&self) -> bool {
        self.debug.or_else(|| env_flag(ENV_DEBUG)).unwrap_or(false)
    }

    /// Locator walk depth: JSON `max_depth` → `THREAD_HARVEST_MAX_DEPTH` → 30.
    pub fn resolve_max_depth(&self) -> usize {
        self.max_depth
            .or_else(|| env_parse(ENV_MAX_DEPTH))
            .unwrap_or(crate::extraction::tree_walker::DEFAULT_MAX_DEPTH)
    }

    pub fn resolve_locator(&self) -> LocatorOptions {
        LocatorOptions {
            max_depth: self.resolve_max_depth(),
            debug: self.resolve_debug(),
            ..Default::default()
        }
    }

    pub fn resolve_record_keys(&self) -> RecordKeys {
        self.extraction.keys.resolve()
    }

    pub fn resolve_extractor(&self) -> ExtractorOptions {
        let defaults = ExtractorOptions::default();
        ExtractorOptions {
            class_fragment: non_blank(&self.extraction.class_fragment)
                .unwrap_or(defaults.class_fragment),
            max_nodes: self.extraction.max_nodes.unwrap_or(defaults.max_nodes),
            max_depth: self.extraction.max_depth.unwrap_or(defaults.max_depth),
            max_content_chars: self
                .extraction
                .max_content_chars
                .unwrap_or(defaults.max_content_chars),
            self_author_id: non_blank(&self.extraction.self_author_id),
        }
    }

    /// Settle delay: JSON `pagination.settle_ms` → `THREAD_HARVEST_SETTLE_MS` → 2000.
    pub fn resolve_settle(&self) -> Duration {
        let ms = self
            .pagination
            .settle_ms
            .or_else(|| env_parse(ENV_SETTLE_MS))
            .unwrap_or(2000);
        Duration::from_millis(ms)
    }

    /// Attempt budget: JSON → `THREAD_HARVEST_ATTEMPT_BUDGET` → 5.
    pub fn resolve_attempt_budget(&self) -> u32 {
        self.pagination
            .attempt_budget
            .or_else(|| env_parse(ENV_ATTEMPT_BUDGET))
            .unwrap_or(5)
    }

    /// No-growth streak: JSON → `THREAD_HARVEST_NO_GROWTH_STREAK` → 2.
    pub fn resolve_no_growth_streak(&self) -> u32 {
        self.pagination
            .no_growth_streak
            .or_else(|| env_parse(ENV_NO_GROWTH_STREAK))
            .unwrap_or(2)
    }

    pub fn resolve_pagination(&self) -> PaginationPolicy {
        let defaults = PaginationPolicy::default();
        PaginationPolicy {
            container: non_blank(&self.extraction.container_selector)
                .unwrap_or(defaults.container),
            edge: self.pagination.edge.unwrap_or(defaults.edge),
            settle: self.resolve_settle(),
            settle_jitter: Duration::from_millis(self.pagination.settle_jitter_ms.unwrap_or(0)),
            attempt_budget: self.resolve_attempt_budget(),
            no_growth_streak: self.resolve_no_growth_streak(),
        }
    }

    pub fn resolve_merge(&self) -> MergePolicy {
        let defaults = MergePolicy::default();
        MergePolicy {
            content: self.merge.content_priority.unwrap_or(defaults.content),
            timestamp_tolerance_ms: self
                .merge
                .timestamp_tolerance_ms
                .unwrap_or(defaults.timestamp_tolerance_ms),
            max_content_chars: self.resolve_extractor().max_content_chars,
        }
    }

    /// Endpoint regex for the network tap. `None` disables interception.
    pub fn resolve_endpoint_pattern(&self) -> Option<String> {
        non_blank(&self.network.endpoint_pattern)
    }

    pub fn resolve_network_buffer_capacity(&self) -> usize {
        self.network.buffer_capacity.unwrap_or(256)
    }

    pub fn resolve_list_keys(&self) -> Vec<String> {
        self.network
            .list_keys
            .clone()
            .filter(|k| !k.is_empty())
            .unwrap_or_else(NetworkDecoder::default_list_keys)
    }

    pub fn resolve_watch_queue_capacity(&self) -> usize {
        self.network.watch_queue_capacity.unwrap_or(1024).max(1)
    }
}

fn candidate_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(p) = explicit {
        return vec![p.to_path_buf()];
    }
    let mut v = vec![
        PathBuf::from(CONFIG_FILE_NAME),
        PathBuf::from("..").join(CONFIG_FILE_NAME),
    ];
    if let Some(home) = dirs::home_dir() {
        v.push(home.join(".thread-harvest").join(CONFIG_FILE_NAME));
    }
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        if !env_path.trim().is_empty() {
            v.insert(0, PathBuf::from(env_path));
        }
    }
    v
}

/// Load `harvest.json`.
///
/// With an explicit path only that file is read. Otherwise the search order is
/// `$THREAD_HARVEST_CONFIG`, `./harvest.json`, `../harvest.json`,
/// `~/.thread-harvest/harvest.json`; first found wins.
///
/// Missing file → `HarvestConfig::default()` (env-var fallbacks apply).
/// Parse error → warning, `HarvestConfig::default()`.
pub fn load_harvest_config(explicit: Option<&Path>) -> HarvestConfig {
    for path in &candidate_paths(explicit) {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        return match HarvestConfig::from_json(&contents) {
            Ok(cfg) => {
                tracing::info!("harvest.json loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    "harvest.json parse error at {}: {}; using defaults",
                    path.display(),
                    e
                );
                HarvestConfig::default()
            }
        };
    }
    if let Some(p) = explicit {
        tracing::warn!("config file {} not found; using defaults", p.display());
    }
    HarvestConfig::default()
}

/// Optional override for the Chromium-family browser executable.
///
/// Only returns a value when `CHROME_EXECUTABLE` is set to an existing path;
/// otherwise `scraping::browser_manager::find_chrome_executable()` auto-discovers.
pub fn chrome_executable_override() -> Option<String> {
    let p = std::env::var(ENV_CHROME_EXECUTABLE).ok()?;
    let p = p.trim();
    if p.is_empty() {
        return None;
    }
    if Path::new(p).exists() {
        Some(p.to_string())
    } else {
        None
    }
}
