use super::snapshot::{DocumentView, StateSlot};
use super::tree_walker::{find_key, WalkHit, DEFAULT_MAX_DEPTH};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct LocatorOptions {
    /// Walk depth for anchor and root strategies.
    pub max_depth: usize,
    /// Reduced walk depth used per element by the full-page scan.
    pub scan_depth: usize,
    /// Maximum number of elements the full-page scan visits.
    pub scan_cap: usize,
    pub debug: bool,
}

impl Default for LocatorOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            scan_depth: 8,
            scan_cap: 500,
            debug: false,
        }
    }
}

/// Which strategy found the store; replayable in the live page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StoreStart {
    Anchor { selector: String },
    Root,
    /// Position within the capped scan window.
    Scan { position: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocatedStore {
    pub name: String,
    pub start: StoreStart,
    pub hops: usize,
    pub slot: StateSlot,
    /// Structured clone of the store as captured.
    pub value: Value,
}

/// Finds a named store object inside the render tree.
///
/// Strategies run in a fixed order and each at most once per call: anchor
/// selectors, the application root, then a capped linear scan with a shallow
/// walk. A miss is `None`; callers retry later (e.g. after a re-render).
#[derive(Debug, Clone, Default)]
pub struct StoreLocator {
    options: LocatorOptions,
}

impl StoreLocator {
    pub fn new(options: LocatorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LocatorOptions {
        &self.options
    }

    pub fn locate<D: DocumentView>(
        &self,
        doc: &D,
        name: &str,
        anchors: &[String],
    ) -> Option<LocatedStore> {
        let opts = &self.options;

        for selector in anchors {
            let Some(element) = doc.resolve_anchor(selector) else {
                self.trace(format_args!("store `{name}`: anchor `{selector}` did not resolve"));
                continue;
            };
            let Some(node) = doc.render_node(element) else {
                self.trace(format_args!(
                    "store `{name}`: anchor `{selector}` has no render node"
                ));
                continue;
            };
            if let Some(hit) = find_key(doc, node, name, opts.max_depth) {
                return Some(self.found(
                    name,
                    StoreStart::Anchor {
                        selector: selector.clone(),
                    },
                    hit,
                ));
            }
        }

        if let Some(root) = doc.app_root() {
            if let Some(hit) = find_key(doc, root, name, opts.max_depth) {
                return Some(self.found(name, StoreStart::Root, hit));
            }
            self.trace(format_args!("store `{name}`: not reachable from app root"));
        }

        for (position, element) in doc
            .scan_elements()
            .into_iter()
            .take(opts.scan_cap)
            .enumerate()
        {
            let Some(node) = doc.render_node(element) else {
                continue;
            };
            if let Some(hit) = find_key(doc, node, name, opts.scan_depth) {
                return Some(self.found(name, StoreStart::Scan { position }, hit));
            }
        }

        self.trace(format_args!("store `{name}`: all strategies exhausted"));
        None
    }

    fn found<N>(&self, name: &str, start: StoreStart, hit: WalkHit<'_, N>) -> LocatedStore {
        if self.options.debug {
            info!(
                "store `{}` located via {:?} ({} hops, slot {})",
                name,
                start,
                hit.hops,
                hit.slot.js_path()
            );
        }
        LocatedStore {
            name: name.to_string(),
            start,
            hops: hit.hops,
            slot: hit.slot,
            value: hit.value.clone(),
        }
    }

    fn trace(&self, msg: std::fmt::Arguments<'_>) {
        if self.options.debug {
            info!("{}", msg);
        } else {
            debug!("{}", msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::snapshot::PageSnapshot;
    use serde_json::json;

    #[test]
    fn test_anchor_strategy_wins_first() {
        let mut b = PageSnapshot::builder();
        let root = b.node(None);
        b.slot(root, StateSlot::Props, json!({"chatStore": {"via": "root"}}));
        let holder = b.node(Some(root));
        b.slot(holder, StateSlot::InstanceProps, json!({"chatStore": {"via": "anchor"}}));
        let leaf = b.node(Some(holder));
        let el = b.element(Some("chat-pane"), Some(leaf));
        b.anchor("#chat", Some(el)).root(root);
        let snapshot = b.build();

        let found = StoreLocator::default()
            .locate(&snapshot, "chatStore", &["#chat".to_string()])
            .unwrap();
        assert_eq!(
            found.start,
            StoreStart::Anchor {
                selector: "#chat".into()
            }
        );
        assert_eq!(found.hops, 1);
        assert_eq!(found.slot, StateSlot::InstanceProps);
        assert_eq!(found.value["via"], "anchor");
    }

    #[test]
    fn test_missing_store_returns_none() {
        let mut b = PageSnapshot::builder();
        let root = b.node(None);
        b.element(Some("x"), Some(root));
        b.root(root);
        let snapshot = b.build();
        assert!(StoreLocator::default()
            .locate(&snapshot, "nope", &[])
            .is_none());
    }

    #[test]
    fn test_scan_respects_cap_and_shallow_depth() {
        let mut b = PageSnapshot::builder();
        let holder = b.node(None);
        b.slot(holder, StateSlot::State, json!({"inbox": []}));
        for _ in 0..4 {
            b.element(None, None);
        }
        let deep = b.chain(Some(holder), 10).unwrap();
        b.element(Some("deep"), Some(deep));
        let near = b.node(Some(holder));
        b.element(Some("near"), Some(near));
        let snapshot = b.build();

        let capped = StoreLocator::new(LocatorOptions {
            scan_cap: 5,
            ..Default::default()
        });
        assert!(capped.locate(&snapshot, "inbox", &[]).is_none());

        let found = StoreLocator::default()
            .locate(&snapshot, "inbox", &[])
            .unwrap();
        // The deep element (position 4) is beyond the shallow scan depth.
        assert_eq!(found.start, StoreStart::Scan { position: 5 });
        assert_eq!(found.hops, 1);
    }
}
