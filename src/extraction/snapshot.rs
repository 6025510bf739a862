//! Structured clone of the parts of a live page the extractor needs.
//!
//! The in-page capture script (see `scraping::scripts`) walks the DOM and the
//! framework's private render tree and returns one JSON document. Everything
//! downstream (tree walking, store location, record extraction) runs in Rust
//! against this arena through the [`RenderTree`] and [`DocumentView`] traits,
//! so the same code serves a live CDP page and a hand-built test fixture.

use crate::core::error::HarvestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub u32);

/// Candidate state slots on a render-tree node, in inspection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateSlot {
    #[serde(rename = "memoizedProps")]
    Props,
    #[serde(rename = "memoizedState")]
    State,
    #[serde(rename = "stateNode.props")]
    InstanceProps,
    #[serde(rename = "stateNode.state")]
    InstanceState,
}

impl StateSlot {
    pub const ORDERED: [StateSlot; 4] = [
        StateSlot::Props,
        StateSlot::State,
        StateSlot::InstanceProps,
        StateSlot::InstanceState,
    ];

    /// Property path of the slot on the in-page node object.
    pub fn js_path(&self) -> &'static str {
        match self {
            StateSlot::Props => "memoizedProps",
            StateSlot::State => "memoizedState",
            StateSlot::InstanceProps => "stateNode.props",
            StateSlot::InstanceState => "stateNode.state",
        }
    }
}

/// Labeled tree with parent links and per-node state slots.
pub trait RenderTree {
    type Node: Copy + Eq + std::hash::Hash + std::fmt::Debug;

    fn parent(&self, node: Self::Node) -> Option<Self::Node>;
    fn slot(&self, node: Self::Node, slot: StateSlot) -> Option<&Value>;
}

/// Document-level view over a render tree: anchors, root, element scan.
pub trait DocumentView: RenderTree {
    type Element: Copy + Eq + std::fmt::Debug;

    /// Element an anchor selector resolved to, if it resolved at all.
    fn resolve_anchor(&self, selector: &str) -> Option<Self::Element>;
    fn app_root(&self) -> Option<Self::Node>;
    fn render_node(&self, element: Self::Element) -> Option<Self::Node>;
    fn class_name(&self, element: Self::Element) -> Option<&str>;
    /// Elements eligible for the full-page fallback scan, in document order.
    fn scan_elements(&self) -> Vec<Self::Element>;
    /// Elements whose class attribute contains `fragment`, in document order.
    fn class_candidates(&self, fragment: &str) -> Vec<Self::Element>;
    /// Whether `element` is a descendant of `container`. An element is not
    /// within itself.
    fn is_within(&self, element: Self::Element, container: Self::Element) -> bool;
    /// Class-fragment matches the page had before any candidate cap, when known.
    fn candidate_total(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderNodeEntry {
    pub id: NodeId,
    #[serde(default)]
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub slots: HashMap<StateSlot, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementEntry {
    pub id: ElementId,
    /// Position in document order (`querySelectorAll('*')` index).
    pub doc_index: u32,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub node: Option<NodeId>,
    /// Part of the capped fallback scan window.
    #[serde(default)]
    pub in_scan: bool,
    /// Captured container element this one was found inside.
    #[serde(default)]
    pub within: Option<ElementId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorHit {
    pub selector: String,
    #[serde(default)]
    pub element: Option<ElementId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageSnapshot {
    /// `performance.timeOrigin` of the captured document.
    #[serde(default)]
    pub time_origin: f64,
    #[serde(default)]
    pub captured_at: i64,
    #[serde(default)]
    pub elements: Vec<ElementEntry>,
    #[serde(default)]
    pub nodes: Vec<RenderNodeEntry>,
    #[serde(default)]
    pub anchors: Vec<AnchorHit>,
    #[serde(default)]
    pub root: Option<NodeId>,
    #[serde(default)]
    pub candidate_total: Option<usize>,
}

impl PageSnapshot {
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::default()
    }

    /// Decode the capture script's JSON output.
    ///
    /// Ids must be dense and positional (`nodes[i].id == i`); the capture script
    /// assigns them that way, and the lookups below rely on it.
    pub fn decode(raw: &str) -> Result<Self, HarvestError> {
        let mut snapshot: PageSnapshot = serde_json::from_str(raw)?;
        snapshot.nodes.sort_by_key(|n| n.id);
        snapshot.elements.sort_by_key(|e| e.id);
        let dense_nodes = snapshot.nodes.iter().enumerate().all(|(i, n)| n.id.0 as usize == i);
        let dense_elements = snapshot
            .elements
            .iter()
            .enumerate()
            .all(|(i, e)| e.id.0 as usize == i);
        if !dense_nodes || !dense_elements {
            return Err(HarvestError::Sandbox(
                "capture returned non-contiguous node or element ids".to_string(),
            ));
        }
        Ok(snapshot)
    }

    pub fn node(&self, id: NodeId) -> Option<&RenderNodeEntry> {
        self.nodes.get(id.0 as usize).filter(|n| n.id == id)
    }

    pub fn element(&self, id: ElementId) -> Option<&ElementEntry> {
        self.elements.get(id.0 as usize).filter(|e| e.id == id)
    }

    fn in_document_order(&self, mut ids: Vec<ElementId>) -> Vec<ElementId> {
        ids.sort_by_key(|id| self.element(*id).map(|e| e.doc_index).unwrap_or(u32::MAX));
        ids
    }
}

impl RenderTree for PageSnapshot {
    type Node = NodeId;

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).and_then(|n| n.parent)
    }

    fn slot(&self, node: NodeId, slot: StateSlot) -> Option<&Value> {
        self.node(node).and_then(|n| n.slots.get(&slot))
    }
}

impl DocumentView for PageSnapshot {
    type Element = ElementId;

    fn resolve_anchor(&self, selector: &str) -> Option<ElementId> {
        self.anchors
            .iter()
            .find(|a| a.selector == selector)
            .and_then(|a| a.element)
    }

    fn app_root(&self) -> Option<NodeId> {
        self.root
    }

    fn render_node(&self, element: ElementId) -> Option<NodeId> {
        self.element(element).and_then(|e| e.node)
    }

    fn class_name(&self, element: ElementId) -> Option<&str> {
        self.element(element).and_then(|e| e.class_name.as_deref())
    }

    fn scan_elements(&self) -> Vec<ElementId> {
        let ids = self
            .elements
            .iter()
            .filter(|e| e.in_scan)
            .map(|e| e.id)
            .collect();
        self.in_document_order(ids)
    }

    fn class_candidates(&self, fragment: &str) -> Vec<ElementId> {
        let ids = self
            .elements
            .iter()
            .filter(|e| {
                e.class_name
                    .as_deref()
                    .is_some_and(|c| c.contains(fragment))
            })
            .map(|e| e.id)
            .collect();
        self.in_document_order(ids)
    }

    fn is_within(&self, element: ElementId, container: ElementId) -> bool {
        let mut current = self.element(element).and_then(|e| e.within);
        for _ in 0..self.elements.len() {
            match current {
                Some(id) if id == container => return true,
                Some(id) => current = self.element(id).and_then(|e| e.within),
                None => return false,
            }
        }
        false
    }

    fn candidate_total(&self) -> Option<usize> {
        self.candidate_total
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

/// Assembles snapshots programmatically (fixtures, replayed captures).
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    snapshot: PageSnapshot,
}

impl SnapshotBuilder {
    /// Add a render node under `parent` and return its id.
    pub fn node(&mut self, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.snapshot.nodes.len() as u32);
        self.snapshot.nodes.push(RenderNodeEntry {
            id,
            parent,
            slots: HashMap::new(),
        });
        id
    }

    /// Add a chain of `len` empty nodes below `parent`; returns the deepest one.
    pub fn chain(&mut self, parent: Option<NodeId>, len: usize) -> Option<NodeId> {
        let mut current = parent;
        for _ in 0..len {
            current = Some(self.node(current));
        }
        current
    }

    pub fn slot(&mut self, node: NodeId, slot: StateSlot, value: Value) -> &mut Self {
        if let Some(entry) = self.snapshot.nodes.get_mut(node.0 as usize) {
            entry.slots.insert(slot, value);
        }
        self
    }

    /// Add an element in document order; every element joins the scan window.
    pub fn element(&mut self, class_name: Option<&str>, node: Option<NodeId>) -> ElementId {
        let id = ElementId(self.snapshot.elements.len() as u32);
        self.snapshot.elements.push(ElementEntry {
            id,
            doc_index: id.0,
            tag: "div".to_string(),
            class_name: class_name.map(str::to_string),
            node,
            in_scan: true,
            within: None,
        });
        id
    }

    /// Like [`element`](Self::element), placed inside `container`.
    pub fn element_in(
        &mut self,
        class_name: Option<&str>,
        node: Option<NodeId>,
        container: ElementId,
    ) -> ElementId {
        let id = self.element(class_name, node);
        self.snapshot.elements[id.0 as usize].within = Some(container);
        id
    }

    pub fn anchor(&mut self, selector: &str, element: Option<ElementId>) -> &mut Self {
        self.snapshot.anchors.push(AnchorHit {
            selector: selector.to_string(),
            element,
        });
        self
    }

    pub fn root(&mut self, node: NodeId) -> &mut Self {
        self.snapshot.root = Some(node);
        self
    }

    pub fn time_origin(&mut self, origin: f64) -> &mut Self {
        self.snapshot.time_origin = origin;
        self
    }

    pub fn build(&mut self) -> PageSnapshot {
        std::mem::take(&mut self.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_capture_output() {
        let raw = json!({
            "timeOrigin": 1700000000000.5,
            "capturedAt": 1700000001000i64,
            "elements": [
                {"id": 1, "docIndex": 9, "tag": "div", "className": "msg-row", "node": 1, "inScan": true},
                {"id": 0, "docIndex": 3, "tag": "main", "className": null, "node": 0, "inScan": true}
            ],
            "nodes": [
                {"id": 0, "parent": null, "slots": {}},
                {"id": 1, "parent": 0, "slots": {"memoizedProps": {"message": {"id": "m1"}}}}
            ],
            "anchors": [{"selector": "#app", "element": 0}, {"selector": ".missing", "element": null}],
            "root": 0
        })
        .to_string();

        let snapshot = PageSnapshot::decode(&raw).unwrap();
        assert_eq!(snapshot.parent(NodeId(1)), Some(NodeId(0)));
        assert!(snapshot.slot(NodeId(1), StateSlot::Props).is_some());
        assert!(snapshot.slot(NodeId(1), StateSlot::State).is_none());
        assert_eq!(snapshot.resolve_anchor("#app"), Some(ElementId(0)));
        assert_eq!(snapshot.resolve_anchor(".missing"), None);
        assert_eq!(snapshot.class_candidates("msg"), vec![ElementId(1)]);
        assert_eq!(snapshot.scan_elements(), vec![ElementId(0), ElementId(1)]);
    }

    #[test]
    fn test_decode_rejects_sparse_ids() {
        let raw = json!({"nodes": [{"id": 3, "parent": null}]}).to_string();
        assert!(PageSnapshot::decode(&raw).is_err());
    }

    #[test]
    fn test_builder_chain_links_parents() {
        let mut b = PageSnapshot::builder();
        let root = b.node(None);
        let leaf = b.chain(Some(root), 3).unwrap();
        let snapshot = b.build();
        let mut depth = 0;
        let mut cur = Some(leaf);
        while let Some(n) = cur {
            cur = snapshot.parent(n);
            depth += 1;
        }
        assert_eq!(depth, 4);
    }

    #[test]
    fn test_containment_follows_within_links() {
        let raw = json!({
            "elements": [
                {"id": 0, "docIndex": 0, "className": "thread"},
                {"id": 1, "docIndex": 1, "className": "group", "within": 0},
                {"id": 2, "docIndex": 2, "className": "message", "within": 1},
                {"id": 3, "docIndex": 3, "className": "message-preview"}
            ],
            "candidateTotal": 40
        })
        .to_string();

        let snapshot = PageSnapshot::decode(&raw).unwrap();
        assert!(snapshot.is_within(ElementId(2), ElementId(0)));
        assert!(snapshot.is_within(ElementId(1), ElementId(0)));
        assert!(!snapshot.is_within(ElementId(3), ElementId(0)));
        assert!(!snapshot.is_within(ElementId(0), ElementId(0)));
        assert_eq!(snapshot.candidate_total(), Some(40));
    }
}
