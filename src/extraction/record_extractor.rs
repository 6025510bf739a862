use super::record_shape::{
    class_direction_hint, normalize, Classifier, NormalizeContext, RecordCandidate, ShapeMatch,
};
use super::snapshot::{DocumentView, StateSlot};
use super::tree_walker::walk_ancestors;
use crate::core::types::{Record, SourceChannel};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ExtractorOptions {
    /// Class-name fragment used to over-select candidate item nodes.
    pub class_fragment: String,
    /// Safety cap on candidates inspected per pass.
    pub max_nodes: usize,
    /// Upward walk depth per candidate.
    pub max_depth: usize,
    pub max_content_chars: usize,
    pub self_author_id: Option<String>,
}

impl Default for ExtractorOptions {
    fn default() -> Self {
        Self {
            class_fragment: "message".to_string(),
            max_nodes: 500,
            max_depth: 20,
            max_content_chars: 2000,
            self_author_id: None,
        }
    }
}

/// Result of one pass over the currently rendered window.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Normalised records in DOM order.
    pub records: Vec<Record>,
    /// Nodes that matched the class heuristic. Counts matches past
    /// `max_nodes` too, including those the capture script reported but did
    /// not ship.
    pub candidates_matched: usize,
    /// Candidates without any render node attached.
    pub skipped_unbound: usize,
    /// Candidates whose ancestry exposed no record shape within the depth bound.
    pub skipped_no_shape: usize,
    /// Candidates that resolved to a record another candidate already produced.
    pub skipped_duplicate: usize,
    pub extracted_at: i64,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

enum NodeOutcome<N> {
    Record(Record, (N, StateSlot)),
    Unbound,
    NoShape,
}

/// Recovers records from the rendered item nodes of a virtualized list.
#[derive(Debug)]
pub struct RecordExtractor {
    options: ExtractorOptions,
    classifier: Classifier,
}

impl RecordExtractor {
    pub fn new(options: ExtractorOptions, classifier: Classifier) -> Self {
        Self {
            options,
            classifier,
        }
    }

    pub fn options(&self) -> &ExtractorOptions {
        &self.options
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Extract from every class-fragment match in the document.
    pub fn extract<D: DocumentView>(&self, doc: &D, extracted_at: i64) -> Extraction {
        self.extract_scoped(doc, None, extracted_at)
    }

    /// Extract only from matches inside the element `container` resolves to.
    /// An unresolved container widens the pass to the whole document, the
    /// same fallback the scroll primitive uses.
    pub fn extract_within<D: DocumentView>(
        &self,
        doc: &D,
        container: &str,
        extracted_at: i64,
    ) -> Extraction {
        let scope = doc.resolve_anchor(container);
        if scope.is_none() {
            debug!("extract: container `{}` not found, using whole document", container);
        }
        self.extract_scoped(doc, scope, extracted_at)
    }

    fn extract_scoped<D: DocumentView>(
        &self,
        doc: &D,
        scope: Option<D::Element>,
        extracted_at: i64,
    ) -> Extraction {
        let mut candidates = doc.class_candidates(&self.options.class_fragment);
        if let Some(container) = scope {
            candidates.retain(|el| doc.is_within(*el, container));
        }
        let mut out = Extraction {
            candidates_matched: doc.candidate_total().unwrap_or(0).max(candidates.len()),
            extracted_at,
            ..Default::default()
        };
        let mut seen_sources = HashSet::new();

        for element in candidates.into_iter().take(self.options.max_nodes) {
            let sequence_index = out.records.len() as u64;
            match self.extract_node(doc, element, extracted_at, sequence_index) {
                NodeOutcome::Record(record, source) => {
                    if seen_sources.insert(source) {
                        out.records.push(record);
                    } else {
                        out.skipped_duplicate += 1;
                    }
                }
                NodeOutcome::Unbound => out.skipped_unbound += 1,
                NodeOutcome::NoShape => out.skipped_no_shape += 1,
            }
        }

        debug!(
            "extract: {} candidates, {} records, {} unbound, {} shapeless, {} duplicate",
            out.candidates_matched,
            out.records.len(),
            out.skipped_unbound,
            out.skipped_no_shape,
            out.skipped_duplicate
        );
        out
    }

    fn extract_node<D: DocumentView>(
        &self,
        doc: &D,
        element: D::Element,
        extracted_at: i64,
        sequence_index: u64,
    ) -> NodeOutcome<D::Node> {
        let Some(node) = doc.render_node(element) else {
            return NodeOutcome::Unbound;
        };
        let found = walk_ancestors(doc, node, self.options.max_depth, |_, value| {
            match self.classifier.classify(value) {
                ShapeMatch::Candidate(c) => Some(c),
                ShapeMatch::NoMatch => None,
            }
        });
        let Some((hit, candidate)) = found else {
            return NodeOutcome::NoShape;
        };

        let ctx = NormalizeContext {
            extracted_at,
            sequence_index,
            max_content_chars: self.options.max_content_chars,
            channel: SourceChannel::Dom,
            direction_hint: doc.class_name(element).and_then(class_direction_hint),
            self_author_id: self.options.self_author_id.as_deref(),
        };
        NodeOutcome::Record(normalize(candidate, &ctx), (hit.node, hit.slot))
    }

    /// Classify one free-standing object (e.g. an element appended to a
    /// watched sequence) with the same rules as the DOM pass.
    pub fn classify_value(&self, value: &serde_json::Value) -> Option<RecordCandidate> {
        match self.classifier.classify(value) {
            ShapeMatch::Candidate(c) => Some(c),
            ShapeMatch::NoMatch => None,
        }
    }
}

impl Default for RecordExtractor {
    fn default() -> Self {
        Self::new(ExtractorOptions::default(), Classifier::default())
    }
}
