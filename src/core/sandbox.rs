//! The two page capabilities the extraction core consumes: run the capture
//! function inside the page's script sandbox, and move a scroll container.

use super::error::HarvestResult;
use crate::extraction::snapshot::PageSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Edge of the virtualized container that reveals more items when reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollEdge {
    /// Older history loads above (typical chat thread).
    #[default]
    Top,
    /// More entries load below (typical conversation list).
    Bottom,
}

impl ScrollEdge {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScrollEdge::Top => "top",
            ScrollEdge::Bottom => "bottom",
        }
    }
}

/// Parameters handed to the in-page capture function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    /// Anchor selectors to resolve (store anchors, scroll container).
    pub anchors: Vec<String>,
    /// Class fragment for record candidates; empty disables candidate capture.
    pub class_fragment: String,
    /// Candidate cap (first N matches in document order).
    pub max_candidates: usize,
    /// Fallback scan window size.
    pub scan_cap: usize,
    /// Ancestor depth captured above every captured element.
    pub max_depth: usize,
    /// Slot objects are kept only when they carry one of these keys.
    pub keys: Vec<String>,
    /// Container selector; candidates are looked up inside it when it resolves.
    #[serde(default)]
    pub scope: Option<String>,
}

/// Script sandbox + scroll primitive of one page instance.
///
/// A failing `capture` means the environment could not run injected code at
/// all; it is the only error the extraction core propagates.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn capture(&self, request: &CaptureRequest) -> HarvestResult<PageSnapshot>;

    /// Set the scroll offset of `container` (falls back to the document's
    /// scrolling element when the selector does not resolve).
    async fn scroll_to_edge(&self, container: &str, edge: ScrollEdge) -> HarvestResult<()>;
}
