//! Scripted page fixtures shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use thread_harvest::extraction::snapshot::{NodeId, PageSnapshot, SnapshotBuilder, StateSlot};
use thread_harvest::{CaptureRequest, HarvestError, HarvestResult, PageDriver, ScrollEdge};

pub fn init_logger() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Replays one snapshot per capture; the last one repeats once the script runs out.
#[derive(Default)]
pub struct ScriptedDriver {
    frames: Mutex<VecDeque<PageSnapshot>>,
    last: Mutex<Option<PageSnapshot>>,
    pub scrolls: AtomicUsize,
    pub captures: Mutex<Vec<CaptureRequest>>,
    pub broken: bool,
}

impl ScriptedDriver {
    pub fn new(frames: Vec<PageSnapshot>) -> Self {
        Self {
            frames: Mutex::new(frames.into()),
            ..Default::default()
        }
    }

    /// A driver whose sandbox refuses to run anything.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Default::default()
        }
    }

    pub fn scroll_count(&self) -> usize {
        self.scrolls.load(Ordering::SeqCst)
    }

    pub fn capture_count(&self) -> usize {
        self.captures.lock().unwrap().len()
    }
}

#[async_trait]
impl PageDriver for ScriptedDriver {
    async fn capture(&self, request: &CaptureRequest) -> HarvestResult<PageSnapshot> {
        if self.broken {
            return Err(HarvestError::Sandbox("evaluation disabled".to_string()));
        }
        self.captures.lock().unwrap().push(request.clone());
        let next = self.frames.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(frame) = next {
            *last = Some(frame);
        }
        Ok(last.clone().unwrap_or_default())
    }

    async fn scroll_to_edge(&self, _container: &str, _edge: ScrollEdge) -> HarvestResult<()> {
        self.scrolls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn message(id: &str, text: &str, sender: &str, ts: i64) -> Value {
    json!({"id": id, "text": text, "senderId": sender, "timestamp": ts})
}

/// Message ids `m{first}..m{first+count}` with increasing timestamps.
pub fn messages(first: usize, count: usize) -> Vec<Value> {
    (first..first + count)
        .map(|i| {
            message(
                &format!("m{i}"),
                &format!("hello {i}"),
                "u1",
                1_700_000_000_000 + i as i64 * 1000,
            )
        })
        .collect()
}

/// One `message-row` element per item, bound to a leaf under a row component
/// whose props carry `{message: item}`.
pub fn rendered_rows(b: &mut SnapshotBuilder, list: NodeId, items: &[Value]) {
    for item in items {
        let row = b.node(Some(list));
        b.slot(row, StateSlot::Props, json!({ "message": item }));
        let leaf = b.node(Some(row));
        b.element(Some("message-row"), Some(leaf));
    }
}

/// A window of rendered rows inside a scroll container.
pub fn window(items: &[Value]) -> PageSnapshot {
    let mut b = PageSnapshot::builder();
    let root = b.node(None);
    let list = b.node(Some(root));
    b.root(root);
    rendered_rows(&mut b, list, items);
    b.time_origin(1_700_000_000_000.0);
    b.build()
}
