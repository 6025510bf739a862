//! chromiumoxide-backed page driver.
//!
//! `CdpPage` is the script sandbox and scroll primitive for one tab, and the
//! source of page-resident watch targets. Appended elements come back through
//! a `Runtime.addBinding` function and are routed by watch id.

use super::remote_sequence::RemoteSequence;
use super::scripts;
use crate::core::error::{HarvestError, HarvestResult};
use crate::core::sandbox::{CaptureRequest, PageDriver, ScrollEdge};
use crate::extraction::snapshot::PageSnapshot;
use crate::extraction::store_locator::LocatedStore;
use crate::features::sequence_watcher::{AppendHook, ChangeListener, SequenceChange, SequenceTarget};
use crate::harvest::SequenceSource;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) enum Route {
    Native(ChangeListener),
    Append(AppendHook),
}

/// Watch id → in-process hook.
#[derive(Clone, Default)]
pub struct BindingRouter {
    routes: Arc<Mutex<HashMap<String, Route>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BindingPayload {
    watch_id: String,
    index: usize,
    #[serde(default)]
    added: Vec<Value>,
    #[serde(default)]
    removed: usize,
}

impl BindingRouter {
    pub(crate) fn insert(&self, watch_id: &str, route: Route) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(watch_id.to_string(), route);
        }
    }

    pub(crate) fn remove(&self, watch_id: &str) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(watch_id);
        }
    }

    pub fn len(&self) -> usize {
        self.routes.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one binding payload. Unknown watch ids are ignored.
    pub fn dispatch(&self, payload: &str) {
        let payload: BindingPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed binding payload: {}", e);
                return;
            }
        };
        let Ok(routes) = self.routes.lock() else {
            return;
        };
        match routes.get(&payload.watch_id) {
            Some(Route::Native(listener)) => listener(&SequenceChange::Splice {
                index: payload.index,
                added: payload.added,
                removed: payload.removed,
            }),
            Some(Route::Append(hook)) => hook(payload.index, &payload.added),
            None => debug!("binding payload for unknown watch {}", payload.watch_id),
        }
    }
}

struct DocumentToken {
    time_origin: f64,
    token: Arc<dyn Any + Send + Sync>,
}

pub struct CdpPage {
    page: Page,
    router: BindingRouter,
    document: Mutex<DocumentToken>,
    listener: JoinHandle<()>,
}

impl CdpPage {
    /// Install the prelude (current and future documents) and the binding.
    pub async fn attach(page: Page) -> Result<Self> {
        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(scripts::prelude()))
            .await
            .map_err(|e| anyhow!("Failed to register prelude: {}", e))?;
        page.execute(AddBindingParams::new(scripts::BINDING_NAME))
            .await
            .map_err(|e| anyhow!("Failed to add binding: {}", e))?;
        if let Err(e) = page.evaluate(scripts::prelude()).await {
            warn!("prelude evaluation on current document failed: {}", e);
        }

        let router = BindingRouter::default();
        let mut events = page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(|e| anyhow!("Failed to listen for binding calls: {}", e))?;
        let routed = router.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.name == scripts::BINDING_NAME {
                    routed.dispatch(&event.payload);
                }
            }
        });

        Ok(Self {
            page,
            router,
            document: Mutex::new(DocumentToken {
                time_origin: f64::NAN,
                token: Arc::new(()),
            }),
            listener,
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn router(&self) -> &BindingRouter {
        &self.router
    }

    /// Evaluate an expression that returns `JSON.stringify(...)`.
    pub(crate) async fn eval_json<T: DeserializeOwned>(
        page: &Page,
        expr: String,
    ) -> HarvestResult<T> {
        let raw: String = page
            .evaluate(expr)
            .await
            .map_err(|e| HarvestError::Sandbox(e.to_string()))?
            .into_value()
            .map_err(|e| HarvestError::Sandbox(e.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Liveness token of the current document; replaced when the document is.
    async fn document_token(&self) -> HarvestResult<(f64, Arc<dyn Any + Send + Sync>)> {
        let origin: f64 = self
            .page
            .evaluate("performance.timeOrigin")
            .await
            .map_err(|e| HarvestError::Sandbox(e.to_string()))?
            .into_value()
            .map_err(|e| HarvestError::Sandbox(e.to_string()))?;
        let Ok(mut doc) = self.document.lock() else {
            return Err(HarvestError::Sandbox("document token poisoned".to_string()));
        };
        if doc.time_origin != origin {
            debug!("new document (timeOrigin {})", origin);
            *doc = DocumentToken {
                time_origin: origin,
                token: Arc::new(()),
            };
        }
        Ok((doc.time_origin, doc.token.clone()))
    }
}

impl Drop for CdpPage {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl PageDriver for CdpPage {
    async fn capture(&self, request: &CaptureRequest) -> HarvestResult<PageSnapshot> {
        let raw: String = self
            .page
            .evaluate(scripts::capture_js(request))
            .await
            .map_err(|e| HarvestError::Sandbox(e.to_string()))?
            .into_value()
            .map_err(|e| HarvestError::Sandbox(e.to_string()))?;
        PageSnapshot::decode(&raw)
    }

    async fn scroll_to_edge(&self, container: &str, edge: ScrollEdge) -> HarvestResult<()> {
        let _: bool = Self::eval_json(&self.page, scripts::scroll_js(container, edge)).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SequenceInfo {
    found: bool,
    ordered: bool,
    object_id: Option<u64>,
}

#[async_trait]
impl SequenceSource for CdpPage {
    async fn sequence_at(
        &self,
        store: &LocatedStore,
        path: &str,
    ) -> Option<Arc<dyn SequenceTarget>> {
        let info: SequenceInfo =
            match Self::eval_json(&self.page, scripts::sequence_info_js(store, path)).await {
                Ok(info) => info,
                Err(e) => {
                    warn!("sequence {}.{} lookup failed: {}", store.name, path, e);
                    return None;
                }
            };
        if !info.found {
            return None;
        }
        let (origin, token) = self.document_token().await.ok()?;
        let key = format!("{}:{}", origin, info.object_id.unwrap_or_default());
        Some(Arc::new(RemoteSequence::new(
            self.page.clone(),
            self.router.clone(),
            store.clone(),
            path.to_string(),
            key,
            token,
            info.ordered,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_router_dispatches_by_watch_id() {
        let router = BindingRouter::default();
        let appended = Arc::new(AtomicUsize::new(0));
        let a = appended.clone();
        router.insert(
            "w1",
            Route::Append(Arc::new(move |start: usize, items: &[Value]| {
                assert_eq!(start, 3);
                a.fetch_add(items.len(), Ordering::Relaxed);
            })),
        );
        let spliced = Arc::new(AtomicUsize::new(0));
        let s = spliced.clone();
        router.insert(
            "w2",
            Route::Native(Arc::new(move |change: &SequenceChange| {
                if let SequenceChange::Splice { added, .. } = change {
                    s.fetch_add(added.len(), Ordering::Relaxed);
                }
            })),
        );

        router.dispatch(r#"{"watchId":"w1","index":3,"added":[{"id":1},{"id":2}]}"#);
        router.dispatch(r#"{"watchId":"w2","index":0,"added":[1]}"#);
        router.dispatch(r#"{"watchId":"gone","index":0,"added":[1]}"#);
        router.dispatch("not json");

        assert_eq!(appended.load(Ordering::Relaxed), 2);
        assert_eq!(spliced.load(Ordering::Relaxed), 1);

        router.remove("w1");
        assert_eq!(router.len(), 1);
    }
}
