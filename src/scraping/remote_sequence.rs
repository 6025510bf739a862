use super::cdp::{BindingRouter, CdpPage, Route};
use super::scripts;
use crate::core::error::WatchError;
use crate::extraction::store_locator::LocatedStore;
use crate::features::sequence_watcher::{
    AppendHook, ChangeListener, Disposer, SequenceTarget,
};
use crate::features::watch_registry::SequenceIdentity;
use async_trait::async_trait;
use chromiumoxide::Page;
use serde::Deserialize;
use std::any::Any;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct InstallResult {
    ok: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// A sequence living inside a located store in the page.
///
/// Identity is the document's time origin plus an in-page object id, so the
/// same array is recognised across repeated lookups, and the liveness token
/// dies when the page navigates to a new document.
pub struct RemoteSequence {
    page: Page,
    router: BindingRouter,
    store: LocatedStore,
    path: String,
    key: String,
    token: Arc<dyn Any + Send + Sync>,
    ordered: bool,
    watch_id: String,
}

impl RemoteSequence {
    pub(crate) fn new(
        page: Page,
        router: BindingRouter,
        store: LocatedStore,
        path: String,
        key: String,
        token: Arc<dyn Any + Send + Sync>,
        ordered: bool,
    ) -> Self {
        Self {
            page,
            router,
            store,
            path,
            key,
            token,
            ordered,
            watch_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    async fn install(&self, js: String) -> Result<(), String> {
        match CdpPage::eval_json::<InstallResult>(&self.page, js).await {
            Ok(r) if r.ok => Ok(()),
            Ok(r) => Err(r.reason.unwrap_or_else(|| "refused".to_string())),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl SequenceTarget for RemoteSequence {
    fn identity(&self) -> SequenceIdentity {
        SequenceIdentity::new(self.key.clone(), &self.token)
    }

    fn describe(&self) -> String {
        format!("{}.{}", self.store.name, self.path)
    }

    async fn is_ordered_collection(&self) -> bool {
        self.ordered
    }

    async fn subscribe_native(&self, listener: ChangeListener) -> Result<Disposer, WatchError> {
        self.router.insert(&self.watch_id, Route::Native(listener));
        let js = scripts::observe_native_js(&self.store, &self.path, &self.watch_id);
        if let Err(reason) = self.install(js).await {
            self.router.remove(&self.watch_id);
            tracing::debug!("{}: native observation unavailable ({})", self.describe(), reason);
            return Err(WatchError::NativeObservationUnavailable);
        }

        let page = self.page.clone();
        let router = self.router.clone();
        let watch_id = self.watch_id.clone();
        Ok(Disposer::new(move || {
            router.remove(&watch_id);
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!("watch {}: no runtime to unobserve in page", watch_id);
                return;
            };
            handle.spawn(async move {
                if let Err(e) = page.evaluate(scripts::unobserve_js(&watch_id)).await {
                    warn!("watch {}: unobserve failed: {}", watch_id, e);
                }
            });
        }))
    }

    async fn intercept_append(&self, hook: AppendHook) -> Result<(), WatchError> {
        self.router.insert(&self.watch_id, Route::Append(hook));
        let js = scripts::intercept_append_js(&self.store, &self.path, &self.watch_id);
        self.install(js).await.map_err(|reason| {
            self.router.remove(&self.watch_id);
            WatchError::FallbackInstallFailed(reason)
        })
    }
}
