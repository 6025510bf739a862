//! Taps growth of an ordered collection and delivers each appended element,
//! cloned, to a named handler.
//!
//! Two [`ObservationStrategy`] implementations are tried in order: a native
//! change subscription, then interception of the append operation. Either way
//! the hook only enqueues onto a bounded channel; one consumer task per
//! sequence drains it and runs the handler, so delivery is FIFO per sequence
//! and never blocks the mutating side.

use super::watch_registry::{SequenceIdentity, Signature, WatchRegistry};
use crate::core::error::WatchError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Native,
    Fallback,
}

/// One appended element, structurally cloned away from the live collection.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEvent {
    pub signature: Signature,
    /// Position of the element in the collection right after the append.
    pub index: usize,
    pub element: Value,
}

/// Change notification emitted by a natively observable collection.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceChange {
    Splice {
        index: usize,
        added: Vec<Value>,
        removed: usize,
    },
    Update {
        index: usize,
        new_value: Value,
    },
}

pub type ChangeListener = Arc<dyn Fn(&SequenceChange) + Send + Sync>;

/// Called after the original append with the start index and appended items.
pub type AppendHook = Arc<dyn Fn(usize, &[Value]) + Send + Sync>;

/// Teardown handle for a native subscription.
pub struct Disposer(Box<dyn FnOnce() + Send>);

impl Disposer {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn dispose(self) {
        (self.0)()
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Disposer")
    }
}

/// Whatever owns a watchable collection.
#[async_trait]
pub trait SequenceTarget: Send + Sync {
    fn identity(&self) -> SequenceIdentity;

    /// Short label for logs and failure reports.
    fn describe(&self) -> String;

    async fn is_ordered_collection(&self) -> bool;

    /// `Err(NativeObservationUnavailable)` when the collection has no
    /// change-notification primitive.
    async fn subscribe_native(&self, listener: ChangeListener) -> Result<Disposer, WatchError>;

    /// Wrap the append operation. The original append must run first.
    async fn intercept_append(&self, hook: AppendHook) -> Result<(), WatchError>;
}

/// Receives appended elements, one at a time, in mutation order.
#[async_trait]
pub trait AppendHandler: Send + Sync {
    async fn on_append(&self, event: AppendEvent);
}

#[async_trait]
impl<F> AppendHandler for F
where
    F: Fn(AppendEvent) + Send + Sync,
{
    async fn on_append(&self, event: AppendEvent) {
        self(event)
    }
}

/// Producer half of a sequence's delivery queue.
#[derive(Clone)]
pub struct AppendSink {
    signature: Signature,
    tx: mpsc::Sender<AppendEvent>,
    dropped: Arc<AtomicU64>,
}

impl AppendSink {
    /// Enqueue without waiting. A full queue drops the element and counts it.
    pub fn offer(&self, index: usize, element: Value) {
        let event = AppendEvent {
            signature: self.signature.clone(),
            index,
            element,
        };
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("watch {}: delivery queue full, {} dropped", self.signature, n);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("watch {}: consumer gone", self.signature);
            }
        }
    }
}

#[async_trait]
pub trait ObservationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Install the hook. `Ok(Some(_))` carries a disposer for the subscription.
    async fn install(
        &self,
        target: &dyn SequenceTarget,
        sink: AppendSink,
    ) -> Result<Option<Disposer>, WatchError>;
}

pub struct NativeSubscription;

#[async_trait]
impl ObservationStrategy for NativeSubscription {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Native
    }

    async fn install(
        &self,
        target: &dyn SequenceTarget,
        sink: AppendSink,
    ) -> Result<Option<Disposer>, WatchError> {
        let listener: ChangeListener = Arc::new(move |change: &SequenceChange| {
            // Only growth matters; in-place updates are ignored.
            if let SequenceChange::Splice { index, added, .. } = change {
                for (offset, element) in added.iter().enumerate() {
                    sink.offer(index + offset, element.clone());
                }
            }
        });
        target.subscribe_native(listener).await.map(Some)
    }
}

pub struct AppendInterception;

#[async_trait]
impl ObservationStrategy for AppendInterception {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fallback
    }

    async fn install(
        &self,
        target: &dyn SequenceTarget,
        sink: AppendSink,
    ) -> Result<Option<Disposer>, WatchError> {
        let hook: AppendHook = Arc::new(move |start: usize, items: &[Value]| {
            for (offset, element) in items.iter().enumerate() {
                sink.offer(start + offset, element.clone());
            }
        });
        target.intercept_append(hook).await.map(|()| None)
    }
}

/// A successfully instrumented sequence.
#[derive(Debug)]
pub struct WatchedSequence {
    pub signature: Signature,
    pub strategy: StrategyKind,
    pub target: String,
    disposer: Option<Disposer>,
    dropped: Arc<AtomicU64>,
}

impl WatchedSequence {
    /// Present only for the native strategy.
    pub fn take_disposer(&mut self) -> Option<Disposer> {
        self.disposer.take()
    }

    pub fn has_disposer(&self) -> bool {
        self.disposer.is_some()
    }

    /// Elements dropped because the delivery queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct SequenceWatcher {
    registry: Arc<WatchRegistry>,
    strategies: Vec<Box<dyn ObservationStrategy>>,
    queue_capacity: usize,
}

impl SequenceWatcher {
    /// Native subscription first, append interception second.
    pub fn new(registry: Arc<WatchRegistry>, queue_capacity: usize) -> Self {
        Self::with_strategies(
            registry,
            queue_capacity,
            vec![Box::new(NativeSubscription), Box::new(AppendInterception)],
        )
    }

    pub fn with_strategies(
        registry: Arc<WatchRegistry>,
        queue_capacity: usize,
        strategies: Vec<Box<dyn ObservationStrategy>>,
    ) -> Self {
        Self {
            registry,
            strategies,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    pub async fn watch(
        &self,
        target: Arc<dyn SequenceTarget>,
        handler: Arc<dyn AppendHandler>,
    ) -> Result<WatchedSequence, WatchError> {
        let label = target.describe();
        if !target.is_ordered_collection().await {
            return Err(WatchError::SequenceNotArray(label));
        }

        let identity = target.identity();
        let signature = self
            .registry
            .claim(&identity)
            .map_err(|existing| WatchError::AlreadyInstrumented(existing.to_string()))?;

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let sink = AppendSink {
            signature: signature.clone(),
            tx,
            dropped: dropped.clone(),
        };

        let mut last_err = WatchError::FallbackInstallFailed("no observation strategy".into());
        for strategy in &self.strategies {
            match strategy.install(target.as_ref(), sink.clone()).await {
                Ok(disposer) => {
                    info!("watching {} ({:?}, signature {})", label, strategy.kind(), signature);
                    drop(sink);
                    spawn_consumer(rx, handler);
                    return Ok(WatchedSequence {
                        signature,
                        strategy: strategy.kind(),
                        target: label,
                        disposer,
                        dropped,
                    });
                }
                Err(e) => {
                    debug!("{:?} strategy unavailable for {}: {}", strategy.kind(), label, e);
                    last_err = e;
                }
            }
        }

        self.registry.release(&identity, &signature);
        warn!("could not instrument {}: {}", label, last_err);
        Err(last_err)
    }
}

fn spawn_consumer(mut rx: mpsc::Receiver<AppendEvent>, handler: Arc<dyn AppendHandler>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handler.on_append(event).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;
    use std::sync::Mutex;

    /// Records which hooks were installed; can refuse either.
    struct FakeTarget {
        token: Arc<dyn Any + Send + Sync>,
        native: bool,
        interceptable: bool,
        listener: Mutex<Option<ChangeListener>>,
    }

    impl FakeTarget {
        fn new(native: bool, interceptable: bool) -> Arc<Self> {
            Arc::new(Self {
                token: Arc::new(()),
                native,
                interceptable,
                listener: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl SequenceTarget for FakeTarget {
        fn identity(&self) -> SequenceIdentity {
            SequenceIdentity::new("target", &self.token)
        }
        fn describe(&self) -> String {
            "target".into()
        }
        async fn is_ordered_collection(&self) -> bool {
            true
        }
        async fn subscribe_native(&self, l: ChangeListener) -> Result<Disposer, WatchError> {
            if !self.native {
                return Err(WatchError::NativeObservationUnavailable);
            }
            *self.listener.lock().unwrap() = Some(l);
            Ok(Disposer::new(|| {}))
        }
        async fn intercept_append(&self, _hook: AppendHook) -> Result<(), WatchError> {
            if self.interceptable {
                Ok(())
            } else {
                Err(WatchError::FallbackInstallFailed("frozen".into()))
            }
        }
    }

    fn noop() -> Arc<dyn AppendHandler> {
        Arc::new(|_: AppendEvent| {})
    }

    #[tokio::test]
    async fn test_prefers_native_and_returns_disposer() {
        let watcher = SequenceWatcher::new(Arc::new(WatchRegistry::new()), 8);
        let watched = watcher.watch(FakeTarget::new(true, true), noop()).await.unwrap();
        assert_eq!(watched.strategy, StrategyKind::Native);
        assert!(watched.has_disposer());
    }

    #[tokio::test]
    async fn test_falls_back_without_disposer() {
        let watcher = SequenceWatcher::new(Arc::new(WatchRegistry::new()), 8);
        let watched = watcher.watch(FakeTarget::new(false, true), noop()).await.unwrap();
        assert_eq!(watched.strategy, StrategyKind::Fallback);
        assert!(!watched.has_disposer());
    }

    #[tokio::test]
    async fn test_both_failing_releases_signature() {
        let registry = Arc::new(WatchRegistry::new());
        let watcher = SequenceWatcher::new(registry.clone(), 8);
        let target = FakeTarget::new(false, false);
        let err = watcher.watch(target.clone(), noop()).await.unwrap_err();
        assert!(matches!(err, WatchError::FallbackInstallFailed(_)));
        assert!(registry.signature_of(&target.identity()).is_none());
    }

    #[tokio::test]
    async fn test_full_queue_counts_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let sink = AppendSink {
            signature: Signature::fresh(),
            tx,
            dropped: dropped.clone(),
        };
        sink.offer(0, Value::from(1));
        sink.offer(1, Value::from(2));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }
}
