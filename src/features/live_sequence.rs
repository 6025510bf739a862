//! In-process reactive sequence.
//!
//! Stands in for a collection owned by the host application: callers mutate
//! it, and the watcher taps its growth either through a change subscription
//! or by wrapping `push`. Which of those is available is fixed at
//! construction.

use super::sequence_watcher::{
    AppendHook, ChangeListener, Disposer, SequenceChange, SequenceTarget,
};
use super::watch_registry::SequenceIdentity;
use crate::core::error::WatchError;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observability {
    /// Change subscription and append wrapping both available.
    Native,
    /// No subscription primitive; `push` can be wrapped.
    InterceptOnly,
    /// Neither; the append property behaves as non-writable.
    Sealed,
}

struct Inner {
    items: Mutex<Vec<Value>>,
    listeners: Mutex<Vec<(u64, ChangeListener)>>,
    hooks: Mutex<Vec<AppendHook>>,
    next_listener: AtomicU64,
    observability: Observability,
    ordered: bool,
    token: Arc<dyn Any + Send + Sync>,
}

#[derive(Clone)]
pub struct LiveSequence {
    inner: Arc<Inner>,
}

impl LiveSequence {
    fn build(items: Vec<Value>, observability: Observability, ordered: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(items),
                listeners: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                observability,
                ordered,
                token: Arc::new(()),
            }),
        }
    }

    pub fn observable(items: Vec<Value>) -> Self {
        Self::build(items, Observability::Native, true)
    }

    pub fn plain(items: Vec<Value>) -> Self {
        Self::build(items, Observability::InterceptOnly, true)
    }

    pub fn locked_append(items: Vec<Value>) -> Self {
        Self::build(items, Observability::Sealed, true)
    }

    /// Arrays become observable sequences; anything else is a value the
    /// watcher must reject.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::observable(items),
            _ => Self::build(Vec::new(), Observability::Sealed, false),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.items.lock().ok()?.get(index).cloned()
    }

    pub fn to_vec(&self) -> Vec<Value> {
        self.inner
            .items
            .lock()
            .map(|i| i.clone())
            .unwrap_or_default()
    }

    pub fn push(&self, value: Value) -> usize {
        self.push_many(vec![value])
    }

    /// Append atomically, then notify. Returns the new length.
    pub fn push_many(&self, values: Vec<Value>) -> usize {
        let Ok(mut items) = self.inner.items.lock() else {
            return 0;
        };
        let start = items.len();
        items.extend(values.iter().cloned());
        let len = items.len();

        // Still holding the items lock so notifications follow mutation order.
        if !values.is_empty() {
            self.notify(&SequenceChange::Splice {
                index: start,
                added: values.clone(),
                removed: 0,
            });
            if let Ok(hooks) = self.inner.hooks.lock() {
                for hook in hooks.iter() {
                    hook(start, &values);
                }
            }
        }
        len
    }

    /// Replace an element in place. Returns `false` when out of range.
    pub fn update(&self, index: usize, value: Value) -> bool {
        let Ok(mut items) = self.inner.items.lock() else {
            return false;
        };
        let Some(slot) = items.get_mut(index) else {
            return false;
        };
        *slot = value.clone();
        self.notify(&SequenceChange::Update {
            index,
            new_value: value,
        });
        true
    }

    /// Mutable access to a stored element without notification, as the host
    /// application would do when editing an object in place.
    pub fn edit_in_place(&self, index: usize, f: impl FnOnce(&mut Value)) -> bool {
        let Ok(mut items) = self.inner.items.lock() else {
            return false;
        };
        match items.get_mut(index) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    fn notify(&self, change: &SequenceChange) {
        if self.inner.observability != Observability::Native {
            return;
        }
        if let Ok(listeners) = self.inner.listeners.lock() {
            for (_, listener) in listeners.iter() {
                listener(change);
            }
        }
    }
}

fn unsubscribe(inner: &Weak<Inner>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        if let Ok(mut listeners) = inner.listeners.lock() {
            listeners.retain(|(lid, _)| *lid != id);
        }
    }
}

#[async_trait]
impl SequenceTarget for LiveSequence {
    fn identity(&self) -> SequenceIdentity {
        SequenceIdentity::new(
            format!("live:{:p}", Arc::as_ptr(&self.inner)),
            &self.inner.token,
        )
    }

    fn describe(&self) -> String {
        format!("live sequence ({} items)", self.len())
    }

    async fn is_ordered_collection(&self) -> bool {
        self.inner.ordered
    }

    async fn subscribe_native(&self, listener: ChangeListener) -> Result<Disposer, WatchError> {
        if self.inner.observability != Observability::Native {
            return Err(WatchError::NativeObservationUnavailable);
        }
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .map_err(|_| WatchError::NativeObservationUnavailable)?
            .push((id, listener));
        let weak = Arc::downgrade(&self.inner);
        Ok(Disposer::new(move || unsubscribe(&weak, id)))
    }

    async fn intercept_append(&self, hook: AppendHook) -> Result<(), WatchError> {
        if self.inner.observability == Observability::Sealed {
            return Err(WatchError::FallbackInstallFailed(
                "append is not writable".to_string(),
            ));
        }
        self.inner
            .hooks
            .lock()
            .map_err(|e| WatchError::FallbackInstallFailed(e.to_string()))?
            .push(hook);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_listener_sees_splice_and_update() {
        let seq = LiveSequence::observable(vec![json!(1)]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = seen.clone();
        let _disposer = seq
            .subscribe_native(Arc::new(move |change: &SequenceChange| {
                seen_in.lock().unwrap().push(change.clone());
            }))
            .await
            .unwrap();
        seq.push_many(vec![json!(2), json!(3)]);
        assert!(seq.update(0, json!(9)));
        assert!(!seq.update(7, json!(0)));

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen[0],
            SequenceChange::Splice {
                index: 1,
                added: vec![json!(2), json!(3)],
                removed: 0
            }
        );
        assert_eq!(
            seen[1],
            SequenceChange::Update {
                index: 0,
                new_value: json!(9)
            }
        );
    }

    #[tokio::test]
    async fn test_disposer_unsubscribes() {
        let seq = LiveSequence::observable(vec![]);
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        let disposer = seq
            .subscribe_native(Arc::new(move |_: &SequenceChange| {
                h.fetch_add(1, Ordering::Relaxed);
            }))
            .await
            .unwrap();
        seq.push(json!("a"));
        disposer.dispose();
        seq.push(json!("b"));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(seq.len(), 2);
    }

    #[tokio::test]
    async fn test_capabilities() {
        let plain = LiveSequence::plain(vec![]);
        assert!(matches!(
            plain.subscribe_native(Arc::new(|_: &SequenceChange| {})).await,
            Err(WatchError::NativeObservationUnavailable)
        ));
        assert!(plain.intercept_append(Arc::new(|_: usize, _: &[Value]| {})).await.is_ok());

        let sealed = LiveSequence::locked_append(vec![]);
        assert!(sealed.intercept_append(Arc::new(|_: usize, _: &[Value]| {})).await.is_err());

        assert!(!LiveSequence::from_value(json!({"a": 1})).is_ordered_collection().await);
        assert!(LiveSequence::from_value(json!([1, 2])).is_ordered_collection().await);
    }

    #[tokio::test]
    async fn test_hook_runs_after_append() {
        let seq = LiveSequence::plain(vec![json!(0)]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        seq.intercept_append(Arc::new(move |start: usize, items: &[Value]| {
            s.lock().unwrap().push((start, items.to_vec()));
        }))
        .await
        .unwrap();
        assert_eq!(seq.push_many(vec![json!(1), json!(2)]), 3);
        assert_eq!(seen.lock().unwrap()[0], (1, vec![json!(1), json!(2)]));
    }
}
