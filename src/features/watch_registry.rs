//! Out-of-band idempotency table for instrumented sequences.
//!
//! Nothing is written onto the watched collection itself. Each entry is keyed
//! by the sequence's identity key and holds a weak liveness token, so an entry
//! whose collection is gone (or whose document was replaced) no longer blocks
//! a fresh instrumentation under the same key.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

/// Idempotency marker assigned to one instrumented sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable key of a collection plus a token that dies with it.
#[derive(Clone)]
pub struct SequenceIdentity {
    pub key: String,
    alive: Weak<dyn Any + Send + Sync>,
}

impl SequenceIdentity {
    pub fn new(key: impl Into<String>, token: &Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            key: key.into(),
            alive: Arc::downgrade(token),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

impl fmt::Debug for SequenceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceIdentity")
            .field("key", &self.key)
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct Entry {
    signature: Signature,
    alive: Weak<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct WatchRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates are single inserts or removes; a poisoned table is still whole.
    fn table(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign a fresh signature, or return the live one already held.
    pub fn claim(&self, identity: &SequenceIdentity) -> Result<Signature, Signature> {
        let mut entries = self.table();
        if let Some(entry) = entries.get(&identity.key) {
            if entry.alive.strong_count() > 0 {
                return Err(entry.signature.clone());
            }
            debug!("watch registry: stale entry for {} replaced", identity.key);
        }
        let signature = Signature::fresh();
        entries.insert(
            identity.key.clone(),
            Entry {
                signature: signature.clone(),
                alive: identity.alive.clone(),
            },
        );
        Ok(signature)
    }

    /// Drop the entry if it still carries `signature`.
    pub fn release(&self, identity: &SequenceIdentity, signature: &Signature) {
        let mut entries = self.table();
        if entries
            .get(&identity.key)
            .is_some_and(|e| &e.signature == signature)
        {
            entries.remove(&identity.key);
        }
    }

    pub fn signature_of(&self, identity: &SequenceIdentity) -> Option<Signature> {
        self.table()
            .get(&identity.key)
            .filter(|e| e.alive.strong_count() > 0)
            .map(|e| e.signature.clone())
    }

    /// Number of live entries; dead ones are pruned on the way.
    pub fn len(&self) -> usize {
        let mut entries = self.table();
        entries.retain(|_, e| e.alive.strong_count() > 0);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Arc<dyn Any + Send + Sync> {
        Arc::new(())
    }

    #[test]
    fn test_second_claim_returns_existing_signature() {
        let registry = WatchRegistry::new();
        let t = token();
        let id = SequenceIdentity::new("seq-1", &t);
        let first = registry.claim(&id).unwrap();
        assert_eq!(registry.claim(&id), Err(first.clone()));
        assert_eq!(registry.signature_of(&id), Some(first));
    }

    #[test]
    fn test_dead_token_frees_the_key() {
        let registry = WatchRegistry::new();
        let t = token();
        let id = SequenceIdentity::new("seq-1", &t);
        let first = registry.claim(&id).unwrap();
        drop(t);
        assert!(registry.is_empty());

        let t2 = token();
        let id2 = SequenceIdentity::new("seq-1", &t2);
        let second = registry.claim(&id2).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_release_only_matching_signature() {
        let registry = WatchRegistry::new();
        let t = token();
        let id = SequenceIdentity::new("k", &t);
        let sig = registry.claim(&id).unwrap();
        registry.release(&id, &Signature::fresh());
        assert_eq!(registry.len(), 1);
        registry.release(&id, &sig);
        assert!(registry.claim(&id).is_ok());
    }

    #[test]
    fn test_claim_after_panicking_holder_keeps_existing_signature() {
        let registry = WatchRegistry::new();
        let t = token();
        let id = SequenceIdentity::new("seq-1", &t);
        let first = registry.claim(&id).unwrap();

        let poisoned = std::thread::scope(|s| {
            s.spawn(|| {
                let _held = registry.entries.lock().unwrap();
                panic!("holder died");
            })
            .join()
        });
        assert!(poisoned.is_err());
        assert!(registry.entries.is_poisoned());

        assert_eq!(registry.claim(&id), Err(first.clone()));
        assert_eq!(registry.signature_of(&id), Some(first));
        assert_eq!(registry.len(), 1);
    }
}
