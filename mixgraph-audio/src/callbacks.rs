use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use mixgraph_types::CallbackId;

use crate::backend::{BackendMessage, RawArg};

type Procedure = Box<dyn Fn(&BackendMessage) + Send + Sync>;

struct Entry {
    addr: String,
    prefix: Vec<RawArg>,
    procedure: Procedure,
}

impl Entry {
    fn matches(&self, message: &BackendMessage) -> bool {
        if message.addr != self.addr || message.args.len() < self.prefix.len() {
            return false;
        }
        self.prefix.iter().zip(&message.args).all(|(want, got)| match (want, got) {
            (RawArg::Str(a), RawArg::Str(b)) => a == b,
            _ => want.as_float().is_some() && want.as_float() == got.as_float(),
        })
    }
}

/// Handlers for unsolicited inbound messages, keyed by address plus a
/// leading-argument prefix (usually the replying node id).
pub struct CallbackRegistry {
    next_id: AtomicU32,
    entries: Mutex<BTreeMap<CallbackId, Entry>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(0),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<CallbackId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register<F>(&self, addr: &str, prefix: Vec<RawArg>, procedure: F) -> CallbackId
    where
        F: Fn(&BackendMessage) + Send + Sync + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().insert(
            id,
            Entry {
                addr: addr.to_string(),
                prefix,
                procedure: Box::new(procedure),
            },
        );
        id
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        self.entries().remove(&id).is_some()
    }

    /// Run every handler matching `message`. Returns how many ran.
    pub fn dispatch(&self, message: &BackendMessage) -> usize {
        let entries = self.entries();
        let mut count = 0;
        for entry in entries.values().filter(|e| e.matches(message)) {
            (entry.procedure)(message);
            count += 1;
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn dispatch_matches_address_and_prefix() {
        let registry = CallbackRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));
        let seen = hits.clone();
        registry.register("/levels", vec![RawArg::Int(1005)], move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });

        let hit = BackendMessage::new("/levels", vec![RawArg::Int(1005), RawArg::Int(-1), RawArg::Float(0.5)]);
        let miss = BackendMessage::new("/levels", vec![RawArg::Int(1006)]);
        assert_eq!(registry.dispatch(&hit), 1);
        assert_eq!(registry.dispatch(&miss), 0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unregister_removes_handler() {
        let registry = CallbackRegistry::new();
        let id = registry.register("/levels", vec![], |_| {});
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
    }
}
