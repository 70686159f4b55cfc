//! Per-type handler registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

/// Callback invoked with the whole frame object.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registration so it can be removed with
/// [`HandlerRegistry::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Handlers keyed by message type, kept in registration order.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.lock();
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(kind, list)| (kind.as_str(), list.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish_non_exhaustive()
    }
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handler` for `event_type`, after any existing ones.
    pub fn on(&self, event_type: &str, handler: Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    /// Removes one registration. Returns `false` if it was not found.
    pub fn off(&self, event_type: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(event_type) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event_type);
        }
        removed
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn count(&self, event_type: &str) -> usize {
        self.handlers.lock().get(event_type).map_or(0, Vec::len)
    }

    /// Invokes every handler for `event_type` in registration order.
    /// Returns how many ran.
    ///
    /// Handlers run outside the lock, so they may register or remove
    /// handlers themselves; such changes apply from the next frame on.
    pub fn dispatch(&self, event_type: &str, frame: &Value) -> usize {
        let snapshot: Vec<Handler> = self
            .handlers
            .lock()
            .get(event_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &snapshot {
            handler(frame);
        }
        snapshot.len()
    }
}
