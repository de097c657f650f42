//! Session registry
//!
//! Maps a local ufrag to the component that should adopt connections
//! carrying it. Values are `Weak`: the registry never keeps a component
//! alive, and looking up an entry whose component has been released is
//! indistinguishable from looking up an entry that was never registered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::agent::Component;

// ============================================================================
// Registry
// ============================================================================

/// Registry of ufrag -> component adoption targets.
pub struct UfragRegistry {
    entries: Mutex<HashMap<String, Weak<Component>>>,
}

impl UfragRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace the entry for a ufrag (last-register-wins).
    pub fn register(&self, ufrag: impl Into<String>, component: &Arc<Component>) {
        let ufrag = ufrag.into();
        log::debug!("registering component for ufrag '{}'", ufrag);
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .insert(ufrag, Arc::downgrade(component));
    }

    /// Resolve a ufrag to its component. Returns `None` both when the
    /// ufrag was never registered and when the component is gone.
    pub fn lookup(&self, ufrag: &str) -> Option<Arc<Component>> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(ufrag)
            .and_then(Weak::upgrade)
    }

    /// Drop the entry for a ufrag, if present.
    pub fn remove(&self, ufrag: &str) {
        self.entries.lock().expect("registry lock poisoned").remove(ufrag);
    }

    /// Number of entries, dead ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UfragRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
