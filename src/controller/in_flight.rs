//! In-process exclusion of overlapping passes for the same NodeSet
//!
//! The persisted Busy phase only survives as a crash-recovery hint; this set
//! is what actually keeps two passes for one instance from interleaving
//! inside a single controller process.

use std::sync::Arc;

use dashmap::DashSet;

/// Set of NodeSet keys (`namespace/name`) with a pass in progress
#[derive(Clone, Debug, Default)]
pub struct InFlight {
    keys: Arc<DashSet<String>>,
}

impl InFlight {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or return `None` if another pass already holds it
    pub fn try_acquire(&self, key: &str) -> Option<InFlightGuard> {
        if self.keys.insert(key.to_string()) {
            Some(InFlightGuard {
                keys: self.keys.clone(),
                key: key.to_string(),
            })
        } else {
            None
        }
    }

    /// Returns true if a pass currently holds `key`
    pub fn is_held(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

/// Releases its key when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    keys: Arc<DashSet<String>>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}
