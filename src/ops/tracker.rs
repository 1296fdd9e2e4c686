//! In-flight operation tracker
//!
//! Admission control for the operation engine: normal operations are
//! throttled once the configured limit of concurrently tracked ids is
//! reached, while cleanup runs bypass the limit but still register so
//! the same ledger entry is never driven twice.

use crate::entities::new_id;
use parking_lot::Mutex;
use std::collections::HashMap;

/// How a tracked id entered the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Client-driven operation, subject to the limit.
    Normal,
    /// Background cleanup, exempt from the limit.
    Clean,
}

#[derive(Debug)]
pub struct OpTracker {
    limit: usize,
    tracked: Mutex<HashMap<String, OpClass>>,
}

impl OpTracker {
    pub fn new(limit: usize) -> OpTracker {
        OpTracker {
            limit,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the id is throttled: already tracked, or a
    /// normal-class id arriving at the limit. False means the id is now
    /// tracked.
    pub fn throttle_or_add(&self, id: &str, class: OpClass) -> bool {
        let mut tracked = self.tracked.lock();
        if tracked.contains_key(id) {
            tracing::warn!(op = %id, "operation already tracked");
            return true;
        }
        if class == OpClass::Normal && tracked.len() >= self.limit {
            tracing::info!(op = %id, inflight = tracked.len(), "throttling operation");
            return true;
        }
        tracked.insert(id.to_string(), class);
        false
    }

    /// Admit an anonymous slot and return its token. Used by actions
    /// that need admission control but have no ledger entry.
    pub fn throttle_or_token(&self) -> Option<String> {
        let token = new_id();
        if self.throttle_or_add(&token, OpClass::Normal) {
            None
        } else {
            Some(token)
        }
    }

    pub fn remove(&self, id: &str) {
        self.tracked.lock().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracked.lock().contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.tracked.lock().len()
    }
}
