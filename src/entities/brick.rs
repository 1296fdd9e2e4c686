//! Brick entries
//!
//! A brick is the unit of storage capacity carved out of one device and
//! assigned to one volume. The pending tag links a brick awaiting
//! creation or deletion to the operation driving it.

use super::new_id;
use serde::{Deserialize, Serialize};

/// A brick hosted on a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrickEntry {
    pub id: String,
    pub device_id: String,
    pub node_id: String,
    /// Volume this brick belongs to.
    pub volume_id: String,
    /// Size in KiB.
    pub size_kb: u64,
    /// Id of the pending operation that owns this brick, empty once the
    /// brick is fully realized.
    pub pending_id: Option<String>,
}

impl BrickEntry {
    pub fn new(device_id: &str, node_id: &str, volume_id: &str, size_kb: u64) -> BrickEntry {
        BrickEntry {
            id: new_id(),
            device_id: device_id.to_string(),
            node_id: node_id.to_string(),
            volume_id: volume_id.to_string(),
            size_kb,
            pending_id: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_id.is_some()
    }
}
