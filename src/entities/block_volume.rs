//! Block volume entries
//!
//! An iSCSI-style volume carved out of the free space of a file volume
//! acting as its host. The target IQN only becomes known after the
//! remote create call succeeds.

use super::new_id;
use serde::{Deserialize, Serialize};

/// A block volume hosted inside a file volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockVolumeEntry {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    /// Requested size in GiB.
    pub size_gb: u64,
    /// Usable size in GiB reported by the storage system after create.
    pub usable_size_gb: u64,
    /// Volume hosting this block volume.
    pub hosting_volume_id: String,
    /// iSCSI target IQN, filled in at finalize time.
    pub iqn: Option<String>,
    /// Id of the pending operation that owns this entry, empty once
    /// the block volume is fully realized.
    pub pending_id: Option<String>,
}

impl BlockVolumeEntry {
    pub fn new(name: &str, size_gb: u64) -> BlockVolumeEntry {
        let id = new_id();
        let name = if name.is_empty() {
            format!("blockvol_{id}")
        } else {
            name.to_string()
        };
        BlockVolumeEntry {
            id,
            name,
            cluster_id: String::new(),
            size_gb,
            usable_size_gb: 0,
            hosting_volume_id: String::new(),
            iqn: None,
            pending_id: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending_id.is_some()
    }
}
