//! Device entries
//!
//! A device is one raw block device on a node. It tracks capacity
//! counters (`used + free == total` at all times) and the bricks it
//! currently hosts. Brick placement allocates space here before the
//! brick exists remotely.

use super::brick::BrickEntry;
use super::node::ArbiterSupport;
use super::{new_id, EntryState};
use serde::{Deserialize, Serialize};

/// A raw block device attached to a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub node_id: String,
    /// Device path or operator-assigned name.
    pub name: String,
    pub state: EntryState,
    /// Total capacity in KiB.
    pub total_kb: u64,
    /// Unallocated capacity in KiB.
    pub free_kb: u64,
    /// Allocated capacity in KiB.
    pub used_kb: u64,
    /// Bricks hosted on this device.
    pub bricks: Vec<String>,
    /// Arbiter eligibility override; unset means the node's setting
    /// applies.
    #[serde(default)]
    pub arbiter: Option<ArbiterSupport>,
}

impl DeviceEntry {
    pub fn new(node_id: &str, name: &str, total_kb: u64) -> DeviceEntry {
        DeviceEntry {
            id: new_id(),
            node_id: node_id.to_string(),
            name: name.to_string(),
            state: EntryState::Online,
            total_kb,
            free_kb: total_kb,
            used_kb: 0,
            bricks: Vec::new(),
            arbiter: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    /// Effective arbiter eligibility of this device given its node's
    /// setting.
    pub fn arbiter_support(&self, node_default: ArbiterSupport) -> ArbiterSupport {
        self.arbiter.unwrap_or(node_default)
    }

    /// Reserve capacity on this device. Callers must have checked the
    /// free space first.
    pub fn storage_allocate(&mut self, amount_kb: u64) {
        self.free_kb -= amount_kb;
        self.used_kb += amount_kb;
    }

    /// Return capacity to this device.
    pub fn storage_release(&mut self, amount_kb: u64) {
        self.free_kb += amount_kb;
        self.used_kb -= amount_kb;
    }

    /// Try to carve a new brick of the given size out of this device.
    /// Returns `None` when the device lacks the free space; on success
    /// the capacity counters and brick list are already updated.
    pub fn new_brick(&mut self, size_kb: u64, volume_id: &str) -> Option<BrickEntry> {
        if self.free_kb < size_kb {
            return None;
        }
        let brick = BrickEntry::new(&self.id, &self.node_id, volume_id, size_kb);
        self.storage_allocate(size_kb);
        self.bricks.push(brick.id.clone());
        Some(brick)
    }

    /// Remove a brick from this device, returning its capacity.
    pub fn brick_delete(&mut self, brick: &BrickEntry) {
        self.bricks.retain(|b| b != &brick.id);
        self.storage_release(brick.size_kb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GB;

    #[test]
    fn test_capacity_conservation() {
        let mut device = DeviceEntry::new("n1", "/dev/sdb", 100 * GB);
        let brick = device.new_brick(10 * GB, "v1").unwrap();
        assert_eq!(device.used_kb, 10 * GB);
        assert_eq!(device.free_kb, 90 * GB);
        assert_eq!(device.used_kb + device.free_kb, device.total_kb);
        assert_eq!(device.bricks, vec![brick.id.clone()]);

        device.brick_delete(&brick);
        assert_eq!(device.used_kb, 0);
        assert_eq!(device.free_kb, device.total_kb);
        assert!(device.bricks.is_empty());
    }

    #[test]
    fn test_arbiter_override_beats_node_default() {
        let mut device = DeviceEntry::new("n1", "/dev/sdb", 5 * GB);
        assert_eq!(
            device.arbiter_support(ArbiterSupport::Disabled),
            ArbiterSupport::Disabled
        );
        device.arbiter = Some(ArbiterSupport::Required);
        assert_eq!(
            device.arbiter_support(ArbiterSupport::Disabled),
            ArbiterSupport::Required
        );
    }

    #[test]
    fn test_new_brick_rejects_oversize() {
        let mut device = DeviceEntry::new("n1", "/dev/sdb", 5 * GB);
        assert!(device.new_brick(10 * GB, "v1").is_none());
        assert_eq!(device.free_kb, 5 * GB);
        assert!(device.bricks.is_empty());
    }
}
