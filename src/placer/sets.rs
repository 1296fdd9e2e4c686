//! Brick and device sets
//!
//! A brick set is one durability group: `set_size` bricks that the
//! storage layer replicates or disperses across. The paired device set
//! records which device each slot landed on, index for index.

use crate::entities::BrickEntry;

/// One durability group of bricks
#[derive(Debug, Clone)]
pub struct BrickSet {
    pub set_size: usize,
    pub bricks: Vec<BrickEntry>,
}

impl BrickSet {
    pub fn new(set_size: usize) -> BrickSet {
        BrickSet {
            set_size,
            bricks: Vec::with_capacity(set_size),
        }
    }

    pub fn add(&mut self, brick: BrickEntry) {
        debug_assert!(!self.full());
        self.bricks.push(brick);
    }

    /// Replace the brick at one slot, keeping slot order.
    pub fn insert(&mut self, index: usize, brick: BrickEntry) {
        self.bricks[index] = brick;
    }

    pub fn full(&self) -> bool {
        self.bricks.len() == self.set_size
    }

    /// True when any brick in the set lives on the given node.
    pub fn uses_node(&self, node_id: &str) -> bool {
        self.bricks.iter().any(|b| b.node_id == node_id)
    }
}

/// Devices backing one brick set, index for index
#[derive(Debug, Clone)]
pub struct DeviceSet {
    pub set_size: usize,
    pub devices: Vec<String>,
}

impl DeviceSet {
    pub fn new(set_size: usize) -> DeviceSet {
        DeviceSet {
            set_size,
            devices: Vec::with_capacity(set_size),
        }
    }

    pub fn add(&mut self, device_id: &str) {
        debug_assert!(!self.full());
        self.devices.push(device_id.to_string());
    }

    pub fn insert(&mut self, index: usize, device_id: &str) {
        self.devices[index] = device_id.to_string();
    }

    pub fn full(&self) -> bool {
        self.devices.len() == self.set_size
    }
}
