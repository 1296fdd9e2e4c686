//! Brick placement
//!
//! Given a snapshot of a cluster's devices and a seeded walk order, a
//! placer fills brick sets one by one: every slot must land on a device
//! whose node (and, when zone diversity is on, whose zone) is not
//! already used by the set, the device must have the free space, and an
//! optional caller-supplied filter can veto any pairing. A set is
//! placed whole or not at all.

pub mod arbiter;
pub mod sets;
pub mod standard;

pub use arbiter::ArbiterBrickPlacer;
pub use sets::{BrickSet, DeviceSet};
pub use standard::StandardBrickPlacer;

use crate::allocator::ClusterDeviceSource;
use crate::entities::{BrickEntry, DeviceEntry};
use crate::error::Result;

/// Parameters for one placement run
#[derive(Debug, Clone)]
pub struct PlacementOpts {
    /// Volume the bricks belong to; also the walk seed.
    pub volume_id: String,
    /// Size of each data brick in KiB.
    pub brick_size_kb: u64,
    /// Bricks per durability group.
    pub set_size: usize,
    /// Number of durability groups to place.
    pub set_count: usize,
    /// Divisor applied to the data brick size for arbiter slots.
    pub arbiter_discount_factor: u64,
    /// Require the bricks of a set to sit in pairwise distinct zones.
    pub zone_diverse: bool,
}

impl PlacementOpts {
    /// Size in KiB of the brick occupying the given slot.
    pub fn slot_size_kb(&self, arbiter_slot: bool) -> u64 {
        if arbiter_slot {
            (self.brick_size_kb / self.arbiter_discount_factor).max(1)
        } else {
            self.brick_size_kb
        }
    }
}

/// Caller veto over (set, device) pairings
pub type DeviceFilter<'a> = &'a dyn Fn(&BrickSet, &DeviceEntry) -> bool;

/// Result of a whole-volume placement run
#[derive(Debug, Clone)]
pub struct BrickAllocation {
    pub brick_sets: Vec<BrickSet>,
    pub device_sets: Vec<DeviceSet>,
}

impl BrickAllocation {
    /// All placed bricks in set order.
    pub fn bricks(&self) -> impl Iterator<Item = &BrickEntry> {
        self.brick_sets.iter().flat_map(|bs| bs.bricks.iter())
    }
}

/// Strategy for filling brick sets from a device walk
pub trait BrickPlacer {
    /// Place `set_count` full sets. Capacity is taken from the source
    /// snapshot; the caller persists or discards the snapshot.
    fn place_all(
        &self,
        source: &mut ClusterDeviceSource,
        opts: &PlacementOpts,
        filter: Option<DeviceFilter<'_>>,
    ) -> Result<BrickAllocation>;

    /// Place one replacement brick for the given slot of an existing
    /// set. The replacement must not share a node with any other brick
    /// of the set.
    fn replace(
        &self,
        source: &mut ClusterDeviceSource,
        opts: &PlacementOpts,
        filter: Option<DeviceFilter<'_>>,
        set: &BrickSet,
        index: usize,
    ) -> Result<BrickEntry>;
}
