//! Transactional entity store
//!
//! Wraps the embedded persistence mechanism's transaction API: all
//! reads happen through `view` and all mutation through `update`.
//! `update` hands the closure a working copy of the database and
//! commits it only when the closure succeeds, so a failed build leaves
//! no partial allocation behind. Writers are serialized; readers share
//! a lock.

use crate::entities::{
    BlockVolumeEntry, BrickEntry, ClusterEntry, DeviceEntry, NodeEntry, PendingChange,
    PendingOperationEntry, PendingStatus, VolumeEntry,
};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Database Snapshot
// =============================================================================

/// All entity collections, as seen by one transaction
#[derive(Debug, Clone, Default)]
pub struct Db {
    clusters: BTreeMap<String, ClusterEntry>,
    nodes: BTreeMap<String, NodeEntry>,
    devices: BTreeMap<String, DeviceEntry>,
    bricks: BTreeMap<String, BrickEntry>,
    volumes: BTreeMap<String, VolumeEntry>,
    block_volumes: BTreeMap<String, BlockVolumeEntry>,
    pending_ops: BTreeMap<String, PendingOperationEntry>,
}

macro_rules! collection {
    ($get:ident, $put:ident, $delete:ident, $ids:ident, $iter:ident, $field:ident, $ty:ty) => {
        pub fn $get(&self, id: &str) -> Result<$ty> {
            self.$field
                .get(id)
                .cloned()
                .ok_or_else(|| Error::not_found(id))
        }

        pub fn $put(&mut self, entry: $ty) {
            self.$field.insert(entry.id.clone(), entry);
        }

        pub fn $delete(&mut self, id: &str) -> Result<()> {
            self.$field
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(id))
        }

        pub fn $ids(&self) -> Vec<String> {
            self.$field.keys().cloned().collect()
        }

        pub fn $iter(&self) -> impl Iterator<Item = &$ty> {
            self.$field.values()
        }
    };
}

impl Db {
    collection!(cluster, put_cluster, delete_cluster, cluster_ids, clusters, clusters, ClusterEntry);
    collection!(node, put_node, delete_node, node_ids, nodes, nodes, NodeEntry);
    collection!(device, put_device, delete_device, device_ids, devices, devices, DeviceEntry);
    collection!(brick, put_brick, delete_brick, brick_ids, bricks, bricks, BrickEntry);
    collection!(volume, put_volume, delete_volume, volume_ids, volumes, volumes, VolumeEntry);
    collection!(
        block_volume,
        put_block_volume,
        delete_block_volume,
        block_volume_ids,
        block_volumes,
        block_volumes,
        BlockVolumeEntry
    );
    collection!(
        pending_op,
        put_pending_op,
        delete_pending_op,
        pending_op_ids,
        pending_ops,
        pending_ops,
        PendingOperationEntry
    );

    // =========================================================================
    // Ledger Queries
    // =========================================================================

    /// True if any ledger entry touches the given device: either a
    /// device-removal action on it or a brick action on one of its
    /// bricks.
    pub fn pending_operations_on_device(&self, device_id: &str) -> bool {
        self.pending_ops.values().any(|op| {
            op.actions.iter().any(|a| match a.change {
                PendingChange::RemoveDevice => a.id == device_id,
                PendingChange::AddBrick | PendingChange::DeleteBrick => self
                    .bricks
                    .get(&a.id)
                    .is_some_and(|b| b.device_id == device_id),
                _ => false,
            })
        })
    }

    /// Mark every ledger entry stale. Called once at startup so that
    /// operations interrupted by a crash become eligible for cleanup.
    pub fn mark_pending_operations_stale(&mut self) {
        for op in self.pending_ops.values_mut() {
            if op.status != PendingStatus::Stale {
                op.status = PendingStatus::Stale;
            }
        }
    }

    /// Count ledger entries by status.
    pub fn pending_status_counts(&self) -> BTreeMap<PendingStatus, usize> {
        let mut counts = BTreeMap::new();
        for op in self.pending_ops.values() {
            *counts.entry(op.status).or_insert(0) += 1;
        }
        counts
    }

    /// All ledger entries matching the selection predicate.
    pub fn pending_selection(
        &self,
        sel: impl Fn(&PendingOperationEntry) -> bool,
    ) -> Vec<PendingOperationEntry> {
        self.pending_ops
            .values()
            .filter(|op| sel(op))
            .cloned()
            .collect()
    }

    // =========================================================================
    // Consistency
    // =========================================================================

    /// Verify that entity pending tags and ledger actions are mutually
    /// consistent. Returns a description of every violation found.
    pub fn check_pending_consistency(&self) -> Vec<String> {
        let mut problems = Vec::new();

        // ledger -> entity direction
        for op in self.pending_ops.values() {
            for action in &op.actions {
                let tagged = match action.change {
                    PendingChange::AddBrick | PendingChange::DeleteBrick => self
                        .bricks
                        .get(&action.id)
                        .map(|b| b.pending_id.as_deref() == Some(op.id.as_str())),
                    PendingChange::AddVolume | PendingChange::DeleteVolume => self
                        .volumes
                        .get(&action.id)
                        .map(|v| v.pending_id.as_deref() == Some(op.id.as_str())),
                    PendingChange::AddBlockVolume | PendingChange::DeleteBlockVolume => self
                        .block_volumes
                        .get(&action.id)
                        .map(|bv| bv.pending_id.as_deref() == Some(op.id.as_str())),
                    // expands, device removal, and op links do not tag
                    _ => continue,
                };
                match tagged {
                    Some(true) => {}
                    Some(false) => problems.push(format!(
                        "pending op {}: entity {} does not carry its tag",
                        op.id, action.id
                    )),
                    None => problems.push(format!(
                        "pending op {}: referenced entity {} missing",
                        op.id, action.id
                    )),
                }
            }
        }

        // entity -> ledger direction
        let tag_known = |pending_id: &Option<String>, entity: &str| -> Option<String> {
            pending_id.as_ref().and_then(|pid| {
                if self.pending_ops.contains_key(pid) {
                    None
                } else {
                    Some(format!("{entity} tagged by unknown pending op {pid}"))
                }
            })
        };
        for b in self.bricks.values() {
            problems.extend(tag_known(&b.pending_id, &format!("brick {}", b.id)));
        }
        for v in self.volumes.values() {
            problems.extend(tag_known(&v.pending_id, &format!("volume {}", v.id)));
        }
        for bv in self.block_volumes.values() {
            problems.extend(tag_known(&bv.pending_id, &format!("block volume {}", bv.id)));
        }

        problems
    }

    /// Verify the device capacity counter invariant on all devices.
    pub fn check_device_capacity(&self) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.used_kb + d.free_kb != d.total_kb)
            .map(|d| {
                format!(
                    "device {}: used {} + free {} != total {}",
                    d.id, d.used_kb, d.free_kb, d.total_kb
                )
            })
            .collect()
    }
}

// =============================================================================
// Store
// =============================================================================

/// Handle to the shared, transactionally-updated database
pub struct Store {
    db: RwLock<Db>,
}

impl Store {
    pub fn new() -> Arc<Store> {
        Arc::new(Store {
            db: RwLock::new(Db::default()),
        })
    }

    /// Run a read-only transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Db) -> Result<T>) -> Result<T> {
        let db = self.db.read();
        f(&db)
    }

    /// Run a read-write transaction. The closure operates on a working
    /// copy which replaces the database only on success; on error every
    /// change made by the closure is discarded.
    pub fn update<T>(&self, f: impl FnOnce(&mut Db) -> Result<T>) -> Result<T> {
        let mut db = self.db.write();
        let mut work = db.clone();
        let out = f(&mut work)?;
        *db = work;
        Ok(out)
    }
}
