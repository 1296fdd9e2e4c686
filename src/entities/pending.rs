//! Pending operation ledger entries
//!
//! Every multi-step provisioning action records a durable ledger entry
//! describing which entities it is creating, deleting, or resizing.
//! The ledger and the entity pending tags are kept mutually consistent
//! within every committed transaction: an entity carries an operation's
//! id as its pending tag exactly when that operation holds an action
//! referencing the entity.

use super::block_volume::BlockVolumeEntry;
use super::brick::BrickEntry;
use super::device::DeviceEntry;
use super::new_id;
use super::volume::VolumeEntry;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    /// Created in this process lifetime and still being driven.
    New,
    /// Left over from a previous process lifetime.
    Stale,
    /// Abandoned after an unrecoverable failure.
    Failed,
}

/// Tag identifying which concrete operation a ledger entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOperationType {
    Unknown,
    CreateVolume,
    ExpandVolume,
    DeleteVolume,
    CreateBlockVolume,
    ExpandBlockVolume,
    DeleteBlockVolume,
    RemoveDevice,
    EvictBrick,
}

/// Kind of change one action applies to one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingChange {
    AddBrick,
    DeleteBrick,
    AddVolume,
    DeleteVolume,
    ExpandVolume,
    AddBlockVolume,
    DeleteBlockVolume,
    ExpandBlockVolume,
    RemoveDevice,
    /// Link to a child operation spawned by this one.
    ChildOperation,
    /// Reciprocal link from a child back to its parent.
    ParentOperation,
}

/// One (change kind, entity id, optional size delta) triple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub change: PendingChange,
    pub id: String,
    /// Size delta in GiB for expand actions.
    pub delta_gb: Option<u64>,
}

/// Durable record of one in-flight multi-step action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperationEntry {
    pub id: String,
    pub op_type: PendingOperationType,
    pub status: PendingStatus,
    /// Creation time, unix seconds.
    pub timestamp: i64,
    pub actions: Vec<PendingAction>,
}

impl PendingOperationEntry {
    pub fn new() -> PendingOperationEntry {
        PendingOperationEntry {
            id: new_id(),
            op_type: PendingOperationType::Unknown,
            status: PendingStatus::New,
            timestamp: chrono::Utc::now().timestamp(),
            actions: Vec::new(),
        }
    }

    fn record(&mut self, change: PendingChange, id: &str) {
        self.actions.push(PendingAction {
            change,
            id: id.to_string(),
            delta_gb: None,
        });
    }

    fn record_delta(&mut self, change: PendingChange, id: &str, delta_gb: u64) {
        self.actions.push(PendingAction {
            change,
            id: id.to_string(),
            delta_gb: Some(delta_gb),
        });
    }

    // =========================================================================
    // Volume actions
    // =========================================================================

    pub fn record_add_volume(&mut self, v: &mut VolumeEntry) {
        self.record(PendingChange::AddVolume, &v.id);
        self.op_type = PendingOperationType::CreateVolume;
        v.pending_id = Some(self.id.clone());
    }

    /// Track a file volume auto-provisioned to host a block volume.
    /// Unlike `record_add_volume` this does not change the operation
    /// type.
    pub fn record_add_hosting_volume(&mut self, v: &mut VolumeEntry) {
        self.record(PendingChange::AddVolume, &v.id);
        v.pending_id = Some(self.id.clone());
    }

    pub fn record_delete_volume(&mut self, v: &mut VolumeEntry) {
        self.record(PendingChange::DeleteVolume, &v.id);
        self.op_type = PendingOperationType::DeleteVolume;
        v.pending_id = Some(self.id.clone());
    }

    pub fn record_expand_volume(&mut self, v: &VolumeEntry, delta_gb: u64) {
        self.record_delta(PendingChange::ExpandVolume, &v.id, delta_gb);
        self.op_type = PendingOperationType::ExpandVolume;
    }

    pub fn finalize_volume(&self, v: &mut VolumeEntry) {
        v.pending_id = None;
    }

    // =========================================================================
    // Brick actions
    // =========================================================================

    pub fn record_add_brick(&mut self, b: &mut BrickEntry) {
        self.record(PendingChange::AddBrick, &b.id);
        b.pending_id = Some(self.id.clone());
    }

    pub fn record_delete_brick(&mut self, b: &mut BrickEntry) {
        self.record(PendingChange::DeleteBrick, &b.id);
        b.pending_id = Some(self.id.clone());
    }

    pub fn finalize_brick(&self, b: &mut BrickEntry) {
        b.pending_id = None;
    }

    // =========================================================================
    // Block volume actions
    // =========================================================================

    pub fn record_add_block_volume(&mut self, bv: &mut BlockVolumeEntry) {
        self.record(PendingChange::AddBlockVolume, &bv.id);
        self.op_type = PendingOperationType::CreateBlockVolume;
        bv.pending_id = Some(self.id.clone());
    }

    pub fn record_delete_block_volume(&mut self, bv: &mut BlockVolumeEntry) {
        self.record(PendingChange::DeleteBlockVolume, &bv.id);
        self.op_type = PendingOperationType::DeleteBlockVolume;
        bv.pending_id = Some(self.id.clone());
    }

    pub fn record_expand_block_volume(&mut self, bv: &BlockVolumeEntry, new_size_gb: u64) {
        self.record_delta(PendingChange::ExpandBlockVolume, &bv.id, new_size_gb);
        self.op_type = PendingOperationType::ExpandBlockVolume;
    }

    pub fn finalize_block_volume(&self, bv: &mut BlockVolumeEntry) {
        bv.pending_id = None;
    }

    // =========================================================================
    // Device actions
    // =========================================================================

    pub fn record_remove_device(&mut self, d: &DeviceEntry) {
        self.record(PendingChange::RemoveDevice, &d.id);
        self.op_type = PendingOperationType::RemoveDevice;
    }

    // =========================================================================
    // Parent / child links
    // =========================================================================

    /// Add or replace the child operation link on this entry and the
    /// reciprocal parent link on the child. Each side holds at most one
    /// link.
    pub fn record_child(&mut self, child: &mut PendingOperationEntry) {
        match find_change(&self.actions, PendingChange::ChildOperation) {
            Some(i) => self.actions[i].id = child.id.clone(),
            None => self.record(PendingChange::ChildOperation, &child.id.clone()),
        }
        match find_change(&child.actions, PendingChange::ParentOperation) {
            Some(i) => child.actions[i].id = self.id.clone(),
            None => {
                let id = self.id.clone();
                child.record(PendingChange::ParentOperation, &id);
            }
        }
    }

    /// Drop any child link from this entry.
    pub fn clear_child(&mut self) {
        self.actions
            .retain(|a| a.change != PendingChange::ChildOperation);
    }

    pub fn child_id(&self) -> Option<&str> {
        find_change(&self.actions, PendingChange::ChildOperation).map(|i| self.actions[i].id.as_str())
    }

    pub fn parent_id(&self) -> Option<&str> {
        find_change(&self.actions, PendingChange::ParentOperation)
            .map(|i| self.actions[i].id.as_str())
    }

    pub fn is_parent(&self) -> bool {
        self.child_id().is_some()
    }

    pub fn is_child(&self) -> bool {
        self.parent_id().is_some()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Ids of all bricks referenced by add or delete actions, in
    /// recording order.
    pub fn brick_ids(&self) -> Vec<String> {
        self.actions
            .iter()
            .filter(|a| {
                matches!(
                    a.change,
                    PendingChange::AddBrick | PendingChange::DeleteBrick
                )
            })
            .map(|a| a.id.clone())
            .collect()
    }

    /// Ids of all volumes referenced by add actions.
    pub fn added_volume_ids(&self) -> Vec<String> {
        self.actions
            .iter()
            .filter(|a| a.change == PendingChange::AddVolume)
            .map(|a| a.id.clone())
            .collect()
    }

    /// Size delta of the expand action held by this entry, if any.
    pub fn expand_delta_gb(&self) -> Option<u64> {
        self.actions
            .iter()
            .find(|a| {
                matches!(
                    a.change,
                    PendingChange::ExpandVolume | PendingChange::ExpandBlockVolume
                )
            })
            .and_then(|a| a.delta_gb)
    }

    /// The single entity id referenced by the given change kind, if any.
    pub fn id_for(&self, change: PendingChange) -> Option<&str> {
        find_change(&self.actions, change).map(|i| self.actions[i].id.as_str())
    }
}

impl Default for PendingOperationEntry {
    fn default() -> Self {
        Self::new()
    }
}

fn find_change(actions: &[PendingAction], change: PendingChange) -> Option<usize> {
    actions.iter().position(|a| a.change == change)
}
