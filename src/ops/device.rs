//! Device removal and brick eviction
//!
//! Removing a device means walking every brick it hosts and evicting
//! each one onto a replacement device. Each eviction is its own ledger
//! entry, linked as a child of the removal entry, so a crash mid-walk
//! leaves a precise record of which brick was in flight.

use super::{brick_manage_host, brick_spec, cluster_manage_hosts, CleanableOperation, Operation};
use crate::allocator::ClusterDeviceSource;
use crate::config::Config;
use crate::entities::{
    BrickEntry, EntryState, PendingChange, PendingOperationEntry, PendingOperationType,
};
use crate::error::{Error, Result};
use crate::executor::{try_on_hosts, Executor};
use crate::placer::{ArbiterBrickPlacer, BrickPlacer, BrickSet, PlacementOpts, StandardBrickPlacer};
use crate::store::{Db, Store};
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Brick Evict
// =============================================================================

pub struct BrickEvictOperation {
    store: Arc<Store>,
    config: Arc<Config>,
    brick_id: String,
    op_id: String,
    parent_op_id: Option<String>,
    new_brick_id: Option<String>,
}

/// The durability set a brick belongs to, with the brick's slot index.
fn brick_set_of(db: &Db, brick: &BrickEntry) -> Result<(BrickSet, usize)> {
    let vol = db.volume(&brick.volume_id)?;
    let set_size = vol.durability.bricks_in_set();
    let position = vol
        .bricks
        .iter()
        .position(|b| b == &brick.id)
        .ok_or_else(|| Error::Invariant(format!("brick {} missing from its volume", brick.id)))?;
    let start = position - position % set_size;
    let mut bs = BrickSet::new(set_size);
    for id in &vol.bricks[start..start + set_size] {
        bs.add(db.brick(id)?);
    }
    Ok((bs, position % set_size))
}

impl BrickEvictOperation {
    pub fn new(store: Arc<Store>, config: Arc<Config>, brick_id: &str) -> BrickEvictOperation {
        BrickEvictOperation {
            store,
            config,
            brick_id: brick_id.to_string(),
            op_id: PendingOperationEntry::new().id,
            parent_op_id: None,
            new_brick_id: None,
        }
    }

    fn as_child_of(store: Arc<Store>, config: Arc<Config>, brick_id: &str, parent: &str) -> BrickEvictOperation {
        let mut op = BrickEvictOperation::new(store, config, brick_id);
        op.parent_op_id = Some(parent.to_string());
        op
    }

    pub(super) fn load(
        store: Arc<Store>,
        config: Arc<Config>,
        entry: &PendingOperationEntry,
    ) -> Result<BrickEvictOperation> {
        let brick_id = entry
            .id_for(PendingChange::DeleteBrick)
            .ok_or_else(|| Error::NotLoadable {
                reason: format!("evict entry {} references no brick", entry.id),
            })?
            .to_string();
        Ok(BrickEvictOperation {
            store,
            config,
            brick_id,
            op_id: entry.id.clone(),
            parent_op_id: entry.parent_id().map(str::to_string),
            new_brick_id: entry.id_for(PendingChange::AddBrick).map(str::to_string),
        })
    }

    fn db_revert(&self) -> Result<()> {
        self.store.update(|db| {
            if let Some(new_id) = &self.new_brick_id {
                if let Ok(brick) = db.brick(new_id) {
                    let mut device = db.device(&brick.device_id)?;
                    device.brick_delete(&brick);
                    db.put_device(device);
                    db.delete_brick(new_id)?;
                }
            }
            if let Ok(mut old) = db.brick(&self.brick_id) {
                old.pending_id = None;
                db.put_brick(old);
            }
            if let Some(parent_id) = &self.parent_op_id {
                if let Ok(mut parent) = db.pending_op(parent_id) {
                    parent.clear_child();
                    db.put_pending_op(parent);
                }
            }
            if db.pending_op(&self.op_id).is_ok() {
                db.delete_pending_op(&self.op_id)?;
            }
            Ok(())
        })
    }

    async fn destroy_new_brick(&self, executor: &dyn Executor) -> Result<()> {
        let Some(new_id) = &self.new_brick_id else {
            return Ok(());
        };
        let found = self.store.view(|db| {
            let brick = match db.brick(new_id) {
                Ok(b) => b,
                Err(Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            Ok(Some((brick_manage_host(db, &brick)?, brick_spec(db, &brick)?)))
        })?;
        if let Some((host, spec)) = found {
            executor.brick_destroy(&host, &spec).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Operation for BrickEvictOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Evict Brick"
    }

    fn resource_url(&self) -> String {
        String::new()
    }

    fn max_retries(&self) -> u32 {
        self.config.op_retry_count
    }

    fn build(&mut self) -> Result<()> {
        let config = self.config.clone();
        let brick_id = self.brick_id.clone();
        let op_id = self.op_id.clone();
        let parent_op_id = self.parent_op_id.clone();
        let new_brick_id = self.store.update(move |db| {
            let mut old = db.brick(&brick_id)?;
            if old.is_pending() {
                return Err(Error::Conflict);
            }
            let vol = db.volume(&old.volume_id)?;
            if vol.is_pending() {
                return Err(Error::Conflict);
            }
            let (bs, index) = brick_set_of(db, &old)?;

            let mut source = ClusterDeviceSource::new(db, &vol.cluster_id)?;
            let placer: Box<dyn BrickPlacer> = if vol.durability.uses_arbiter() {
                Box::new(ArbiterBrickPlacer::new())
            } else {
                Box::new(StandardBrickPlacer::new())
            };
            let opts = PlacementOpts {
                volume_id: vol.id.clone(),
                brick_size_kb: old.size_kb,
                set_size: bs.set_size,
                set_count: 1,
                arbiter_discount_factor: config.arbiter_discount_factor,
                zone_diverse: config.strict_zone_checking,
            };
            let mut new_brick = placer.replace(&mut source, &opts, None, &bs, index)?;
            source.persist(db);

            let mut op = PendingOperationEntry::new();
            op.id = op_id;
            op.record_add_brick(&mut new_brick);
            op.record_delete_brick(&mut old);
            op.op_type = PendingOperationType::EvictBrick;
            if let Some(parent_id) = &parent_op_id {
                let mut parent = db.pending_op(parent_id)?;
                parent.record_child(&mut op);
                db.put_pending_op(parent);
            }
            let new_id = new_brick.id.clone();
            db.put_brick(new_brick);
            db.put_brick(old);
            db.put_pending_op(op);
            Ok(new_id)
        })?;
        self.new_brick_id = Some(new_brick_id);
        Ok(())
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        let new_id = self.new_brick_id.clone().ok_or_else(|| {
            Error::Invariant("evict executed before a replacement was placed".into())
        })?;
        let (hosts, vol_name, old_spec, new_spec, new_host) = self.store.view(|db| {
            let old = db.brick(&self.brick_id)?;
            let new = db.brick(&new_id)?;
            let vol = db.volume(&old.volume_id)?;
            Ok((
                cluster_manage_hosts(db, &vol.cluster_id)?,
                vol.name.clone(),
                brick_spec(db, &old)?,
                brick_spec(db, &new)?,
                brick_manage_host(db, &new)?,
            ))
        })?;

        executor
            .brick_create(&new_host, &new_spec)
            .await
            .map_err(Error::retry)?;
        try_on_hosts(hosts.clone(), |host| {
            let vol_name = vol_name.clone();
            let old_spec = old_spec.clone();
            let new_spec = new_spec.clone();
            async move {
                executor
                    .volume_replace_brick(&host, &vol_name, &old_spec, &new_spec)
                    .await
            }
        })
        .await
        .map_err(Error::retry)?;

        match try_on_hosts(hosts, |host| {
            let vol_name = vol_name.clone();
            async move { executor.heal_info(&host, &vol_name).await }
        })
        .await
        {
            Ok(heal) if heal.pending_entries > 0 => {
                tracing::info!(
                    volume = %vol_name,
                    pending = heal.pending_entries,
                    "self heal still catching up after brick replace"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(volume = %vol_name, error = %err, "heal status unavailable");
            }
        }
        Ok(())
    }

    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()> {
        self.destroy_new_brick(executor).await?;
        self.db_revert()
    }

    fn finalize(&mut self) -> Result<()> {
        let new_id = self.new_brick_id.clone().ok_or_else(|| {
            Error::Invariant("evict finalized before a replacement was placed".into())
        })?;
        self.store.update(|db| {
            let old = db.brick(&self.brick_id)?;
            let op = db.pending_op(&self.op_id)?;

            let mut vol = db.volume(&old.volume_id)?;
            if let Some(slot) = vol.bricks.iter().position(|b| b == &old.id) {
                vol.bricks[slot] = new_id.clone();
            }
            db.put_volume(vol);

            let mut new_brick = db.brick(&new_id)?;
            op.finalize_brick(&mut new_brick);
            db.put_brick(new_brick);

            let mut device = db.device(&old.device_id)?;
            device.brick_delete(&old);
            db.put_device(device);
            db.delete_brick(&old.id)?;

            if let Some(parent_id) = op.parent_id() {
                let mut parent = db.pending_op(parent_id)?;
                parent.clear_child();
                db.put_pending_op(parent);
            }
            db.delete_pending_op(&self.op_id)
        })
    }
}

#[async_trait]
impl CleanableOperation for BrickEvictOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Evict Brick"
    }

    async fn clean(&self, executor: &dyn Executor) -> Result<()> {
        self.destroy_new_brick(executor).await
    }

    fn clean_done(&self) -> Result<()> {
        self.db_revert()
    }
}

// =============================================================================
// Device Remove
// =============================================================================

pub struct DeviceRemoveOperation {
    store: Arc<Store>,
    config: Arc<Config>,
    device_id: String,
    op_id: String,
}

impl DeviceRemoveOperation {
    pub fn new(store: Arc<Store>, config: Arc<Config>, device_id: &str) -> DeviceRemoveOperation {
        DeviceRemoveOperation {
            store,
            config,
            device_id: device_id.to_string(),
            op_id: PendingOperationEntry::new().id,
        }
    }

    pub(super) fn load(
        store: Arc<Store>,
        config: Arc<Config>,
        entry: &PendingOperationEntry,
    ) -> Result<DeviceRemoveOperation> {
        let device_id = entry
            .id_for(PendingChange::RemoveDevice)
            .ok_or_else(|| Error::NotLoadable {
                reason: format!("remove entry {} references no device", entry.id),
            })?
            .to_string();
        Ok(DeviceRemoveOperation {
            store,
            config,
            device_id,
            op_id: entry.id.clone(),
        })
    }

    /// The in-flight child eviction recorded on this entry, if any.
    fn child_evict(&self) -> Result<Option<BrickEvictOperation>> {
        let child = self.store.view(|db| {
            let op = db.pending_op(&self.op_id)?;
            match op.child_id() {
                Some(child_id) => db.pending_op(child_id).map(Some),
                None => Ok(None),
            }
        })?;
        match child {
            Some(entry) => Ok(Some(BrickEvictOperation::load(
                self.store.clone(),
                self.config.clone(),
                &entry,
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Operation for DeviceRemoveOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Remove Device"
    }

    fn resource_url(&self) -> String {
        String::new()
    }

    fn build(&mut self) -> Result<()> {
        let device_id = self.device_id.clone();
        let op_id = self.op_id.clone();
        self.store.update(move |db| {
            let device = db.device(&device_id)?;
            if device.state == EntryState::Online {
                // bricks cannot be moved off a device still accepting
                // new ones
                return Err(Error::Conflict);
            }
            if db.pending_operations_on_device(&device_id) {
                return Err(Error::Conflict);
            }
            let mut op = PendingOperationEntry::new();
            op.id = op_id;
            op.record_remove_device(&device);
            db.put_pending_op(op);
            Ok(())
        })
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        loop {
            let next = self.store.view(|db| {
                Ok(db.device(&self.device_id)?.bricks.first().cloned())
            })?;
            let Some(brick_id) = next else {
                return Ok(());
            };
            tracing::info!(device = %self.device_id, brick = %brick_id, "evicting brick");
            let mut child = BrickEvictOperation::as_child_of(
                self.store.clone(),
                self.config.clone(),
                &brick_id,
                &self.op_id,
            );
            child.build()?;
            match child.exec(executor).await {
                Ok(()) => child.finalize()?,
                Err(err) => {
                    child.rollback(executor).await?;
                    return Err(err);
                }
            }
        }
    }

    async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
        // completed evictions stay; only the removal intent is dropped
        self.store.update(|db| {
            if db.pending_op(&self.op_id).is_ok() {
                db.delete_pending_op(&self.op_id)?;
            }
            Ok(())
        })
    }

    fn finalize(&mut self) -> Result<()> {
        self.store.update(|db| {
            let mut device = db.device(&self.device_id)?;
            if !device.bricks.is_empty() {
                return Err(Error::Invariant(format!(
                    "device {} still hosts bricks after removal",
                    device.id
                )));
            }
            device.state = EntryState::Failed;
            db.put_device(device);
            db.delete_pending_op(&self.op_id)
        })
    }
}

#[async_trait]
impl CleanableOperation for DeviceRemoveOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Remove Device"
    }

    async fn clean(&self, executor: &dyn Executor) -> Result<()> {
        if let Some(child) = self.child_evict()? {
            child.clean(executor).await?;
        }
        Ok(())
    }

    fn clean_done(&self) -> Result<()> {
        if let Some(child) = self.child_evict()? {
            child.clean_done()?;
        }
        self.store.update(|db| {
            if db.pending_op(&self.op_id).is_ok() {
                db.delete_pending_op(&self.op_id)?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GB;
    use crate::durability::Durability;
    use crate::entities::{ClusterEntry, DeviceEntry, NodeEntry, VolumeEntry};
    use crate::executor::MockExecutor;
    use crate::ops::tracker::OpTracker;
    use crate::ops::volume::VolumeCreateOperation;

    async fn fixture_with_volume() -> (Arc<Store>, Arc<Config>, String) {
        let store = Store::new();
        store
            .update(|db| {
                let mut cluster = ClusterEntry::new(true, true);
                for n in 0..4 {
                    let mut node = NodeEntry::new(
                        &cluster.id,
                        n,
                        &format!("manage{n}"),
                        &format!("storage{n}"),
                    );
                    let device = DeviceEntry::new(&node.id, "/dev/sdb", 600 * GB);
                    node.device_add(&device.id);
                    db.put_device(device);
                    cluster.node_add(&node.id);
                    db.put_node(node);
                }
                db.put_cluster(cluster);
                Ok(())
            })
            .unwrap();
        let config = Arc::new(Config::default());

        let vol = VolumeEntry::new(
            "",
            100,
            Durability::Replicate {
                replica: 3,
                arbiter: false,
            },
        );
        let vol_id = vol.id.clone();
        let tracker = OpTracker::new(8);
        let op = Box::new(VolumeCreateOperation::new(store.clone(), config.clone(), vol));
        crate::ops::run_operation(op, MockExecutor::new(), &tracker)
            .await
            .unwrap();
        (store, config, vol_id)
    }

    #[tokio::test]
    async fn test_evict_swaps_brick_in_place() {
        let (store, config, vol_id) = fixture_with_volume().await;
        let executor = MockExecutor::new();

        let (old_brick, slot) = store
            .view(|db| {
                let vol = db.volume(&vol_id)?;
                Ok((vol.bricks[1].clone(), 1))
            })
            .unwrap();

        let mut op = BrickEvictOperation::new(store.clone(), config, &old_brick);
        op.build().unwrap();
        op.exec(executor.as_ref()).await.unwrap();
        op.finalize().unwrap();

        store
            .view(|db| {
                let vol = db.volume(&vol_id)?;
                assert_ne!(vol.bricks[slot], old_brick);
                assert!(db.brick(&old_brick).is_err());
                let new_brick = db.brick(&vol.bricks[slot])?;
                assert!(!new_brick.is_pending());
                // replacement keeps the set node-diverse
                let nodes: std::collections::HashSet<String> = vol
                    .bricks
                    .iter()
                    .map(|b| db.brick(b).map(|br| br.node_id))
                    .collect::<Result<_>>()?;
                assert_eq!(nodes.len(), 3);
                assert!(db.pending_op_ids().is_empty());
                assert!(db.check_device_capacity().is_empty());
                Ok(())
            })
            .unwrap();
        assert_eq!(executor.calls_matching("volume_replace_brick").len(), 1);
    }

    #[tokio::test]
    async fn test_device_remove_drains_device() {
        let (store, config, _vol_id) = fixture_with_volume().await;
        let executor = MockExecutor::new();

        // pick a device that hosts a brick and take it offline
        let device_id = store
            .update(|db| {
                let id = db
                    .device_ids()
                    .into_iter()
                    .find(|id| !db.device(id).unwrap().bricks.is_empty())
                    .unwrap();
                let mut device = db.device(&id)?;
                device.state = EntryState::Offline;
                db.put_device(device);
                Ok(id)
            })
            .unwrap();

        let mut op = DeviceRemoveOperation::new(store.clone(), config, &device_id);
        op.build().unwrap();
        op.exec(executor.as_ref()).await.unwrap();
        op.finalize().unwrap();

        store
            .view(|db| {
                let device = db.device(&device_id)?;
                assert!(device.bricks.is_empty());
                assert_eq!(device.used_kb, 0);
                assert_eq!(device.state, EntryState::Failed);
                assert!(db.pending_op_ids().is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_device_remove_requires_offline() {
        let (store, config, _vol_id) = fixture_with_volume().await;
        let device_id = store.view(|db| Ok(db.device_ids()[0].clone())).unwrap();
        let mut op = DeviceRemoveOperation::new(store, config, &device_id);
        assert!(matches!(op.build().unwrap_err(), Error::Conflict));
    }

    #[tokio::test]
    async fn test_second_removal_of_same_device_conflicts() {
        let (store, config, _vol_id) = fixture_with_volume().await;
        let device_id = store
            .update(|db| {
                let id = db
                    .device_ids()
                    .into_iter()
                    .find(|id| !db.device(id).unwrap().bricks.is_empty())
                    .unwrap();
                let mut device = db.device(&id)?;
                device.state = EntryState::Offline;
                db.put_device(device);
                Ok(id)
            })
            .unwrap();

        let mut first = DeviceRemoveOperation::new(store.clone(), config.clone(), &device_id);
        first.build().unwrap();

        let mut second = DeviceRemoveOperation::new(store.clone(), config, &device_id);
        assert!(matches!(second.build().unwrap_err(), Error::Conflict));
        store
            .view(|db| {
                assert_eq!(db.pending_op_ids().len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_child_links_recorded_during_eviction() {
        let (store, config, _vol_id) = fixture_with_volume().await;

        let device_id = store
            .update(|db| {
                let id = db
                    .device_ids()
                    .into_iter()
                    .find(|id| !db.device(id).unwrap().bricks.is_empty())
                    .unwrap();
                let mut device = db.device(&id)?;
                device.state = EntryState::Offline;
                db.put_device(device);
                Ok(id)
            })
            .unwrap();
        let brick_id = store
            .view(|db| Ok(db.device(&device_id)?.bricks[0].clone()))
            .unwrap();

        let mut parent = DeviceRemoveOperation::new(store.clone(), config.clone(), &device_id);
        parent.build().unwrap();
        let mut child =
            BrickEvictOperation::as_child_of(store.clone(), config, &brick_id, &parent.op_id);
        child.build().unwrap();

        store
            .view(|db| {
                let parent_entry = db.pending_op(&parent.op_id)?;
                let child_entry = db.pending_op(&child.op_id)?;
                assert_eq!(parent_entry.child_id(), Some(child_entry.id.as_str()));
                assert_eq!(child_entry.parent_id(), Some(parent_entry.id.as_str()));
                Ok(())
            })
            .unwrap();

        // undoing the child clears the parent link
        child.db_revert().unwrap();
        store
            .view(|db| {
                assert!(!db.pending_op(&parent.op_id)?.is_parent());
                Ok(())
            })
            .unwrap();
    }
}
