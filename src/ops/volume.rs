//! Volume operations
//!
//! Create, expand, and delete for file volumes. Build records pending
//! entities and capacity in one transaction, exec performs the remote
//! work, finalize retires the ledger entry. Each operation also knows
//! how to clean itself up when found stale after a crash.

use super::allocate::{allocate_bricks_in_cluster, allocate_volume, release_volume_bricks};
use super::{
    cluster_manage_hosts, create_bricks, destroy_bricks, volume_request, CleanableOperation,
    Operation,
};
use crate::config::Config;
use crate::entities::{PendingOperationEntry, VolumeEntry};
use crate::error::{Error, Result};
use crate::executor::{try_on_hosts, Executor};
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;

// =============================================================================
// Create
// =============================================================================

pub struct VolumeCreateOperation {
    store: Arc<Store>,
    config: Arc<Config>,
    /// Pristine volume template; build works on a copy so the retry
    /// cycle can rebuild from scratch.
    vol: VolumeEntry,
    op_id: String,
}

impl VolumeCreateOperation {
    pub fn new(store: Arc<Store>, config: Arc<Config>, vol: VolumeEntry) -> VolumeCreateOperation {
        let op_id = PendingOperationEntry::new().id;
        VolumeCreateOperation {
            store,
            config,
            vol,
            op_id,
        }
    }

    pub(super) fn load(
        store: Arc<Store>,
        config: Arc<Config>,
        entry: &PendingOperationEntry,
    ) -> Result<VolumeCreateOperation> {
        let vol_id = entry
            .added_volume_ids()
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotLoadable {
                reason: format!("create entry {} references no volume", entry.id),
            })?;
        let vol = store.view(|db| db.volume(&vol_id))?;
        Ok(VolumeCreateOperation {
            store,
            config,
            vol,
            op_id: entry.id.clone(),
        })
    }

    /// Remove the volume and its bricks from the remote hosts, in
    /// whatever partial state exec left them.
    async fn remote_teardown(&self, executor: &dyn Executor) -> Result<()> {
        let state = self.store.view(|db| {
            let vol = match db.volume(&self.vol.id) {
                Ok(v) => v,
                Err(Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            let hosts = cluster_manage_hosts(db, &vol.cluster_id)?;
            Ok(Some((vol.name.clone(), vol.bricks.clone(), hosts)))
        })?;
        let Some((name, brick_ids, hosts)) = state else {
            return Ok(());
        };
        let destroy = try_on_hosts(hosts, |host| {
            let name = name.clone();
            async move { executor.volume_destroy(&host, &name).await }
        })
        .await;
        if let Err(err) = destroy {
            tracing::warn!(volume = %self.vol.id, error = %err, "remote volume teardown failed");
        }
        destroy_bricks(&self.store, executor, &brick_ids).await
    }

    /// Revert the store to its pre-build shape.
    fn db_revert(&self) -> Result<()> {
        self.store.update(|db| {
            if let Ok(vol) = db.volume(&self.vol.id) {
                release_volume_bricks(db, &vol)?;
                if let Ok(mut cluster) = db.cluster(&vol.cluster_id) {
                    cluster.volume_delete(&vol.id);
                    db.put_cluster(cluster);
                }
                db.delete_volume(&vol.id)?;
            }
            if db.pending_op(&self.op_id).is_ok() {
                db.delete_pending_op(&self.op_id)?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Operation for VolumeCreateOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Create Volume"
    }

    fn resource_url(&self) -> String {
        format!("/volumes/{}", self.vol.id)
    }

    fn max_retries(&self) -> u32 {
        self.config.op_retry_count
    }

    fn build(&mut self) -> Result<()> {
        let config = self.config.clone();
        let template = self.vol.clone();
        let op_id = self.op_id.clone();
        self.store.update(move |db| {
            let mut vol = template;
            vol.durability.set_defaults(&config);
            if vol.size_gb == 0 {
                return Err(Error::Configuration("volume size must be positive".into()));
            }
            let block_workload = vol.block_info.is_some();
            let mut op = PendingOperationEntry::new();
            op.id = op_id;
            op.record_add_volume(&mut vol);
            allocate_volume(db, &config, &mut vol, &mut op, block_workload)?;
            db.put_volume(vol);
            db.put_pending_op(op);
            Ok(())
        })
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        let (brick_ids, hosts, req) = self.store.view(|db| {
            let vol = db.volume(&self.vol.id)?;
            Ok((
                vol.bricks.clone(),
                cluster_manage_hosts(db, &vol.cluster_id)?,
                volume_request(db, &vol.id, &vol.bricks)?,
            ))
        })?;
        create_bricks(&self.store, executor, &brick_ids).await?;
        try_on_hosts(hosts, |host| {
            let req = &req;
            async move { executor.volume_create(&host, req).await }
        })
        .await
        .map_err(Error::retry)?;
        Ok(())
    }

    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()> {
        self.remote_teardown(executor).await?;
        self.db_revert()
    }

    fn finalize(&mut self) -> Result<()> {
        self.store.update(|db| {
            let mut vol = db.volume(&self.vol.id)?;
            let op = db.pending_op(&self.op_id)?;
            for brick_id in &vol.bricks {
                let mut brick = db.brick(brick_id)?;
                op.finalize_brick(&mut brick);
                db.put_brick(brick);
            }
            op.finalize_volume(&mut vol);
            db.put_volume(vol);
            db.delete_pending_op(&self.op_id)
        })
    }
}

#[async_trait]
impl CleanableOperation for VolumeCreateOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Create Volume"
    }

    async fn clean(&self, executor: &dyn Executor) -> Result<()> {
        self.remote_teardown(executor).await
    }

    fn clean_done(&self) -> Result<()> {
        self.db_revert()
    }
}

// =============================================================================
// Expand
// =============================================================================

pub struct VolumeExpandOperation {
    store: Arc<Store>,
    config: Arc<Config>,
    vol_id: String,
    delta_gb: u64,
    op_id: String,
    new_brick_ids: Vec<String>,
}

impl VolumeExpandOperation {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        vol_id: &str,
        delta_gb: u64,
    ) -> VolumeExpandOperation {
        VolumeExpandOperation {
            store,
            config,
            vol_id: vol_id.to_string(),
            delta_gb,
            op_id: PendingOperationEntry::new().id,
            new_brick_ids: Vec::new(),
        }
    }

    pub(super) fn load(
        store: Arc<Store>,
        config: Arc<Config>,
        entry: &PendingOperationEntry,
    ) -> Result<VolumeExpandOperation> {
        let vol_id = entry
            .id_for(crate::entities::PendingChange::ExpandVolume)
            .ok_or_else(|| Error::NotLoadable {
                reason: format!("expand entry {} references no volume", entry.id),
            })?
            .to_string();
        let delta_gb = entry.expand_delta_gb().unwrap_or(0);
        Ok(VolumeExpandOperation {
            store,
            config,
            vol_id,
            delta_gb,
            op_id: entry.id.clone(),
            new_brick_ids: entry.brick_ids(),
        })
    }

    fn db_revert(&self) -> Result<()> {
        self.store.update(|db| {
            for brick_id in &self.new_brick_ids {
                let brick = match db.brick(brick_id) {
                    Ok(b) => b,
                    Err(Error::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                };
                let mut device = db.device(&brick.device_id)?;
                device.brick_delete(&brick);
                db.put_device(device);
                if let Ok(mut vol) = db.volume(&self.vol_id) {
                    vol.brick_delete(brick_id);
                    db.put_volume(vol);
                }
                db.delete_brick(brick_id)?;
            }
            if db.pending_op(&self.op_id).is_ok() {
                db.delete_pending_op(&self.op_id)?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Operation for VolumeExpandOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Expand Volume"
    }

    fn resource_url(&self) -> String {
        format!("/volumes/{}", self.vol_id)
    }

    fn max_retries(&self) -> u32 {
        self.config.op_retry_count
    }

    fn build(&mut self) -> Result<()> {
        let config = self.config.clone();
        let vol_id = self.vol_id.clone();
        let delta_gb = self.delta_gb;
        let op_id = self.op_id.clone();
        let new_bricks = self.store.update(move |db| {
            let mut vol = db.volume(&vol_id)?;
            if vol.is_pending() {
                return Err(Error::Conflict);
            }
            if delta_gb == 0 {
                return Err(Error::Configuration("expansion size must be positive".into()));
            }
            let mut op = PendingOperationEntry::new();
            op.id = op_id;
            op.record_expand_volume(&vol, delta_gb);
            let before = vol.bricks.len();
            let cluster_id = vol.cluster_id.clone();
            allocate_bricks_in_cluster(db, &config, &cluster_id, &mut vol, delta_gb, &mut op)?;
            let new_bricks = vol.bricks[before..].to_vec();
            db.put_volume(vol);
            db.put_pending_op(op);
            Ok(new_bricks)
        })?;
        self.new_brick_ids = new_bricks;
        Ok(())
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        let (hosts, req) = self.store.view(|db| {
            let vol = db.volume(&self.vol_id)?;
            Ok((
                cluster_manage_hosts(db, &vol.cluster_id)?,
                volume_request(db, &vol.id, &self.new_brick_ids)?,
            ))
        })?;
        create_bricks(&self.store, executor, &self.new_brick_ids).await?;
        try_on_hosts(hosts, |host| {
            let req = &req;
            async move { executor.volume_expand(&host, req).await }
        })
        .await
        .map_err(Error::retry)?;
        Ok(())
    }

    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()> {
        destroy_bricks(&self.store, executor, &self.new_brick_ids).await?;
        self.db_revert()
    }

    fn finalize(&mut self) -> Result<()> {
        self.store.update(|db| {
            let mut vol = db.volume(&self.vol_id)?;
            let op = db.pending_op(&self.op_id)?;
            for brick_id in &self.new_brick_ids {
                let mut brick = db.brick(brick_id)?;
                op.finalize_brick(&mut brick);
                db.put_brick(brick);
            }
            vol.size_gb += self.delta_gb;
            db.put_volume(vol);
            db.delete_pending_op(&self.op_id)
        })
    }
}

#[async_trait]
impl CleanableOperation for VolumeExpandOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Expand Volume"
    }

    async fn clean(&self, executor: &dyn Executor) -> Result<()> {
        destroy_bricks(&self.store, executor, &self.new_brick_ids).await
    }

    fn clean_done(&self) -> Result<()> {
        self.db_revert()
    }
}

// =============================================================================
// Delete
// =============================================================================

pub struct VolumeDeleteOperation {
    store: Arc<Store>,
    config: Arc<Config>,
    vol_id: String,
    op_id: String,
}

impl VolumeDeleteOperation {
    pub fn new(store: Arc<Store>, config: Arc<Config>, vol_id: &str) -> VolumeDeleteOperation {
        VolumeDeleteOperation {
            store,
            config,
            vol_id: vol_id.to_string(),
            op_id: PendingOperationEntry::new().id,
        }
    }

    pub(super) fn load(
        store: Arc<Store>,
        config: Arc<Config>,
        entry: &PendingOperationEntry,
    ) -> Result<VolumeDeleteOperation> {
        let vol_id = entry
            .id_for(crate::entities::PendingChange::DeleteVolume)
            .ok_or_else(|| Error::NotLoadable {
                reason: format!("delete entry {} references no volume", entry.id),
            })?
            .to_string();
        Ok(VolumeDeleteOperation {
            store,
            config,
            vol_id,
            op_id: entry.id.clone(),
        })
    }

    async fn remote_teardown(&self, executor: &dyn Executor) -> Result<()> {
        let (name, brick_ids, hosts) = self.store.view(|db| {
            let vol = db.volume(&self.vol_id)?;
            Ok((
                vol.name.clone(),
                vol.bricks.clone(),
                cluster_manage_hosts(db, &vol.cluster_id)?,
            ))
        })?;
        try_on_hosts(hosts, |host| {
            let name = name.clone();
            async move { executor.volume_destroy(&host, &name).await }
        })
        .await
        .map_err(Error::retry)?;
        destroy_bricks(&self.store, executor, &brick_ids).await
    }

    /// Complete the deletion in the store.
    fn db_complete(&self) -> Result<()> {
        self.store.update(|db| {
            let vol = db.volume(&self.vol_id)?;
            release_volume_bricks(db, &vol)?;
            let mut cluster = db.cluster(&vol.cluster_id)?;
            cluster.volume_delete(&vol.id);
            db.put_cluster(cluster);
            db.delete_volume(&vol.id)?;
            db.delete_pending_op(&self.op_id)
        })
    }
}

#[async_trait]
impl Operation for VolumeDeleteOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Delete Volume"
    }

    fn resource_url(&self) -> String {
        String::new()
    }

    fn max_retries(&self) -> u32 {
        self.config.op_retry_count
    }

    fn build(&mut self) -> Result<()> {
        let vol_id = self.vol_id.clone();
        let op_id = self.op_id.clone();
        self.store.update(move |db| {
            let mut vol = db.volume(&vol_id)?;
            if vol.is_pending() {
                return Err(Error::Conflict);
            }
            if let Some(info) = &vol.block_info {
                if !info.block_volumes.is_empty() {
                    return Err(Error::Conflict);
                }
            }
            let mut op = PendingOperationEntry::new();
            op.id = op_id;
            op.record_delete_volume(&mut vol);
            for brick_id in vol.bricks.clone() {
                let mut brick = db.brick(&brick_id)?;
                op.record_delete_brick(&mut brick);
                db.put_brick(brick);
            }
            db.put_volume(vol);
            db.put_pending_op(op);
            Ok(())
        })
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        self.remote_teardown(executor).await
    }

    async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
        // Deletion failed partway: the entities stay, only the pending
        // markings are taken back.
        self.store.update(|db| {
            let mut vol = db.volume(&self.vol_id)?;
            let op = db.pending_op(&self.op_id)?;
            for brick_id in vol.bricks.clone() {
                let mut brick = db.brick(&brick_id)?;
                op.finalize_brick(&mut brick);
                db.put_brick(brick);
            }
            op.finalize_volume(&mut vol);
            db.put_volume(vol);
            db.delete_pending_op(&self.op_id)
        })
    }

    fn finalize(&mut self) -> Result<()> {
        self.db_complete()
    }
}

#[async_trait]
impl CleanableOperation for VolumeDeleteOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Delete Volume"
    }

    /// A found-again delete is driven forward, not undone.
    async fn clean(&self, executor: &dyn Executor) -> Result<()> {
        self.remote_teardown(executor).await.map_err(Error::original)
    }

    fn clean_done(&self) -> Result<()> {
        self.db_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GB;
    use crate::durability::Durability;
    use crate::entities::{ClusterEntry, DeviceEntry, NodeEntry, PendingStatus};
    use crate::executor::MockExecutor;
    use crate::ops::tracker::OpTracker;
    use crate::store::Db;

    fn seed_cluster(db: &mut Db, nodes: usize, device_kb: u64) -> String {
        let mut cluster = ClusterEntry::new(true, true);
        for n in 0..nodes {
            let mut node = NodeEntry::new(
                &cluster.id,
                n as u32,
                &format!("manage{n}"),
                &format!("storage{n}"),
            );
            let device = DeviceEntry::new(&node.id, "/dev/sdb", device_kb);
            node.device_add(&device.id);
            db.put_device(device);
            cluster.node_add(&node.id);
            db.put_node(node);
        }
        let id = cluster.id.clone();
        db.put_cluster(cluster);
        id
    }

    fn fixture() -> (Arc<Store>, Arc<Config>) {
        let store = Store::new();
        store
            .update(|db| {
                seed_cluster(db, 3, 600 * GB);
                Ok(())
            })
            .unwrap();
        (store, Arc::new(Config::default()))
    }

    fn replica3(size_gb: u64) -> VolumeEntry {
        VolumeEntry::new(
            "",
            size_gb,
            Durability::Replicate {
                replica: 3,
                arbiter: false,
            },
        )
    }

    #[tokio::test]
    async fn test_create_lifecycle() {
        let (store, config) = fixture();
        let executor = MockExecutor::new();
        let tracker = OpTracker::new(8);

        let vol = replica3(100);
        let vol_id = vol.id.clone();
        let op = Box::new(VolumeCreateOperation::new(store.clone(), config, vol));
        let url = crate::ops::run_operation(op, executor.clone(), &tracker)
            .await
            .unwrap();
        assert_eq!(url, format!("/volumes/{vol_id}"));

        store
            .view(|db| {
                assert!(db.pending_op_ids().is_empty());
                let vol = db.volume(&vol_id)?;
                assert!(!vol.is_pending());
                assert_eq!(vol.bricks.len(), 3);
                for id in &vol.bricks {
                    assert!(!db.brick(id)?.is_pending());
                }
                assert!(db.check_device_capacity().is_empty());
                Ok(())
            })
            .unwrap();
        assert_eq!(executor.calls_matching("brick_create").len(), 3);
        assert_eq!(executor.calls_matching("volume_create").len(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back_everything() {
        let (store, config) = fixture();
        let executor = MockExecutor::new();
        MockExecutor::set_hook(&executor.on_volume_create, |host| {
            Err(Error::Executor {
                host: host.to_string(),
                reason: "daemon down".into(),
            })
        });
        let config = Arc::new(Config {
            op_retry_count: 1,
            ..(*config).clone()
        });
        let tracker = OpTracker::new(8);

        let op = Box::new(VolumeCreateOperation::new(
            store.clone(),
            config,
            replica3(100),
        ));
        let err = crate::ops::run_operation(op, executor, &tracker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AllHostsFailed(_)));

        store
            .view(|db| {
                assert!(db.volume_ids().is_empty());
                assert!(db.brick_ids().is_empty());
                assert!(db.pending_op_ids().is_empty());
                for id in db.device_ids() {
                    assert_eq!(db.device(&id)?.used_kb, 0);
                }
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_expand_adds_bricks_and_size() {
        let (store, config) = fixture();
        let executor = MockExecutor::new();
        let tracker = OpTracker::new(8);

        let vol = replica3(100);
        let vol_id = vol.id.clone();
        let op = Box::new(VolumeCreateOperation::new(
            store.clone(),
            config.clone(),
            vol,
        ));
        crate::ops::run_operation(op, executor.clone(), &tracker)
            .await
            .unwrap();

        let op = Box::new(VolumeExpandOperation::new(
            store.clone(),
            config,
            &vol_id,
            50,
        ));
        crate::ops::run_operation(op, executor, &tracker)
            .await
            .unwrap();

        store
            .view(|db| {
                let vol = db.volume(&vol_id)?;
                assert_eq!(vol.size_gb, 150);
                assert_eq!(vol.bricks.len(), 6);
                assert!(db.pending_op_ids().is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_returns_capacity() {
        let (store, config) = fixture();
        let executor = MockExecutor::new();
        let tracker = OpTracker::new(8);

        let vol = replica3(100);
        let vol_id = vol.id.clone();
        let op = Box::new(VolumeCreateOperation::new(
            store.clone(),
            config.clone(),
            vol,
        ));
        crate::ops::run_operation(op, executor.clone(), &tracker)
            .await
            .unwrap();

        let op = Box::new(VolumeDeleteOperation::new(store.clone(), config, &vol_id));
        crate::ops::run_operation(op, executor.clone(), &tracker)
            .await
            .unwrap();

        store
            .view(|db| {
                assert!(db.volume_ids().is_empty());
                assert!(db.brick_ids().is_empty());
                assert!(db.pending_op_ids().is_empty());
                for id in db.device_ids() {
                    assert_eq!(db.device(&id)?.used_kb, 0);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(executor.calls_matching("volume_destroy").len(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_pending_volume_conflicts() {
        let (store, config) = fixture();
        let vol = replica3(10);
        let vol_id = vol.id.clone();
        store
            .update(|db| {
                let mut vol = vol.clone();
                let mut op = PendingOperationEntry::new();
                op.record_add_volume(&mut vol);
                db.put_volume(vol);
                db.put_pending_op(op);
                Ok(())
            })
            .unwrap();

        let mut op = VolumeDeleteOperation::new(store, config, &vol_id);
        let err = op.build().unwrap_err();
        assert!(matches!(err, Error::Conflict));
    }

    #[tokio::test]
    async fn test_create_clean_after_crash() {
        let (store, config) = fixture();
        let executor = MockExecutor::new();

        // build committed, process died before exec finished
        let mut op = VolumeCreateOperation::new(store.clone(), config.clone(), replica3(100));
        op.build().unwrap();
        store
            .update(|db| {
                db.mark_pending_operations_stale();
                Ok(())
            })
            .unwrap();

        let entry = store
            .view(|db| db.pending_op(&op.op_id))
            .unwrap();
        assert_eq!(entry.status, PendingStatus::Stale);
        let cleanable = crate::ops::load_operation(store.clone(), config, &entry).unwrap();
        cleanable.clean(executor.as_ref()).await.unwrap();
        cleanable.clean_done().unwrap();

        store
            .view(|db| {
                assert!(db.volume_ids().is_empty());
                assert!(db.brick_ids().is_empty());
                assert!(db.pending_op_ids().is_empty());
                for id in db.device_ids() {
                    assert_eq!(db.device(&id)?.used_kb, 0);
                }
                Ok(())
            })
            .unwrap();
    }
}
