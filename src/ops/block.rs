//! Block volume operations
//!
//! Block volumes are carved out of the free space of a block hosting
//! file volume. Create finds a hosting volume with room, or provisions
//! one inside the same operation when configured to. The target IQN
//! reported by the storage layer is only written back at finalize.

use super::allocate::{allocate_volume, release_volume_bricks};
use super::{
    cluster_manage_hosts, create_bricks, destroy_bricks, volume_request, CleanableOperation,
    Operation,
};
use crate::config::Config;
use crate::entities::{BlockVolumeEntry, PendingChange, PendingOperationEntry, VolumeEntry};
use crate::error::{Error, Result};
use crate::executor::{try_on_hosts, BlockVolumeInfo, BlockVolumeRequest, Executor};
use crate::store::{Db, Store};
use async_trait::async_trait;
use std::sync::Arc;

/// Volumes able to host a block volume of the given size, restricted to
/// block-capable clusters.
fn find_hosting_volume(db: &Db, cluster_id: &str, size_gb: u64) -> Option<VolumeEntry> {
    let cluster = db.cluster(cluster_id).ok()?;
    if !cluster.block {
        return None;
    }
    cluster
        .volumes
        .iter()
        .filter_map(|id| db.volume(id).ok())
        .find(|v| v.can_host_block_volume(size_gb))
}

/// True when any block hosting volume in the cluster is still pending.
/// A second auto-provisioned hosting volume racing the first would
/// double-allocate capacity, so creation is refused until it settles.
fn hosting_volume_pending(db: &Db, cluster_id: &str) -> bool {
    db.cluster(cluster_id)
        .map(|c| {
            c.volumes
                .iter()
                .filter_map(|id| db.volume(id).ok())
                .any(|v| v.block_info.is_some() && v.is_pending())
        })
        .unwrap_or(false)
}

// =============================================================================
// Create
// =============================================================================

pub struct BlockVolumeCreateOperation {
    store: Arc<Store>,
    config: Arc<Config>,
    bv: BlockVolumeEntry,
    op_id: String,
    /// Filled by exec, written back at finalize.
    info: Option<BlockVolumeInfo>,
}

impl BlockVolumeCreateOperation {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        bv: BlockVolumeEntry,
    ) -> BlockVolumeCreateOperation {
        BlockVolumeCreateOperation {
            store,
            config,
            bv,
            op_id: PendingOperationEntry::new().id,
            info: None,
        }
    }

    pub(super) fn load(
        store: Arc<Store>,
        config: Arc<Config>,
        entry: &PendingOperationEntry,
    ) -> Result<BlockVolumeCreateOperation> {
        let bv_id = entry
            .id_for(PendingChange::AddBlockVolume)
            .ok_or_else(|| Error::NotLoadable {
                reason: format!("create entry {} references no block volume", entry.id),
            })?;
        let bv = store.view(|db| db.block_volume(bv_id))?;
        Ok(BlockVolumeCreateOperation {
            store,
            config,
            bv,
            op_id: entry.id.clone(),
            info: None,
        })
    }

    /// Hosting volume ids this operation created itself.
    fn owned_hosting_volumes(&self) -> Result<Vec<String>> {
        self.store.view(|db| {
            Ok(db
                .pending_op(&self.op_id)
                .map(|op| op.added_volume_ids())
                .unwrap_or_default())
        })
    }

    async fn remote_teardown(&self, executor: &dyn Executor) -> Result<()> {
        let state = self.store.view(|db| {
            let bv = match db.block_volume(&self.bv.id) {
                Ok(bv) => bv,
                Err(Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            let hosting = db.volume(&bv.hosting_volume_id)?;
            let hosts = cluster_manage_hosts(db, &bv.cluster_id)?;
            Ok(Some((bv.name.clone(), hosting, hosts)))
        })?;
        let Some((name, hosting, hosts)) = state else {
            return Ok(());
        };

        let destroy = try_on_hosts(hosts.clone(), |host| {
            let name = name.clone();
            let hosting_name = hosting.name.clone();
            async move { executor.block_volume_destroy(&host, &hosting_name, &name).await }
        })
        .await;
        if let Err(err) = destroy {
            tracing::warn!(block_volume = %self.bv.id, error = %err, "remote block volume teardown failed");
        }

        // An auto-provisioned hosting volume goes down with the failed
        // operation.
        for vol_id in self.owned_hosting_volumes()? {
            let (vol_name, brick_ids) = self
                .store
                .view(|db| {
                    let vol = db.volume(&vol_id)?;
                    Ok((vol.name.clone(), vol.bricks.clone()))
                })?;
            let destroy = try_on_hosts(hosts.clone(), |host| {
                let vol_name = vol_name.clone();
                async move { executor.volume_destroy(&host, &vol_name).await }
            })
            .await;
            if let Err(err) = destroy {
                tracing::warn!(volume = %vol_id, error = %err, "hosting volume teardown failed");
            }
            destroy_bricks(&self.store, executor, &brick_ids).await?;
        }
        Ok(())
    }

    fn db_revert(&self) -> Result<()> {
        let owned = self.owned_hosting_volumes()?;
        self.store.update(move |db| {
            if let Ok(bv) = db.block_volume(&self.bv.id) {
                if let Ok(mut hosting) = db.volume(&bv.hosting_volume_id) {
                    hosting.block_volume_delete(&bv.id, bv.size_gb);
                    db.put_volume(hosting);
                }
                if let Ok(mut cluster) = db.cluster(&bv.cluster_id) {
                    cluster.block_volume_delete(&bv.id);
                    db.put_cluster(cluster);
                }
                db.delete_block_volume(&bv.id)?;
            }
            for vol_id in &owned {
                let vol = match db.volume(vol_id) {
                    Ok(v) => v,
                    Err(Error::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                };
                release_volume_bricks(db, &vol)?;
                if let Ok(mut cluster) = db.cluster(&vol.cluster_id) {
                    cluster.volume_delete(vol_id);
                    db.put_cluster(cluster);
                }
                db.delete_volume(vol_id)?;
            }
            if db.pending_op(&self.op_id).is_ok() {
                db.delete_pending_op(&self.op_id)?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Operation for BlockVolumeCreateOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Create Block Volume"
    }

    fn resource_url(&self) -> String {
        format!("/blockvolumes/{}", self.bv.id)
    }

    fn max_retries(&self) -> u32 {
        self.config.op_retry_count
    }

    fn build(&mut self) -> Result<()> {
        let config = self.config.clone();
        let template = self.bv.clone();
        let op_id = self.op_id.clone();
        self.store.update(move |db| {
            let mut bv = template;
            if bv.size_gb == 0 {
                return Err(Error::Configuration(
                    "block volume size must be positive".into(),
                ));
            }
            let mut op = PendingOperationEntry::new();
            op.id = op_id;

            let candidates = if bv.cluster_id.is_empty() {
                super::allocate::eligible_clusters(db, true)
            } else {
                vec![bv.cluster_id.clone()]
            };

            let found = candidates
                .iter()
                .find_map(|c| find_hosting_volume(db, c, bv.size_gb));
            let mut hosting = match found {
                Some(vol) => vol,
                None => {
                    if !config.auto_create_block_hosting_volume {
                        return Err(Error::NoSpace);
                    }
                    if candidates.iter().any(|c| hosting_volume_pending(db, c)) {
                        return Err(Error::TooManyOperations);
                    }
                    if bv.size_gb > config.block_hosting_usable_size_gb() {
                        return Err(Error::NoSpace);
                    }
                    let mut vol = VolumeEntry::new_block_hosting(&config);
                    if let [only] = candidates.as_slice() {
                        vol.cluster_id = only.clone();
                    }
                    op.record_add_hosting_volume(&mut vol);
                    allocate_volume(db, &config, &mut vol, &mut op, true)?;
                    db.put_volume(vol.clone());
                    vol
                }
            };

            bv.cluster_id = hosting.cluster_id.clone();
            bv.hosting_volume_id = hosting.id.clone();
            op.record_add_block_volume(&mut bv);
            hosting.block_volume_add(&bv.id, bv.size_gb);
            let mut cluster = db.cluster(&bv.cluster_id)?;
            cluster.block_volume_add(&bv.id);
            db.put_cluster(cluster);
            db.put_volume(hosting);
            db.put_block_volume(bv);
            db.put_pending_op(op);
            Ok(())
        })
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        let (hosts, hosting_req, req) = self.store.view(|db| {
            let bv = db.block_volume(&self.bv.id)?;
            let hosting = db.volume(&bv.hosting_volume_id)?;
            let op = db.pending_op(&self.op_id)?;
            let owned = op.added_volume_ids();
            let hosting_req = if owned.contains(&hosting.id) {
                Some((
                    hosting.bricks.clone(),
                    volume_request(db, &hosting.id, &hosting.bricks)?,
                ))
            } else {
                None
            };
            let req = BlockVolumeRequest {
                name: bv.name.clone(),
                hosting_volume: hosting.name.clone(),
                size_gb: bv.size_gb,
            };
            Ok((cluster_manage_hosts(db, &bv.cluster_id)?, hosting_req, req))
        })?;

        if let Some((brick_ids, vol_req)) = hosting_req {
            create_bricks(&self.store, executor, &brick_ids).await?;
            try_on_hosts(hosts.clone(), |host| {
                let vol_req = &vol_req;
                async move { executor.volume_create(&host, vol_req).await }
            })
            .await
            .map_err(Error::retry)?;
        }

        let info = try_on_hosts(hosts, |host| {
            let req = &req;
            async move { executor.block_volume_create(&host, req).await }
        })
        .await
        .map_err(Error::retry)?;
        self.info = Some(info);
        Ok(())
    }

    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()> {
        self.remote_teardown(executor).await?;
        self.db_revert()
    }

    fn finalize(&mut self) -> Result<()> {
        let info = self.info.take().ok_or_else(|| {
            Error::Invariant("block volume finalized before exec reported its info".into())
        })?;
        self.store.update(|db| {
            let mut bv = db.block_volume(&self.bv.id)?;
            let op = db.pending_op(&self.op_id)?;
            bv.iqn = Some(info.iqn.clone());
            bv.usable_size_gb = info.usable_size_gb;
            for vol_id in op.added_volume_ids() {
                let mut vol = db.volume(&vol_id)?;
                for brick_id in vol.bricks.clone() {
                    let mut brick = db.brick(&brick_id)?;
                    op.finalize_brick(&mut brick);
                    db.put_brick(brick);
                }
                op.finalize_volume(&mut vol);
                db.put_volume(vol);
            }
            op.finalize_block_volume(&mut bv);
            db.put_block_volume(bv);
            db.delete_pending_op(&self.op_id)
        })
    }
}

#[async_trait]
impl CleanableOperation for BlockVolumeCreateOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Create Block Volume"
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

pub struct BlockVolumeExpandOperation {
    store: Arc<Store>,
    config: Arc<Config>,
    bv_id: String,
    new_size_gb: u64,
    op_id: String,
    info: Option<BlockVolumeInfo>,
}

impl BlockVolumeExpandOperation {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        bv_id: &str,
        new_size_gb: u64,
    ) -> BlockVolumeExpandOperation {
        BlockVolumeExpandOperation {
            store,
            config,
            bv_id: bv_id.to_string(),
            new_size_gb,
            op_id: PendingOperationEntry::new().id,
            info: None,
        }
    }

    pub(super) fn load(
        store: Arc<Store>,
        config: Arc<Config>,
        entry: &PendingOperationEntry,
    ) -> Result<BlockVolumeExpandOperation> {
        let bv_id = entry
            .id_for(PendingChange::ExpandBlockVolume)
            .ok_or_else(|| Error::NotLoadable {
                reason: format!("expand entry {} references no block volume", entry.id),
            })?
            .to_string();
        let new_size_gb = entry.expand_delta_gb().unwrap_or(0);
        Ok(BlockVolumeExpandOperation {
            store,
            config,
            bv_id,
            new_size_gb,
            op_id: entry.id.clone(),
            info: None,
        })
    }

    fn delta_gb(&self, bv: &BlockVolumeEntry) -> u64 {
        self.new_size_gb.saturating_sub(bv.size_gb)
    }

    fn db_revert(&self) -> Result<()> {
        self.store.update(|db| {
            if let Ok(bv) = db.block_volume(&self.bv_id) {
                let delta = self.delta_gb(&bv);
                if let Ok(mut hosting) = db.volume(&bv.hosting_volume_id) {
                    if let Some(info) = hosting.block_info.as_mut() {
                        info.free_size_gb += delta;
                    }
                    db.put_volume(hosting);
                }
            }
            if db.pending_op(&self.op_id).is_ok() {
                db.delete_pending_op(&self.op_id)?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Operation for BlockVolumeExpandOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Expand Block Volume"
    }

    fn resource_url(&self) -> String {
        format!("/blockvolumes/{}", self.bv_id)
    }

    fn max_retries(&self) -> u32 {
        self.config.op_retry_count
    }

    fn build(&mut self) -> Result<()> {
        let bv_id = self.bv_id.clone();
        let new_size_gb = self.new_size_gb;
        let op_id = self.op_id.clone();
        self.store.update(move |db| {
            let bv = db.block_volume(&bv_id)?;
            if bv.is_pending() {
                return Err(Error::Conflict);
            }
            if new_size_gb <= bv.size_gb {
                return Err(Error::Configuration(
                    "new size must exceed the current size".into(),
                ));
            }
            let delta = new_size_gb - bv.size_gb;
            let mut hosting = db.volume(&bv.hosting_volume_id)?;
            if hosting.is_pending() {
                return Err(Error::Conflict);
            }
            let free = hosting
                .block_info
                .as_ref()
                .map(|i| i.free_size_gb)
                .unwrap_or(0);
            if free < delta {
                return Err(Error::NoSpace);
            }
            if let Some(info) = hosting.block_info.as_mut() {
                info.free_size_gb -= delta;
            }
            let mut op = PendingOperationEntry::new();
            op.id = op_id;
            op.record_expand_block_volume(&bv, new_size_gb);
            db.put_volume(hosting);
            db.put_pending_op(op);
            Ok(())
        })
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        let (hosts, hosting_name, name) = self.store.view(|db| {
            let bv = db.block_volume(&self.bv_id)?;
            let hosting = db.volume(&bv.hosting_volume_id)?;
            Ok((
                cluster_manage_hosts(db, &bv.cluster_id)?,
                hosting.name.clone(),
                bv.name.clone(),
            ))
        })?;
        let new_size_gb = self.new_size_gb;
        let info = try_on_hosts(hosts, |host| {
            let hosting_name = hosting_name.clone();
            let name = name.clone();
            async move {
                executor
                    .block_volume_expand(&host, &hosting_name, &name, new_size_gb)
                    .await
            }
        })
        .await
        .map_err(Error::retry)?;
        self.info = Some(info);
        Ok(())
    }

    async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
        self.db_revert()
    }

    fn finalize(&mut self) -> Result<()> {
        let info = self.info.take().ok_or_else(|| {
            Error::Invariant("block volume finalized before exec reported its info".into())
        })?;
        self.store.update(|db| {
            let mut bv = db.block_volume(&self.bv_id)?;
            bv.size_gb = self.new_size_gb;
            bv.usable_size_gb = info.usable_size_gb;
            db.put_block_volume(bv);
            db.delete_pending_op(&self.op_id)
        })
    }
}

#[async_trait]
impl CleanableOperation for BlockVolumeExpandOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Expand Block Volume"
    }

    /// The remote size is queried rather than changed: an interrupted
    /// expand either happened or it did not, and the reservation is
    /// simply released either way while the recorded size stays at its
    /// pre-expand value.
    async fn clean(&self, _executor: &dyn Executor) -> Result<()> {
        Ok(())
    }

    fn clean_done(&self) -> Result<()> {
        self.db_revert()
    }
}

// =============================================================================
// Delete
// =============================================================================

pub struct BlockVolumeDeleteOperation {
    store: Arc<Store>,
    config: Arc<Config>,
    bv_id: String,
    op_id: String,
}

impl BlockVolumeDeleteOperation {
    pub fn new(store: Arc<Store>, config: Arc<Config>, bv_id: &str) -> BlockVolumeDeleteOperation {
        BlockVolumeDeleteOperation {
            store,
            config,
            bv_id: bv_id.to_string(),
            op_id: PendingOperationEntry::new().id,
        }
    }

    pub(super) fn load(
        store: Arc<Store>,
        config: Arc<Config>,
        entry: &PendingOperationEntry,
    ) -> Result<BlockVolumeDeleteOperation> {
        let bv_id = entry
            .id_for(PendingChange::DeleteBlockVolume)
            .ok_or_else(|| Error::NotLoadable {
                reason: format!("delete entry {} references no block volume", entry.id),
            })?
            .to_string();
        Ok(BlockVolumeDeleteOperation {
            store,
            config,
            bv_id,
            op_id: entry.id.clone(),
        })
    }

    async fn remote_teardown(&self, executor: &dyn Executor) -> Result<()> {
        let (hosts, hosting_name, name) = self.store.view(|db| {
            let bv = db.block_volume(&self.bv_id)?;
            let hosting = db.volume(&bv.hosting_volume_id)?;
            Ok((
                cluster_manage_hosts(db, &bv.cluster_id)?,
                hosting.name.clone(),
                bv.name.clone(),
            ))
        })?;
        try_on_hosts(hosts, |host| {
            let hosting_name = hosting_name.clone();
            let name = name.clone();
            async move { executor.block_volume_destroy(&host, &hosting_name, &name).await }
        })
        .await
    }

    fn db_complete(&self) -> Result<()> {
        self.store.update(|db| {
            let bv = db.block_volume(&self.bv_id)?;
            let mut hosting = db.volume(&bv.hosting_volume_id)?;
            hosting.block_volume_delete(&bv.id, bv.size_gb);
            db.put_volume(hosting);
            let mut cluster = db.cluster(&bv.cluster_id)?;
            cluster.block_volume_delete(&bv.id);
            db.put_cluster(cluster);
            db.delete_block_volume(&bv.id)?;
            db.delete_pending_op(&self.op_id)
        })
    }
}

#[async_trait]
impl Operation for BlockVolumeDeleteOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Delete Block Volume"
    }

    fn resource_url(&self) -> String {
        String::new()
    }

    fn max_retries(&self) -> u32 {
        self.config.op_retry_count
    }

    fn build(&mut self) -> Result<()> {
        let bv_id = self.bv_id.clone();
        let op_id = self.op_id.clone();
        self.store.update(move |db| {
            let mut bv = db.block_volume(&bv_id)?;
            if bv.is_pending() {
                return Err(Error::Conflict);
            }
            let mut op = PendingOperationEntry::new();
            op.id = op_id;
            op.record_delete_block_volume(&mut bv);
            db.put_block_volume(bv);
            db.put_pending_op(op);
            Ok(())
        })
    }

    async fn exec(&mut self, executor: &dyn Executor) -> Result<()> {
        self.remote_teardown(executor).await.map_err(Error::retry)
    }

    async fn rollback(&mut self, _executor: &dyn Executor) -> Result<()> {
        self.store.update(|db| {
            let mut bv = db.block_volume(&self.bv_id)?;
            let op = db.pending_op(&self.op_id)?;
            op.finalize_block_volume(&mut bv);
            db.put_block_volume(bv);
            db.delete_pending_op(&self.op_id)
        })
    }

    fn finalize(&mut self) -> Result<()> {
        self.db_complete()
    }
}

#[async_trait]
impl CleanableOperation for BlockVolumeDeleteOperation {
    fn id(&self) -> &str {
        &self.op_id
    }

    fn label(&self) -> &'static str {
        "Delete Block Volume"
    }

    async fn clean(&self, executor: &dyn Executor) -> Result<()> {
        self.remote_teardown(executor).await
    }

    fn clean_done(&self) -> Result<()> {
        self.db_complete()
    }
}
