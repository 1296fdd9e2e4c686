//! Application wiring
//!
//! Owns the store, the allocator rings, the operation tracker, and the
//! background tasks, and exposes the topology and provisioning API the
//! server front end calls into. Startup marks every leftover ledger
//! entry stale so the cleaner can pick it up.

use crate::allocator::Allocator;
use crate::config::Config;
use crate::entities::{
    BlockVolumeEntry, ClusterEntry, DeviceEntry, EntryState, NodeEntry, PendingStatus, VolumeEntry,
};
use crate::error::{Error, Result};
use crate::executor::ExecutorRef;
use crate::health::{NodeHealthCache, NodeHealthMonitor};
use crate::ops::{
    run_operation, BlockVolumeCreateOperation, BlockVolumeDeleteOperation,
    BlockVolumeExpandOperation, BrickEvictOperation, DeviceRemoveOperation, OpTracker,
    OperationCleaner, VolumeCreateOperation, VolumeDeleteOperation, VolumeExpandOperation,
};
use crate::store::Store;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct App {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub executor: ExecutorRef,
    pub tracker: Arc<OpTracker>,
    pub allocator: Arc<Allocator>,
    pub health: Arc<NodeHealthCache>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    pub fn new(config: Config, executor: ExecutorRef) -> Result<Arc<App>> {
        config.validate()?;
        let tracker = Arc::new(OpTracker::new(config.op_limit));
        let health = NodeHealthCache::new();
        Ok(Arc::new(App {
            store: Store::new(),
            config: Arc::new(config),
            executor,
            tracker,
            allocator: Arc::new(Allocator::with_health(health.clone())),
            health,
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }))
    }

    /// Mark leftover ledger entries stale, rebuild the allocation
    /// rings, and start the background tasks.
    pub fn start(&self) -> Result<()> {
        let stale = self.store.update(|db| {
            db.mark_pending_operations_stale();
            Ok(db.pending_op_ids().len())
        })?;
        if stale > 0 {
            tracing::info!(count = stale, "found pending operations from a previous run");
        }
        self.store.view(|db| self.allocator.load_from_store(db))?;

        let cleaner = Arc::new(OperationCleaner::new(
            self.store.clone(),
            self.config.clone(),
            self.executor.clone(),
            self.tracker.clone(),
        ));
        let monitor = NodeHealthMonitor::new(
            self.store.clone(),
            self.executor.clone(),
            self.health.clone(),
            Duration::from_secs(self.config.health_check_start_delay_secs),
            Duration::from_secs(self.config.health_check_interval_secs),
        );
        let mut background = self.background.lock();
        background.push(cleaner.spawn(self.cancel.clone()));
        background.push(monitor.spawn(self.cancel.clone()));
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("background tasks stopped");
    }

    // =========================================================================
    // Topology
    // =========================================================================

    pub fn cluster_create(&self, block: bool, file: bool) -> Result<ClusterEntry> {
        let cluster = ClusterEntry::new(block, file);
        let entry = cluster.clone();
        self.store.update(move |db| {
            db.put_cluster(cluster);
            Ok(())
        })?;
        self.allocator.add_cluster(&entry.id);
        Ok(entry)
    }

    /// Delete an empty cluster.
    pub fn cluster_delete(&self, cluster_id: &str) -> Result<()> {
        self.store.update(|db| {
            let cluster = db.cluster(cluster_id)?;
            if !cluster.nodes.is_empty()
                || !cluster.volumes.is_empty()
                || !cluster.block_volumes.is_empty()
            {
                return Err(Error::Conflict);
            }
            db.delete_cluster(cluster_id)
        })?;
        self.allocator.remove_cluster(cluster_id);
        Ok(())
    }

    pub fn node_add(
        &self,
        cluster_id: &str,
        zone: u32,
        manage_hostname: &str,
        storage_hostname: &str,
    ) -> Result<NodeEntry> {
        let node = NodeEntry::new(cluster_id, zone, manage_hostname, storage_hostname);
        let entry = node.clone();
        self.store.update(move |db| {
            let mut cluster = db.cluster(&node.cluster_id)?;
            cluster.node_add(&node.id);
            db.put_cluster(cluster);
            db.put_node(node);
            Ok(())
        })?;
        Ok(entry)
    }

    /// Delete a node carrying no devices.
    pub fn node_delete(&self, node_id: &str) -> Result<()> {
        self.store.update(|db| {
            let node = db.node(node_id)?;
            if !node.devices.is_empty() {
                return Err(Error::Conflict);
            }
            let mut cluster = db.cluster(&node.cluster_id)?;
            cluster.node_delete(node_id);
            db.put_cluster(cluster);
            db.delete_node(node_id)
        })
    }

    pub fn device_add(&self, node_id: &str, name: &str, total_kb: u64) -> Result<DeviceEntry> {
        let device = DeviceEntry::new(node_id, name, total_kb);
        let entry = device.clone();
        let node = self.store.update(move |db| {
            let mut node = db.node(&device.node_id)?;
            node.device_add(&device.id);
            db.put_node(node.clone());
            db.put_device(device);
            Ok(node)
        })?;
        self.allocator.add_device(&node, &entry);
        Ok(entry)
    }

    /// Change a device's state, keeping the allocation ring in step.
    pub fn device_set_state(&self, device_id: &str, state: EntryState) -> Result<()> {
        let (node, device) = self.store.update(move |db| {
            let mut device = db.device(device_id)?;
            device.state = state;
            db.put_device(device.clone());
            Ok((db.node(&device.node_id)?, device))
        })?;
        if state.is_online() {
            self.allocator.add_device(&node, &device);
        } else {
            self.allocator.remove_device(&node.cluster_id, device_id);
        }
        Ok(())
    }

    /// Delete a device hosting no bricks.
    pub fn device_delete(&self, device_id: &str) -> Result<()> {
        let cluster_id = self.store.update(|db| {
            let device = db.device(device_id)?;
            if !device.bricks.is_empty() {
                return Err(Error::Conflict);
            }
            let mut node = db.node(&device.node_id)?;
            node.device_delete(device_id);
            let cluster_id = node.cluster_id.clone();
            db.put_node(node);
            db.delete_device(device_id)?;
            Ok(cluster_id)
        })?;
        self.allocator.remove_device(&cluster_id, device_id);
        Ok(())
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    pub async fn volume_create(&self, vol: VolumeEntry) -> Result<String> {
        let op = Box::new(VolumeCreateOperation::new(
            self.store.clone(),
            self.config.clone(),
            vol,
        ));
        run_operation(op, self.executor.clone(), &self.tracker).await
    }

    pub async fn volume_expand(&self, vol_id: &str, delta_gb: u64) -> Result<String> {
        let op = Box::new(VolumeExpandOperation::new(
            self.store.clone(),
            self.config.clone(),
            vol_id,
            delta_gb,
        ));
        run_operation(op, self.executor.clone(), &self.tracker).await
    }

    pub async fn volume_delete(&self, vol_id: &str) -> Result<()> {
        let op = Box::new(VolumeDeleteOperation::new(
            self.store.clone(),
            self.config.clone(),
            vol_id,
        ));
        run_operation(op, self.executor.clone(), &self.tracker).await?;
        Ok(())
    }

    pub async fn block_volume_create(&self, bv: BlockVolumeEntry) -> Result<String> {
        let op = Box::new(BlockVolumeCreateOperation::new(
            self.store.clone(),
            self.config.clone(),
            bv,
        ));
        run_operation(op, self.executor.clone(), &self.tracker).await
    }

    pub async fn block_volume_expand(&self, bv_id: &str, new_size_gb: u64) -> Result<String> {
        let op = Box::new(BlockVolumeExpandOperation::new(
            self.store.clone(),
            self.config.clone(),
            bv_id,
            new_size_gb,
        ));
        run_operation(op, self.executor.clone(), &self.tracker).await
    }

    pub async fn block_volume_delete(&self, bv_id: &str) -> Result<()> {
        let op = Box::new(BlockVolumeDeleteOperation::new(
            self.store.clone(),
            self.config.clone(),
            bv_id,
        ));
        run_operation(op, self.executor.clone(), &self.tracker).await?;
        Ok(())
    }

    pub async fn device_remove(&self, device_id: &str) -> Result<()> {
        let op = Box::new(DeviceRemoveOperation::new(
            self.store.clone(),
            self.config.clone(),
            device_id,
        ));
        run_operation(op, self.executor.clone(), &self.tracker).await?;
        Ok(())
    }

    /// Move one brick off its current device onto another.
    pub async fn brick_evict(&self, brick_id: &str) -> Result<()> {
        let op = Box::new(BrickEvictOperation::new(
            self.store.clone(),
            self.config.clone(),
            brick_id,
        ));
        run_operation(op, self.executor.clone(), &self.tracker).await?;
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Pending ledger entries by status.
    pub fn pending_summary(&self) -> Result<BTreeMap<PendingStatus, usize>> {
        self.store.view(|db| Ok(db.pending_status_counts()))
    }
}
