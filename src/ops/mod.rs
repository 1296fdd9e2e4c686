//! Pending operation engine
//!
//! Every externally visible state change runs as an operation with
//! four phases: `build` records intent in the store, `exec` performs
//! the remote work outside any transaction, `finalize` commits the
//! outcome, and `rollback` undoes a failed attempt. A durable ledger
//! entry ties the phases together so that operations interrupted by a
//! crash can be found and cleaned later.

pub mod allocate;
pub mod block;
pub mod cleaner;
pub mod device;
pub mod manage;
pub mod tracker;
pub mod volume;

pub use block::{BlockVolumeCreateOperation, BlockVolumeDeleteOperation, BlockVolumeExpandOperation};
pub use cleaner::OperationCleaner;
pub use device::{BrickEvictOperation, DeviceRemoveOperation};
pub use manage::{run_operation, run_operation_detached};
pub use tracker::{OpClass, OpTracker};
pub use volume::{VolumeCreateOperation, VolumeDeleteOperation, VolumeExpandOperation};

use crate::config::Config;
use crate::entities::{BrickEntry, PendingOperationEntry, PendingOperationType};
use crate::error::{Error, Result};
use crate::executor::{BrickSpec, Executor, VolumeDurabilitySpec, VolumeRequest};
use crate::store::{Db, Store};
use async_trait::async_trait;
use std::sync::Arc;

/// One multi-phase state change
#[async_trait]
pub trait Operation: Send + Sync {
    /// Id of the backing ledger entry.
    fn id(&self) -> &str;

    /// Human-readable operation kind for logs.
    fn label(&self) -> &'static str;

    /// URL of the resource this operation produces or consumes.
    fn resource_url(&self) -> String;

    /// How many times `exec` may be re-attempted after a retryable
    /// failure.
    fn max_retries(&self) -> u32 {
        0
    }

    /// Record intent: allocate capacity, create pending entries, write
    /// the ledger entry. Runs entirely inside one store transaction.
    fn build(&mut self) -> Result<()>;

    /// Perform the remote work. Never holds a store transaction.
    async fn exec(&mut self, executor: &dyn Executor) -> Result<()>;

    /// Undo a failed attempt: tear down whatever `exec` may have
    /// created remotely, then revert the store to its pre-build shape.
    async fn rollback(&mut self, executor: &dyn Executor) -> Result<()>;

    /// Commit the outcome and retire the ledger entry.
    fn finalize(&mut self) -> Result<()>;
}

/// An operation that can be cleaned up after the fact, without the
/// in-memory state of the process that started it
#[async_trait]
pub trait CleanableOperation: Send + Sync {
    fn id(&self) -> &str;

    fn label(&self) -> &'static str;

    /// Remove whatever the operation may have created remotely. Must be
    /// safe to run repeatedly and against partial state.
    async fn clean(&self, executor: &dyn Executor) -> Result<()>;

    /// Revert the store once `clean` has succeeded.
    fn clean_done(&self) -> Result<()>;
}

/// Reconstruct a cleanable operation from its ledger entry. Entries
/// spawned as children of another operation are cleaned through their
/// parent and refuse direct loading.
pub fn load_operation(
    store: Arc<Store>,
    config: Arc<Config>,
    entry: &PendingOperationEntry,
) -> Result<Box<dyn CleanableOperation>> {
    if entry.is_child() {
        return Err(Error::NotLoadable {
            reason: format!("operation {} is managed by its parent", entry.id),
        });
    }
    match entry.op_type {
        PendingOperationType::CreateVolume => Ok(Box::new(VolumeCreateOperation::load(
            store, config, entry,
        )?)),
        PendingOperationType::ExpandVolume => Ok(Box::new(VolumeExpandOperation::load(
            store, config, entry,
        )?)),
        PendingOperationType::DeleteVolume => Ok(Box::new(VolumeDeleteOperation::load(
            store, config, entry,
        )?)),
        PendingOperationType::CreateBlockVolume => Ok(Box::new(BlockVolumeCreateOperation::load(
            store, config, entry,
        )?)),
        PendingOperationType::ExpandBlockVolume => Ok(Box::new(BlockVolumeExpandOperation::load(
            store, config, entry,
        )?)),
        PendingOperationType::DeleteBlockVolume => Ok(Box::new(BlockVolumeDeleteOperation::load(
            store, config, entry,
        )?)),
        PendingOperationType::RemoveDevice => Ok(Box::new(DeviceRemoveOperation::load(
            store, config, entry,
        )?)),
        PendingOperationType::EvictBrick => Ok(Box::new(BrickEvictOperation::load(
            store, config, entry,
        )?)),
        PendingOperationType::Unknown => Err(Error::NotLoadable {
            reason: format!("unhandled operation type {:?}", entry.op_type),
        }),
    }
}

// =============================================================================
// Shared Remote-Call Helpers
// =============================================================================

/// Management hostname of the node carrying the given brick.
pub(crate) fn brick_manage_host(db: &Db, brick: &BrickEntry) -> Result<String> {
    Ok(db.node(&brick.node_id)?.manage_hostname.clone())
}

/// Remote identity of one brick.
pub(crate) fn brick_spec(db: &Db, brick: &BrickEntry) -> Result<BrickSpec> {
    let node = db.node(&brick.node_id)?;
    Ok(BrickSpec {
        id: brick.id.clone(),
        host: node.storage_hostname.clone(),
        path: format!("/var/lib/brickyard/{}/brick_{}", brick.device_id, brick.id),
        size_kb: brick.size_kb,
    })
}

/// Management hostnames of a cluster's online nodes.
pub(crate) fn cluster_manage_hosts(db: &Db, cluster_id: &str) -> Result<Vec<String>> {
    let cluster = db.cluster(cluster_id)?;
    let mut hosts = Vec::new();
    for node_id in &cluster.nodes {
        let node = db.node(node_id)?;
        if node.is_online() {
            hosts.push(node.manage_hostname.clone());
        }
    }
    Ok(hosts)
}

/// Remote create request for a volume and the given bricks.
pub(crate) fn volume_request(db: &Db, vol_id: &str, brick_ids: &[String]) -> Result<VolumeRequest> {
    let vol = db.volume(vol_id)?;
    let durability = match vol.durability {
        crate::durability::Durability::None => VolumeDurabilitySpec::None,
        crate::durability::Durability::Replicate { replica, arbiter } => {
            VolumeDurabilitySpec::Replicate { replica, arbiter }
        }
        crate::durability::Durability::Disperse { data, redundancy } => {
            VolumeDurabilitySpec::Disperse { data, redundancy }
        }
    };
    let mut bricks = Vec::with_capacity(brick_ids.len());
    for id in brick_ids {
        bricks.push(brick_spec(db, &db.brick(id)?)?);
    }
    Ok(VolumeRequest {
        name: vol.name.clone(),
        durability,
        bricks,
    })
}

/// Create every listed brick on its host. Failures are retryable.
pub(crate) async fn create_bricks(
    store: &Store,
    executor: &dyn Executor,
    brick_ids: &[String],
) -> Result<()> {
    for id in brick_ids {
        let (host, spec) = store.view(|db| {
            let brick = db.brick(id)?;
            Ok((brick_manage_host(db, &brick)?, brick_spec(db, &brick)?))
        })?;
        executor
            .brick_create(&host, &spec)
            .await
            .map_err(Error::retry)?;
    }
    Ok(())
}

/// Destroy every listed brick on its host, best effort. Bricks whose
/// entries are already gone are skipped.
pub(crate) async fn destroy_bricks(
    store: &Store,
    executor: &dyn Executor,
    brick_ids: &[String],
) -> Result<()> {
    for id in brick_ids {
        let found = store.view(|db| {
            let brick = match db.brick(id) {
                Ok(b) => b,
                Err(Error::NotFound { .. }) => return Ok(None),
                Err(e) => return Err(e),
            };
            Ok(Some((brick_manage_host(db, &brick)?, brick_spec(db, &brick)?)))
        })?;
        if let Some((host, spec)) = found {
            if let Err(err) = executor.brick_destroy(&host, &spec).await {
                tracing::warn!(brick = %id, error = %err, "brick teardown failed");
                return Err(err);
            }
        }
    }
    Ok(())
}
