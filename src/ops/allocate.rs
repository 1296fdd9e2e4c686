//! Volume brick allocation
//!
//! Turns a requested volume size into placed, pending bricks inside a
//! store transaction. The sizing generator proposes successively more,
//! smaller bricks; every proposal is tried against a fresh device
//! snapshot so a failed attempt leaves no trace. Volume creation walks
//! the candidate clusters in order and settles on the first one with
//! room.

use crate::allocator::ClusterDeviceSource;
use crate::config::{Config, GB};
use crate::entities::{PendingOperationEntry, VolumeEntry};
use crate::error::{Error, Result};
use crate::placer::{ArbiterBrickPlacer, BrickPlacer, PlacementOpts, StandardBrickPlacer};
use crate::store::Db;

fn placer_for(vol: &VolumeEntry) -> Box<dyn BrickPlacer> {
    if vol.durability.uses_arbiter() {
        Box::new(ArbiterBrickPlacer::new())
    } else {
        Box::new(StandardBrickPlacer::new())
    }
}

/// Clusters allowed to host the given workload kind, in id order.
pub fn eligible_clusters(db: &Db, block: bool) -> Vec<String> {
    db.cluster_ids()
        .into_iter()
        .filter(|id| {
            db.cluster(id)
                .map(|c| if block { c.block } else { c.file })
                .unwrap_or(false)
        })
        .collect()
}

/// Allocate `size_gb` worth of pending bricks for the volume on one
/// cluster. On success the bricks are stored, recorded in the ledger
/// entry, and appended to the volume's brick list.
pub fn allocate_bricks_in_cluster(
    db: &mut Db,
    config: &Config,
    cluster_id: &str,
    vol: &mut VolumeEntry,
    size_gb: u64,
    op: &mut PendingOperationEntry,
) -> Result<()> {
    let set_size = vol.durability.bricks_in_set();
    let mut sizer = vol.durability.brick_size_generator(size_gb * GB, config);
    loop {
        let (sets, brick_size_kb) = sizer.next_layout()?;
        let new_bricks = sets as usize * set_size;
        if (vol.bricks.len() + new_bricks) as u64 > config.max_bricks_per_volume {
            return Err(Error::MaxBricks);
        }

        // Fresh snapshot per attempt: a layout that does not fit must
        // not leave capacity reserved.
        let mut source = ClusterDeviceSource::new(db, cluster_id)?;
        let opts = PlacementOpts {
            volume_id: vol.id.clone(),
            brick_size_kb,
            set_size,
            set_count: sets as usize,
            arbiter_discount_factor: config.arbiter_discount_factor,
            zone_diverse: config.strict_zone_checking,
        };
        match placer_for(vol).place_all(&mut source, &opts, None) {
            Ok(allocation) => {
                source.persist(db);
                for bs in allocation.brick_sets {
                    for mut brick in bs.bricks {
                        op.record_add_brick(&mut brick);
                        vol.brick_add(&brick.id);
                        db.put_brick(brick);
                    }
                }
                return Ok(());
            }
            Err(Error::NoSpace) => {
                tracing::debug!(
                    volume = %vol.id,
                    sets,
                    brick_size_kb,
                    "layout does not fit, trying smaller bricks"
                );
                continue;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Pick a cluster for a new volume and allocate its bricks there. The
/// volume's cluster id, the cluster's volume list, and the ledger entry
/// are all updated in the transaction.
pub fn allocate_volume(
    db: &mut Db,
    config: &Config,
    vol: &mut VolumeEntry,
    op: &mut PendingOperationEntry,
    block_workload: bool,
) -> Result<()> {
    let candidates = if vol.cluster_id.is_empty() {
        eligible_clusters(db, block_workload)
    } else {
        vec![vol.cluster_id.clone()]
    };
    if candidates.is_empty() {
        return Err(Error::NoSpace);
    }

    let mut last = Error::NoSpace;
    for cluster_id in candidates {
        match allocate_bricks_in_cluster(db, config, &cluster_id, vol, vol.size_gb, op) {
            Ok(()) => {
                let mut cluster = db.cluster(&cluster_id)?;
                cluster.volume_add(&vol.id);
                db.put_cluster(cluster);
                vol.cluster_id = cluster_id;
                return Ok(());
            }
            Err(err) if err.is_capacity() => {
                tracing::info!(cluster = %cluster_id, error = %err, "cluster cannot host volume");
                last = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last)
}

/// Release every brick of the volume back to its device and drop the
/// brick entries.
pub fn release_volume_bricks(db: &mut Db, vol: &VolumeEntry) -> Result<()> {
    for brick_id in &vol.bricks {
        let brick = db.brick(brick_id)?;
        let mut device = db.device(&brick.device_id)?;
        device.brick_delete(&brick);
        db.put_device(device);
        db.delete_brick(brick_id)?;
    }
    Ok(())
}
