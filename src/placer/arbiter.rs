//! Arbiter placer
//!
//! Variant for replicate volumes whose last slot holds an arbiter
//! brick: metadata only, so it is sized down by the configured discount
//! factor and placed from its own device walk. The walks are
//! restricted by the arbiter eligibility of each node or device:
//! arbiter slots only consider devices that may host arbiters, data
//! slots only devices that may host data. A device whose effective
//! setting is `Required` therefore never receives data bricks.

use super::standard::{fill_slot, replace_slot, restricted_device_walk};
use super::{BrickAllocation, BrickPlacer, BrickSet, DeviceFilter, DeviceSet, PlacementOpts};
use crate::allocator::{ClusterDeviceSource, DeviceCursor};
use crate::entities::{BrickEntry, DeviceEntry, NodeEntry};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct ArbiterBrickPlacer;

impl ArbiterBrickPlacer {
    pub fn new() -> ArbiterBrickPlacer {
        ArbiterBrickPlacer
    }
}

fn arbiter_seed(volume_id: &str) -> String {
    format!("arbiter:{volume_id}")
}

fn can_host_arbiter(node: &NodeEntry, device: &DeviceEntry) -> bool {
    device.arbiter_support(node.arbiter).can_host_arbiter()
}

fn can_host_data(node: &NodeEntry, device: &DeviceEntry) -> bool {
    device.arbiter_support(node.arbiter).can_host_data()
}

fn pool_walk(source: &ClusterDeviceSource, seed: &str, arbiter_pool: bool) -> DeviceCursor {
    let eligible: fn(&NodeEntry, &DeviceEntry) -> bool = if arbiter_pool {
        can_host_arbiter
    } else {
        can_host_data
    };
    restricted_device_walk(source, seed, eligible)
}

impl BrickPlacer for ArbiterBrickPlacer {
    fn place_all(
        &self,
        source: &mut ClusterDeviceSource,
        opts: &PlacementOpts,
        filter: Option<DeviceFilter<'_>>,
    ) -> Result<BrickAllocation> {
        if opts.set_size < 2 {
            return Err(Error::Invariant(
                "arbiter placement needs at least two slots per set".into(),
            ));
        }
        let arbiter_slot = opts.set_size - 1;
        let mut data_cursor = pool_walk(source, &opts.volume_id, false);
        let mut arbiter_cursor = pool_walk(source, &arbiter_seed(&opts.volume_id), true);

        let mut brick_sets = Vec::with_capacity(opts.set_count);
        let mut device_sets = Vec::with_capacity(opts.set_count);
        for _ in 0..opts.set_count {
            let mut bs = BrickSet::new(opts.set_size);
            let mut ds = DeviceSet::new(opts.set_size);
            for slot in 0..opts.set_size {
                let is_arbiter = slot == arbiter_slot;
                let cursor = if is_arbiter {
                    &mut arbiter_cursor
                } else {
                    &mut data_cursor
                };
                let size_kb = opts.slot_size_kb(is_arbiter);
                let (brick, device_id) = fill_slot(cursor, source, opts, filter, &bs, size_kb)?;
                bs.add(brick);
                ds.add(&device_id);
            }
            brick_sets.push(bs);
            device_sets.push(ds);
        }

        tracing::debug!(
            volume = %opts.volume_id,
            sets = opts.set_count,
            arbiter_size_kb = opts.slot_size_kb(true),
            "placed arbiter brick sets"
        );
        Ok(BrickAllocation {
            brick_sets,
            device_sets,
        })
    }

    fn replace(
        &self,
        source: &mut ClusterDeviceSource,
        opts: &PlacementOpts,
        filter: Option<DeviceFilter<'_>>,
        set: &BrickSet,
        index: usize,
    ) -> Result<BrickEntry> {
        let is_arbiter = index == opts.set_size - 1;
        let seed = if is_arbiter {
            arbiter_seed(&opts.volume_id)
        } else {
            opts.volume_id.clone()
        };
        let cursor = pool_walk(source, &seed, is_arbiter);
        replace_slot(cursor, source, opts, filter, set, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GB;
    use crate::entities::{ArbiterSupport, ClusterEntry, DeviceEntry, NodeEntry};
    use crate::store::{Db, Store};
    use std::collections::HashSet;

    fn seed_cluster(db: &mut Db, nodes: usize) -> String {
        seed_tagged_cluster(db, &vec![ArbiterSupport::Supported; nodes])
    }

    fn seed_tagged_cluster(db: &mut Db, tags: &[ArbiterSupport]) -> String {
        let mut cluster = ClusterEntry::new(true, true);
        for (n, tag) in tags.iter().enumerate() {
            let mut node = NodeEntry::new(
                &cluster.id,
                n as u32,
                &format!("manage{n}"),
                &format!("storage{n}"),
            );
            node.arbiter = *tag;
            let device = DeviceEntry::new(&node.id, "/dev/sdb", 500 * GB);
            node.device_add(&device.id);
            db.put_device(device);
            cluster.node_add(&node.id);
            db.put_node(node);
        }
        let id = cluster.id.clone();
        db.put_cluster(cluster);
        id
    }

    fn opts() -> PlacementOpts {
        PlacementOpts {
            volume_id: "vol-1".into(),
            brick_size_kb: 64 * GB,
            set_size: 3,
            set_count: 1,
            arbiter_discount_factor: 64,
            zone_diverse: false,
        }
    }

    #[test]
    fn test_last_slot_is_discounted() {
        let store = Store::new();
        let cluster_id = store.update(|db| Ok(seed_cluster(db, 5))).unwrap();

        let allocation = store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                ArbiterBrickPlacer::new().place_all(&mut source, &opts(), None)
            })
            .unwrap();

        let bs = &allocation.brick_sets[0];
        assert!(bs.full());
        assert_eq!(bs.bricks[0].size_kb, 64 * GB);
        assert_eq!(bs.bricks[1].size_kb, 64 * GB);
        assert_eq!(bs.bricks[2].size_kb, GB);

        let nodes: HashSet<&str> = bs.bricks.iter().map(|b| b.node_id.as_str()).collect();
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn test_rejects_single_slot_sets() {
        let store = Store::new();
        let cluster_id = store.update(|db| Ok(seed_cluster(db, 3))).unwrap();
        let mut bad = opts();
        bad.set_size = 1;

        let err = store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                ArbiterBrickPlacer::new().place_all(&mut source, &bad, None)
            })
            .unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[test]
    fn test_pools_honor_node_eligibility() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| {
                Ok(seed_tagged_cluster(
                    db,
                    &[
                        ArbiterSupport::Required,
                        ArbiterSupport::Required,
                        ArbiterSupport::Disabled,
                        ArbiterSupport::Disabled,
                        ArbiterSupport::Disabled,
                    ],
                ))
            })
            .unwrap();

        // every seed must keep arbiters on arbiter-capable nodes and
        // data off the arbiter-only ones
        store
            .view(|db| {
                for i in 0..40 {
                    let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                    let mut o = opts();
                    o.volume_id = format!("vol-{i}");
                    let allocation =
                        ArbiterBrickPlacer::new().place_all(&mut source, &o, None)?;
                    for (slot, brick) in allocation.brick_sets[0].bricks.iter().enumerate() {
                        let support = db.node(&brick.node_id)?.arbiter;
                        if slot == o.set_size - 1 {
                            assert!(support.can_host_arbiter());
                        } else {
                            assert!(support.can_host_data());
                        }
                    }
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_device_override_restricts_pools() {
        let store = Store::new();
        let (cluster_id, arbiter_device) = store
            .update(|db| {
                let cluster_id = seed_tagged_cluster(db, &vec![ArbiterSupport::Disabled; 4]);
                // one device opts back in as arbiter-only
                let victim = db.device_ids()[0].clone();
                let mut device = db.device(&victim)?;
                device.arbiter = Some(ArbiterSupport::Required);
                db.put_device(device);
                Ok((cluster_id, victim))
            })
            .unwrap();

        store
            .view(|db| {
                for i in 0..10 {
                    let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                    let mut o = opts();
                    o.volume_id = format!("vol-{i}");
                    let allocation =
                        ArbiterBrickPlacer::new().place_all(&mut source, &o, None)?;
                    let bs = &allocation.brick_sets[0];
                    assert_eq!(bs.bricks[2].device_id, arbiter_device);
                    assert!(bs.bricks[..2].iter().all(|b| b.device_id != arbiter_device));
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_no_arbiter_devices_is_no_space() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_tagged_cluster(db, &vec![ArbiterSupport::Disabled; 5])))
            .unwrap();

        let err = store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                ArbiterBrickPlacer::new().place_all(&mut source, &opts(), None)
            })
            .unwrap_err();
        assert!(matches!(err, Error::NoSpace));
    }

    #[test]
    fn test_arbiter_replace_stays_in_pool() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| {
                Ok(seed_tagged_cluster(
                    db,
                    &[
                        ArbiterSupport::Required,
                        ArbiterSupport::Required,
                        ArbiterSupport::Disabled,
                        ArbiterSupport::Disabled,
                        ArbiterSupport::Disabled,
                    ],
                ))
            })
            .unwrap();

        store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                let placer = ArbiterBrickPlacer::new();
                let allocation = placer.place_all(&mut source, &opts(), None)?;
                let bs = &allocation.brick_sets[0];

                let replacement = placer.replace(&mut source, &opts(), None, bs, 2)?;
                assert_ne!(replacement.device_id, bs.bricks[2].device_id);
                assert!(db.node(&replacement.node_id)?.arbiter.can_host_arbiter());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_arbiter_replace_keeps_discounted_size() {
        let store = Store::new();
        let cluster_id = store.update(|db| Ok(seed_cluster(db, 5))).unwrap();

        store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                let placer = ArbiterBrickPlacer::new();
                let allocation = placer.place_all(&mut source, &opts(), None)?;
                let bs = &allocation.brick_sets[0];

                let replacement = placer.replace(&mut source, &opts(), None, bs, 2)?;
                assert_eq!(replacement.size_kb, GB);
                assert_ne!(replacement.device_id, bs.bricks[2].device_id);
                Ok(())
            })
            .unwrap();
    }
}
