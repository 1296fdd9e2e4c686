//! Standard placer
//!
//! Fills every slot of every set with a full-size data brick, walking
//! the cluster's devices in the seeded ring order. Each pulled device
//! is consumed whether or not it was usable, so successive sets spread
//! across the ring instead of piling onto its head.

use super::{BrickAllocation, BrickPlacer, BrickSet, DeviceFilter, DeviceSet, PlacementOpts};
use crate::allocator::{ClusterDeviceSource, DeviceCursor, DeviceRing, RingDevice};
use crate::entities::{BrickEntry, DeviceEntry, NodeEntry};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct StandardBrickPlacer;

impl StandardBrickPlacer {
    pub fn new() -> StandardBrickPlacer {
        StandardBrickPlacer
    }
}

/// Seeded walk over every device in the snapshot.
pub(super) fn device_walk(source: &ClusterDeviceSource, seed: &str) -> DeviceCursor {
    restricted_device_walk(source, seed, |_, _| true)
}

/// Seeded walk over the subset of devices `eligible` accepts.
pub(super) fn restricted_device_walk(
    source: &ClusterDeviceSource,
    seed: &str,
    eligible: impl Fn(&NodeEntry, &DeviceEntry) -> bool,
) -> DeviceCursor {
    let mut ring = DeviceRing::new();
    for (node, device) in source.ring_members() {
        if !eligible(node, device) {
            continue;
        }
        ring.add(RingDevice {
            device_id: device.id.clone(),
            node_id: node.id.clone(),
        });
    }
    DeviceCursor::new(ring.ordered(seed))
}

/// True when a brick of the set other than the `skip` slot already sits
/// in the given zone.
pub(super) fn zone_clash(
    source: &ClusterDeviceSource,
    set: &BrickSet,
    skip: Option<usize>,
    zone: u32,
) -> bool {
    set.bricks.iter().enumerate().any(|(i, b)| {
        skip != Some(i)
            && source
                .node(&b.node_id)
                .map(|n| n.zone == zone)
                .unwrap_or(false)
    })
}

/// Pull devices from the cursor until one accepts a brick of the given
/// size for this set.
pub(super) fn fill_slot(
    cursor: &mut DeviceCursor,
    source: &mut ClusterDeviceSource,
    opts: &PlacementOpts,
    filter: Option<DeviceFilter<'_>>,
    set: &BrickSet,
    size_kb: u64,
) -> Result<(BrickEntry, String)> {
    for device_id in cursor.by_ref() {
        {
            let device = source.device(&device_id)?;
            if set.uses_node(&device.node_id) {
                continue;
            }
            if opts.zone_diverse {
                let zone = source.node(&device.node_id)?.zone;
                if zone_clash(source, set, None, zone) {
                    continue;
                }
            }
            if let Some(f) = filter {
                if !f(set, device) {
                    continue;
                }
            }
        }
        if let Some(brick) = source.device_mut(&device_id)?.new_brick(size_kb, &opts.volume_id) {
            return Ok((brick, device_id));
        }
    }
    Err(Error::NoSpace)
}

impl BrickPlacer for StandardBrickPlacer {
    fn place_all(
        &self,
        source: &mut ClusterDeviceSource,
        opts: &PlacementOpts,
        filter: Option<DeviceFilter<'_>>,
    ) -> Result<BrickAllocation> {
        let mut cursor = device_walk(source, &opts.volume_id);
        let mut brick_sets = Vec::with_capacity(opts.set_count);
        let mut device_sets = Vec::with_capacity(opts.set_count);

        for _ in 0..opts.set_count {
            let mut bs = BrickSet::new(opts.set_size);
            let mut ds = DeviceSet::new(opts.set_size);
            while !bs.full() {
                let (brick, device_id) =
                    fill_slot(&mut cursor, source, opts, filter, &bs, opts.brick_size_kb)?;
                bs.add(brick);
                ds.add(&device_id);
            }
            brick_sets.push(bs);
            device_sets.push(ds);
        }

        tracing::debug!(
            volume = %opts.volume_id,
            sets = opts.set_count,
            set_size = opts.set_size,
            brick_size_kb = opts.brick_size_kb,
            "placed brick sets"
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
        let cursor = device_walk(source, &opts.volume_id);
        replace_slot(cursor, source, opts, filter, set, index)
    }
}

/// Walk the cursor for a replacement brick for slot `index`: never the
/// old device, never a node or (when zone diverse) a zone used by the
/// other slots. The replacement keeps the old brick's size.
pub(super) fn replace_slot(
    mut cursor: DeviceCursor,
    source: &mut ClusterDeviceSource,
    opts: &PlacementOpts,
    filter: Option<DeviceFilter<'_>>,
    set: &BrickSet,
    index: usize,
) -> Result<BrickEntry> {
    let old_device = set.bricks[index].device_id.clone();
    let size_kb = set.bricks[index].size_kb;
    while let Some(device_id) = cursor.next() {
        if device_id == old_device {
            continue;
        }
        {
            let device = source.device(&device_id)?;
            let node_clash = set
                .bricks
                .iter()
                .enumerate()
                .any(|(i, b)| i != index && b.node_id == device.node_id);
            if node_clash {
                continue;
            }
            if opts.zone_diverse {
                let zone = source.node(&device.node_id)?.zone;
                if zone_clash(source, set, Some(index), zone) {
                    continue;
                }
            }
            if let Some(f) = filter {
                if !f(set, device) {
                    continue;
                }
            }
        }
        if let Some(brick) = source.device_mut(&device_id)?.new_brick(size_kb, &opts.volume_id) {
            cursor.close();
            return Ok(brick);
        }
    }
    Err(Error::NoSpace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GB;
    use crate::entities::{ClusterEntry, DeviceEntry, NodeEntry};
    use crate::store::{Db, Store};
    use std::collections::HashSet;

    fn seed_cluster(db: &mut Db, nodes: usize, devices_per_node: usize, device_kb: u64) -> String {
        let mut cluster = ClusterEntry::new(true, true);
        for n in 0..nodes {
            let mut node = NodeEntry::new(
                &cluster.id,
                n as u32,
                &format!("manage{n}"),
                &format!("storage{n}"),
            );
            for _ in 0..devices_per_node {
                let device = DeviceEntry::new(&node.id, "/dev/sdb", device_kb);
                node.device_add(&device.id);
                db.put_device(device);
            }
            cluster.node_add(&node.id);
            db.put_node(node);
        }
        let id = cluster.id.clone();
        db.put_cluster(cluster);
        id
    }

    fn seed_zoned_cluster(db: &mut Db, zones: &[u32]) -> String {
        let mut cluster = ClusterEntry::new(true, true);
        for (n, zone) in zones.iter().enumerate() {
            let mut node = NodeEntry::new(
                &cluster.id,
                *zone,
                &format!("manage{n}"),
                &format!("storage{n}"),
            );
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

    fn opts(sets: usize, set_size: usize, brick_kb: u64) -> PlacementOpts {
        PlacementOpts {
            volume_id: "vol-1".into(),
            brick_size_kb: brick_kb,
            set_size,
            set_count: sets,
            arbiter_discount_factor: 64,
            zone_diverse: false,
        }
    }

    #[test]
    fn test_sets_are_node_diverse() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_cluster(db, 6, 2, 500 * GB)))
            .unwrap();

        let allocation = store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                StandardBrickPlacer::new().place_all(&mut source, &opts(2, 3, 10 * GB), None)
            })
            .unwrap();

        assert_eq!(allocation.brick_sets.len(), 2);
        for bs in &allocation.brick_sets {
            assert!(bs.full());
            let nodes: HashSet<&str> = bs.bricks.iter().map(|b| b.node_id.as_str()).collect();
            assert_eq!(nodes.len(), 3);
        }
    }

    #[test]
    fn test_too_few_nodes_is_no_space() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_cluster(db, 2, 4, 500 * GB)))
            .unwrap();

        let err = store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                StandardBrickPlacer::new().place_all(&mut source, &opts(1, 3, 10 * GB), None)
            })
            .unwrap_err();
        assert!(matches!(err, Error::NoSpace));
    }

    #[test]
    fn test_failed_placement_commits_nothing() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_cluster(db, 2, 1, 500 * GB)))
            .unwrap();

        let result = store.update(|db| {
            let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
            let allocation =
                StandardBrickPlacer::new().place_all(&mut source, &opts(1, 3, 10 * GB), None)?;
            source.persist(db);
            Ok(allocation)
        });
        assert!(result.is_err());

        store
            .view(|db| {
                for id in db.device_ids() {
                    assert_eq!(db.device(&id)?.used_kb, 0);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_filter_vetoes_devices() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_cluster(db, 4, 1, 500 * GB)))
            .unwrap();
        let banned = store.view(|db| Ok(db.device_ids()[0].clone())).unwrap();

        let allocation = store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                let ban = banned.clone();
                let filter = move |_bs: &BrickSet, d: &DeviceEntry| d.id != ban;
                StandardBrickPlacer::new().place_all(&mut source, &opts(1, 3, 10 * GB), Some(&filter))
            })
            .unwrap();

        assert!(allocation.bricks().all(|b| b.device_id != banned));
    }

    #[test]
    fn test_zone_diverse_sets_span_zones() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_zoned_cluster(db, &[0, 0, 1, 1])))
            .unwrap();

        // whatever the seeded walk order, the set must span both zones
        store
            .view(|db| {
                for i in 0..20 {
                    let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                    let mut o = opts(1, 2, 10 * GB);
                    o.volume_id = format!("vol-{i}");
                    o.zone_diverse = true;
                    let allocation =
                        StandardBrickPlacer::new().place_all(&mut source, &o, None)?;
                    let bs = &allocation.brick_sets[0];
                    let zones: HashSet<u32> = bs
                        .bricks
                        .iter()
                        .map(|b| db.node(&b.node_id).unwrap().zone)
                        .collect();
                    assert_eq!(zones.len(), 2);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_zone_diverse_needs_enough_zones() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_zoned_cluster(db, &[0, 0, 0])))
            .unwrap();
        let mut o = opts(1, 2, 10 * GB);
        o.zone_diverse = true;

        // three nodes in one zone can host a node-diverse set but not a
        // zone-diverse one
        let err = store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                StandardBrickPlacer::new().place_all(&mut source, &o, None)
            })
            .unwrap_err();
        assert!(matches!(err, Error::NoSpace));

        o.zone_diverse = false;
        store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                StandardBrickPlacer::new().place_all(&mut source, &o, None)
            })
            .unwrap();
    }

    #[test]
    fn test_zone_diverse_replace_keeps_zone_spread() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_zoned_cluster(db, &[0, 0, 1])))
            .unwrap();
        let mut o = opts(1, 2, 10 * GB);
        o.zone_diverse = true;

        store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                let placer = StandardBrickPlacer::new();
                let allocation = placer.place_all(&mut source, &o, None)?;
                let bs = &allocation.brick_sets[0];
                let index = bs
                    .bricks
                    .iter()
                    .position(|b| db.node(&b.node_id).unwrap().zone == 0)
                    .unwrap();

                // the only legal replacement is the other zone 0 node
                let replacement = placer.replace(&mut source, &o, None, bs, index)?;
                assert_eq!(db.node(&replacement.node_id)?.zone, 0);
                assert_ne!(replacement.device_id, bs.bricks[index].device_id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_replace_avoids_set_nodes_and_old_device() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_cluster(db, 4, 1, 500 * GB)))
            .unwrap();

        store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                let placer = StandardBrickPlacer::new();
                let allocation = placer.place_all(&mut source, &opts(1, 3, 10 * GB), None)?;
                let bs = &allocation.brick_sets[0];

                let replacement = placer.replace(&mut source, &opts(1, 3, 10 * GB), None, bs, 1)?;
                assert_ne!(replacement.device_id, bs.bricks[1].device_id);
                for (i, b) in bs.bricks.iter().enumerate() {
                    if i != 1 {
                        assert_ne!(replacement.node_id, b.node_id);
                    }
                }
                assert_eq!(replacement.size_kb, bs.bricks[1].size_kb);
                Ok(())
            })
            .unwrap();
    }
}
