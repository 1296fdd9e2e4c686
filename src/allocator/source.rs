//! Cluster device snapshot
//!
//! The placer works against a snapshot of one cluster's online nodes
//! and devices taken inside a transaction. Device mutations accumulate
//! in the snapshot and are written back in one step, so an abandoned
//! placement attempt leaves the database untouched.

use crate::entities::{DeviceEntry, NodeEntry};
use crate::error::{Error, Result};
use crate::store::Db;
use std::collections::HashMap;

/// Snapshot of one cluster's usable topology
#[derive(Debug, Clone)]
pub struct ClusterDeviceSource {
    cluster_id: String,
    nodes: HashMap<String, NodeEntry>,
    devices: HashMap<String, DeviceEntry>,
}

impl ClusterDeviceSource {
    /// Capture the online nodes and online devices of a cluster.
    pub fn new(db: &Db, cluster_id: &str) -> Result<ClusterDeviceSource> {
        let cluster = db.cluster(cluster_id)?;
        let mut nodes = HashMap::new();
        let mut devices = HashMap::new();
        for node_id in &cluster.nodes {
            let node = db.node(node_id)?;
            if !node.state.is_online() {
                continue;
            }
            for device_id in &node.devices {
                let device = db.device(device_id)?;
                if device.state.is_online() {
                    devices.insert(device.id.clone(), device);
                }
            }
            nodes.insert(node.id.clone(), node);
        }
        Ok(ClusterDeviceSource {
            cluster_id: cluster_id.to_string(),
            nodes,
            devices,
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn node(&self, node_id: &str) -> Result<&NodeEntry> {
        self.nodes.get(node_id).ok_or_else(|| Error::not_found(node_id))
    }

    pub fn device(&self, device_id: &str) -> Result<&DeviceEntry> {
        self.devices
            .get(device_id)
            .ok_or_else(|| Error::not_found(device_id))
    }

    pub fn device_mut(&mut self, device_id: &str) -> Result<&mut DeviceEntry> {
        self.devices
            .get_mut(device_id)
            .ok_or_else(|| Error::not_found(device_id))
    }

    /// Node and device records for the ring, in no particular order.
    pub fn ring_members(&self) -> Vec<(&NodeEntry, &DeviceEntry)> {
        self.devices
            .values()
            .filter_map(|d| self.nodes.get(&d.node_id).map(|n| (n, d)))
            .collect()
    }

    /// Write every device in the snapshot back into the transaction.
    pub fn persist(&self, db: &mut Db) {
        for device in self.devices.values() {
            db.put_device(device.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{ClusterEntry, EntryState};
    use crate::store::Store;

    fn seed_cluster(db: &mut Db, node_count: usize, devices_per_node: usize) -> String {
        let mut cluster = ClusterEntry::new(true, true);
        for n in 0..node_count {
            let mut node = NodeEntry::new(
                &cluster.id,
                (n % 2) as u32,
                &format!("manage{n}"),
                &format!("storage{n}"),
            );
            for _ in 0..devices_per_node {
                let device = DeviceEntry::new(&node.id, "/dev/sda", 100 * 1024 * 1024);
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

    #[test]
    fn test_snapshot_skips_offline() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| {
                let id = seed_cluster(db, 3, 2);
                // take one node and one separate device offline
                let node_ids = db.node_ids();
                let mut node = db.node(&node_ids[0])?;
                node.state = EntryState::Offline;
                db.put_node(node.clone());
                let victim = db
                    .device_ids()
                    .into_iter()
                    .map(|id| db.device(&id).unwrap())
                    .find(|d| d.node_id != node.id)
                    .unwrap();
                let mut dev = victim;
                dev.state = EntryState::Failed;
                db.put_device(dev);
                Ok(id)
            })
            .unwrap();

        store
            .view(|db| {
                let source = ClusterDeviceSource::new(db, &cluster_id)?;
                // 3 nodes * 2 devices, minus one offline node's 2 and one failed device
                assert_eq!(source.ring_members().len(), 3);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_persist_writes_mutations_back() {
        let store = Store::new();
        let cluster_id = store
            .update(|db| Ok(seed_cluster(db, 1, 1)))
            .unwrap();
        let device_id = store.view(|db| Ok(db.device_ids()[0].clone())).unwrap();

        store
            .update(|db| {
                let mut source = ClusterDeviceSource::new(db, &cluster_id)?;
                source.device_mut(&device_id)?.storage_allocate(4096);
                source.persist(db);
                Ok(())
            })
            .unwrap();

        let dev = store.view(|db| db.device(&device_id)).unwrap();
        assert_eq!(dev.used_kb, 4096);
    }
}
