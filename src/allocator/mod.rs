//! Capacity allocator
//!
//! Keeps one in-memory device ring per cluster, rebuilt from the store
//! at startup and maintained incrementally as topology changes commit.
//! Placement asks the allocator for a seeded walk over a cluster's
//! devices and consumes only as much of it as it needs.

pub mod ring;
pub mod source;

pub use ring::{DeviceCursor, DeviceRing, RingDevice};
pub use source::ClusterDeviceSource;

use crate::entities::{DeviceEntry, NodeEntry};
use crate::error::{Error, Result};
use crate::health::NodeHealthCache;
use crate::store::Db;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-cluster device rings
#[derive(Debug, Default)]
pub struct Allocator {
    rings: Mutex<HashMap<String, DeviceRing>>,
    health: Option<Arc<NodeHealthCache>>,
}

impl Allocator {
    pub fn new() -> Allocator {
        Allocator::default()
    }

    /// Allocator that additionally skips devices on nodes the health
    /// monitor has observed down.
    pub fn with_health(health: Arc<NodeHealthCache>) -> Allocator {
        Allocator {
            rings: Mutex::new(HashMap::new()),
            health: Some(health),
        }
    }

    /// Rebuild every ring from the current database contents. Offline
    /// nodes and devices are left out.
    pub fn load_from_store(&self, db: &Db) -> Result<()> {
        let mut rings = HashMap::new();
        for cluster_id in db.cluster_ids() {
            rings.insert(cluster_id.clone(), build_ring(db, &cluster_id)?);
        }
        let n = rings.len();
        *self.rings.lock() = rings;
        tracing::info!(clusters = n, "allocator rings loaded");
        Ok(())
    }

    /// Register a newly created cluster with an empty ring.
    pub fn add_cluster(&self, cluster_id: &str) {
        self.rings
            .lock()
            .entry(cluster_id.to_string())
            .or_default();
    }

    pub fn remove_cluster(&self, cluster_id: &str) {
        self.rings.lock().remove(cluster_id);
    }

    /// Add one device to its cluster's ring. The cluster ring is
    /// created on first use.
    pub fn add_device(&self, node: &NodeEntry, device: &DeviceEntry) {
        self.rings
            .lock()
            .entry(node.cluster_id.clone())
            .or_default()
            .add(RingDevice {
                device_id: device.id.clone(),
                node_id: node.id.clone(),
            });
    }

    pub fn remove_device(&self, cluster_id: &str, device_id: &str) {
        if let Some(ring) = self.rings.lock().get_mut(cluster_id) {
            ring.remove(device_id);
        }
    }

    /// Seeded walk over a cluster's online devices. Unknown clusters
    /// and clusters with no usable devices yield a not-found error.
    pub fn get_nodes(&self, db: &Db, cluster_id: &str, seed: &str) -> Result<DeviceCursor> {
        let mut rings = self.rings.lock();
        let ring = match rings.get(cluster_id) {
            Some(ring) => ring,
            None => {
                // Lazily admit clusters created since the last load.
                let ring = build_ring(db, cluster_id)?;
                rings.entry(cluster_id.to_string()).or_insert(ring)
            }
        };
        if ring.is_empty() {
            return Err(Error::not_found(cluster_id));
        }
        let mut ordered = ring.ordered(seed);
        if let Some(health) = &self.health {
            // A node is skipped only on an observed-down probe; nodes the
            // monitor has not reached yet stay eligible.
            ordered.retain(|id| {
                ring.node_of(id)
                    .map_or(true, |node| health.is_healthy(node) != Some(false))
            });
        }
        if ordered.is_empty() {
            return Err(Error::not_found(cluster_id));
        }
        Ok(DeviceCursor::new(ordered))
    }

    /// Device count of one cluster's ring.
    pub fn ring_size(&self, cluster_id: &str) -> usize {
        self.rings
            .lock()
            .get(cluster_id)
            .map(DeviceRing::len)
            .unwrap_or(0)
    }
}

fn build_ring(db: &Db, cluster_id: &str) -> Result<DeviceRing> {
    let source = ClusterDeviceSource::new(db, cluster_id)?;
    let mut ring = DeviceRing::new();
    for (node, device) in source.ring_members() {
        ring.add(RingDevice {
            device_id: device.id.clone(),
            node_id: node.id.clone(),
        });
    }
    Ok(ring)
}
