//! Volume entries
//!
//! A volume is a file volume assembled from brick sets distributed
//! across a cluster. Volumes flagged for block hosting reserve part of
//! their capacity and carve block volumes out of the remainder.

use super::new_id;
use crate::config::{Config, GB};
use crate::durability::Durability;
use serde::{Deserialize, Serialize};

/// Block-hosting metadata carried by volumes that host block volumes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockHostingInfo {
    /// GiB still available for new block volumes.
    pub free_size_gb: u64,
    /// GiB held back and never handed to block volumes.
    pub reserved_size_gb: u64,
    /// Block volumes carved from this volume.
    pub block_volumes: Vec<String>,
}

/// A file volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeEntry {
    pub id: String,
    pub name: String,
    pub cluster_id: String,
    /// Requested size in GiB.
    pub size_gb: u64,
    pub durability: Durability,
    /// Brick ids, grouped set after set in placement order.
    pub bricks: Vec<String>,
    /// Present when this volume hosts block volumes.
    pub block_info: Option<BlockHostingInfo>,
    /// Id of the pending operation that owns this volume, empty once
    /// the volume is fully realized.
    pub pending_id: Option<String>,
}

impl VolumeEntry {
    pub fn new(name: &str, size_gb: u64, durability: Durability) -> VolumeEntry {
        let id = new_id();
        let name = if name.is_empty() {
            format!("vol_{id}")
        } else {
            name.to_string()
        };
        VolumeEntry {
            id,
            name,
            cluster_id: String::new(),
            size_gb,
            durability,
            bricks: Vec::new(),
            block_info: None,
            pending_id: None,
        }
    }

    /// Construct an auto-provisioned block hosting volume sized and
    /// reserved per the configuration.
    pub fn new_block_hosting(config: &Config) -> VolumeEntry {
        let size_gb = config.block_hosting_volume_size_gb;
        let usable = config.block_hosting_usable_size_gb();
        let mut vol = VolumeEntry::new(
            "",
            size_gb,
            Durability::Replicate {
                replica: config.default_replica,
                arbiter: false,
            },
        );
        vol.block_info = Some(BlockHostingInfo {
            free_size_gb: usable,
            reserved_size_gb: size_gb - usable,
            block_volumes: Vec::new(),
        });
        vol
    }

    pub fn is_pending(&self) -> bool {
        self.pending_id.is_some()
    }

    /// Requested size in KiB, the unit the placer works in.
    pub fn size_kb(&self) -> u64 {
        self.size_gb * GB
    }

    /// True when this volume can host a new block volume of the given
    /// size.
    pub fn can_host_block_volume(&self, size_gb: u64) -> bool {
        match &self.block_info {
            Some(info) => !self.is_pending() && info.free_size_gb >= size_gb,
            None => false,
        }
    }

    /// Reserve hosting capacity for a block volume.
    pub fn block_volume_add(&mut self, id: &str, size_gb: u64) {
        if let Some(info) = self.block_info.as_mut() {
            info.free_size_gb -= size_gb;
            info.block_volumes.push(id.to_string());
        }
    }

    /// Release hosting capacity held by a block volume.
    pub fn block_volume_delete(&mut self, id: &str, size_gb: u64) {
        if let Some(info) = self.block_info.as_mut() {
            info.free_size_gb += size_gb;
            info.block_volumes.retain(|b| b != id);
        }
    }

    pub fn brick_add(&mut self, id: &str) {
        self.bricks.push(id.to_string());
    }

    pub fn brick_delete(&mut self, id: &str) {
        self.bricks.retain(|b| b != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_block_hosting_accounting() {
        let config = Config::default();
        let mut vol = VolumeEntry::new_block_hosting(&config);
        let info = vol.block_info.as_ref().unwrap();
        assert_eq!(
            info.free_size_gb + info.reserved_size_gb,
            config.block_hosting_volume_size_gb
        );

        assert!(vol.can_host_block_volume(100));
        vol.block_volume_add("bv1", 100);
        let free_after = vol.block_info.as_ref().unwrap().free_size_gb;
        assert_eq!(free_after, config.block_hosting_usable_size_gb() - 100);

        vol.block_volume_delete("bv1", 100);
        assert_eq!(
            vol.block_info.as_ref().unwrap().free_size_gb,
            config.block_hosting_usable_size_gb()
        );
    }

    #[test]
    fn test_pending_volume_cannot_host() {
        let config = Config::default();
        let mut vol = VolumeEntry::new_block_hosting(&config);
        vol.pending_id = Some("op1".into());
        assert!(!vol.can_host_block_volume(1));
    }

    #[test]
    fn test_generated_name() {
        let vol = VolumeEntry::new("", 10, Durability::None);
        assert!(vol.name.starts_with("vol_"));
        let named = VolumeEntry::new("data", 10, Durability::None);
        assert_eq!(named.name, "data");
    }
}
