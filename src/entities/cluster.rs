//! Cluster entries
//!
//! A cluster groups storage nodes and records which volumes and block
//! volumes it hosts. Capability flags mark which workloads the cluster
//! accepts. Every referenced node/volume/block volume must reference
//! this cluster back.

use super::new_id;
use serde::{Deserialize, Serialize};

/// A cluster of storage nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub id: String,
    /// Member node ids.
    pub nodes: Vec<String>,
    /// File volumes hosted by this cluster.
    pub volumes: Vec<String>,
    /// Block volumes hosted by this cluster.
    pub block_volumes: Vec<String>,
    /// May host block workloads.
    pub block: bool,
    /// May host file workloads.
    pub file: bool,
}

impl ClusterEntry {
    pub fn new(block: bool, file: bool) -> ClusterEntry {
        ClusterEntry {
            id: new_id(),
            nodes: Vec::new(),
            volumes: Vec::new(),
            block_volumes: Vec::new(),
            block,
            file,
        }
    }

    pub fn node_add(&mut self, id: &str) {
        self.nodes.push(id.to_string());
    }

    pub fn node_delete(&mut self, id: &str) {
        self.nodes.retain(|n| n != id);
    }

    pub fn volume_add(&mut self, id: &str) {
        self.volumes.push(id.to_string());
    }

    pub fn volume_delete(&mut self, id: &str) {
        self.volumes.retain(|v| v != id);
    }

    pub fn block_volume_add(&mut self, id: &str) {
        self.block_volumes.push(id.to_string());
    }

    pub fn block_volume_delete(&mut self, id: &str) {
        self.block_volumes.retain(|v| v != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_bookkeeping() {
        let mut cluster = ClusterEntry::new(true, true);
        cluster.node_add("n1");
        cluster.node_add("n2");
        cluster.volume_add("v1");
        cluster.block_volume_add("bv1");

        assert_eq!(cluster.nodes.len(), 2);
        cluster.node_delete("n1");
        assert_eq!(cluster.nodes, vec!["n2".to_string()]);

        cluster.volume_delete("v1");
        assert!(cluster.volumes.is_empty());
        cluster.block_volume_delete("bv1");
        assert!(cluster.block_volumes.is_empty());
    }
}
