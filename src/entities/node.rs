//! Node entries
//!
//! A node belongs to exactly one cluster, carries an operator-assigned
//! zone used as a failure-domain hint by the placers, and hosts raw
//! block devices.

use super::{new_id, EntryState};
use serde::{Deserialize, Serialize};

/// Which brick roles a node's devices may hold. A device inherits its
/// node's setting unless it carries its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArbiterSupport {
    /// May hold data bricks and arbiter bricks.
    #[default]
    Supported,
    /// Holds arbiter bricks only, never data.
    Required,
    /// Holds data bricks only, never arbiters.
    Disabled,
}

impl ArbiterSupport {
    pub fn can_host_arbiter(self) -> bool {
        matches!(self, ArbiterSupport::Supported | ArbiterSupport::Required)
    }

    pub fn can_host_data(self) -> bool {
        matches!(self, ArbiterSupport::Supported | ArbiterSupport::Disabled)
    }
}

/// A storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub cluster_id: String,
    /// Failure domain assigned by the operator.
    pub zone: u32,
    /// Hostname used for management commands.
    pub manage_hostname: String,
    /// Hostname used for the storage data path.
    pub storage_hostname: String,
    /// Devices attached to this node.
    pub devices: Vec<String>,
    pub state: EntryState,
    /// Arbiter eligibility of this node's devices, unless a device
    /// overrides it.
    #[serde(default)]
    pub arbiter: ArbiterSupport,
}

impl NodeEntry {
    pub fn new(
        cluster_id: &str,
        zone: u32,
        manage_hostname: &str,
        storage_hostname: &str,
    ) -> NodeEntry {
        NodeEntry {
            id: new_id(),
            cluster_id: cluster_id.to_string(),
            zone,
            manage_hostname: manage_hostname.to_string(),
            storage_hostname: storage_hostname.to_string(),
            devices: Vec::new(),
            state: EntryState::Online,
            arbiter: ArbiterSupport::default(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.is_online()
    }

    pub fn device_add(&mut self, id: &str) {
        self.devices.push(id.to_string());
    }

    pub fn device_delete(&mut self, id: &str) {
        self.devices.retain(|d| d != id);
    }
}
