//! Domain entities managed by the entity store
//!
//! Each entity is identified by an opaque unique id and is mutated only
//! inside a store transaction. References between entities (cluster
//! membership, device brick lists, pending tags) are kept mutually
//! consistent by the operation engine.

pub mod block_volume;
pub mod brick;
pub mod cluster;
pub mod device;
pub mod node;
pub mod pending;
pub mod volume;

pub use block_volume::BlockVolumeEntry;
pub use brick::BrickEntry;
pub use cluster::ClusterEntry;
pub use device::DeviceEntry;
pub use node::{ArbiterSupport, NodeEntry};
pub use pending::{
    PendingAction, PendingChange, PendingOperationEntry, PendingOperationType, PendingStatus,
};
pub use volume::{BlockHostingInfo, VolumeEntry};

use serde::{Deserialize, Serialize};

/// Generate a fresh opaque entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Administrative state shared by nodes and devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Online,
    Offline,
    Failed,
}

impl EntryState {
    pub fn is_online(&self) -> bool {
        matches!(self, EntryState::Online)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Online => write!(f, "online"),
            EntryState::Offline => write!(f, "offline"),
            EntryState::Failed => write!(f, "failed"),
        }
    }
}
