//! Brickyard - Volume Provisioning Control Plane
//!
//! A control plane for provisioning replicated storage volumes across a
//! fleet of storage nodes. Volumes are carved into bricks placed on
//! individual devices; every externally visible state change runs as a
//! multi-phase pending operation so that a crash at any point leaves a
//! durable ledger entry describing exactly what must be cleaned up.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           App                                  │
//! ├────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────┐  │
//! │  │    Operations    │  │    Allocator     │  │    Health    │  │
//! │  │  build / exec /  │  │  per-cluster     │  │   periodic   │  │
//! │  │ rollback / final │  │  device rings    │  │  node probes │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └──────┬───────┘  │
//! │           │                     │                   │          │
//! │  ┌────────┴─────────────────────┴───────────────────┴───────┐  │
//! │  │                   Transactional Store                    │  │
//! │  │  clusters / nodes / devices / bricks / volumes / ledger  │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! ├────────────────────────────────────────────────────────────────┤
//! │              Executor (remote storage daemons)                 │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`ops`]: Pending operation engine and the concrete volume, block
//!   volume, and device operations
//! - [`allocator`]: Seeded hash rings ordering devices per cluster
//! - [`placer`]: Brick set placement with node diversity
//! - [`store`]: Copy-on-write transactions over the entity collections
//! - [`executor`]: Remote execution trait plus a mock for tests
//! - [`error`]: Error types and handling

pub mod allocator;
pub mod app;
pub mod config;
pub mod durability;
pub mod entities;
pub mod error;
pub mod executor;
pub mod health;
pub mod ops;
pub mod placer;
pub mod store;

// Re-export commonly used types
pub use app::App;

pub use allocator::Allocator;

pub use config::Config;

pub use durability::Durability;

pub use entities::{
    BlockVolumeEntry, BrickEntry, ClusterEntry, DeviceEntry, EntryState, NodeEntry,
    PendingOperationEntry, PendingStatus, VolumeEntry,
};

pub use error::{Error, Result};

pub use executor::{Executor, ExecutorRef, MockExecutor};

pub use health::{NodeHealthCache, NodeHealthMonitor};

pub use ops::{OpTracker, Operation, OperationCleaner};

pub use store::{Db, Store};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
