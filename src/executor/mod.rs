//! Executor boundary
//!
//! The executor performs the actual brick/volume operations on remote
//! storage hosts. The control plane only ever talks to this trait; the
//! concrete transport (SSH, an agent, a mock) lives behind it. Calls
//! may fail or time out; the operation engine decides what to do with
//! the error.

pub mod mock;

pub use mock::MockExecutor;

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

// =============================================================================
// Request / Response Types
// =============================================================================

/// Remote identity of one brick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrickSpec {
    pub id: String,
    /// Data path hostname of the node carrying the brick.
    pub host: String,
    /// Filesystem path of the brick on its host.
    pub path: String,
    /// Size in KiB.
    pub size_kb: u64,
}

/// Durability parameters passed to the remote volume create
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum VolumeDurabilitySpec {
    None,
    Replicate { replica: u32, arbiter: bool },
    Disperse { data: u32, redundancy: u32 },
}

/// Remote volume create/expand request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    pub durability: VolumeDurabilitySpec,
    pub bricks: Vec<BrickSpec>,
}

/// Information reported back by the storage system for a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub brick_count: usize,
}

/// Self-heal status of a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealInfo {
    /// Entries still waiting to be healed.
    pub pending_entries: u64,
}

/// Remote block volume create request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockVolumeRequest {
    pub name: String,
    pub hosting_volume: String,
    pub size_gb: u64,
}

/// Information reported back for a block volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockVolumeInfo {
    pub name: String,
    /// iSCSI target IQN assigned by the storage system.
    pub iqn: String,
    /// Usable size in GiB after block-layer overhead.
    pub usable_size_gb: u64,
}

// =============================================================================
// Executor Trait
// =============================================================================

/// Capability interface for the remote storage toolset, one method per
/// remote action. Every call targets one management host.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn brick_create(&self, host: &str, brick: &BrickSpec) -> Result<()>;
    async fn brick_destroy(&self, host: &str, brick: &BrickSpec) -> Result<()>;

    async fn volume_create(&self, host: &str, req: &VolumeRequest) -> Result<VolumeInfo>;
    async fn volume_destroy(&self, host: &str, volume: &str) -> Result<()>;
    async fn volume_expand(&self, host: &str, req: &VolumeRequest) -> Result<VolumeInfo>;
    async fn volume_info(&self, host: &str, volume: &str) -> Result<VolumeInfo>;
    async fn volume_replace_brick(
        &self,
        host: &str,
        volume: &str,
        old: &BrickSpec,
        new: &BrickSpec,
    ) -> Result<()>;
    async fn heal_info(&self, host: &str, volume: &str) -> Result<HealInfo>;

    async fn block_volume_create(
        &self,
        host: &str,
        req: &BlockVolumeRequest,
    ) -> Result<BlockVolumeInfo>;
    async fn block_volume_destroy(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
    ) -> Result<()>;
    async fn block_volume_expand(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
        new_size_gb: u64,
    ) -> Result<BlockVolumeInfo>;
    async fn block_volume_info(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
    ) -> Result<BlockVolumeInfo>;

    /// Liveness probe of the storage daemon on a host.
    async fn glusterd_check(&self, host: &str) -> Result<()>;
}

pub type ExecutorRef = Arc<dyn Executor>;

// =============================================================================
// Host Fan-Out
// =============================================================================

/// Run the closure against every host concurrently and return the
/// first success. Only when all hosts fail is an error returned,
/// carrying the individual failures.
pub async fn try_on_hosts<F, Fut, T>(hosts: Vec<String>, f: F) -> Result<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if hosts.is_empty() {
        return Err(Error::AllHostsFailed("no hosts available".into()));
    }
    let mut pending: FuturesUnordered<_> = hosts
        .into_iter()
        .map(|host| {
            let fut = f(host.clone());
            async move { (host, fut.await) }
        })
        .collect();

    let mut failures = Vec::new();
    while let Some((host, result)) = pending.next().await {
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(host = %host, error = %err, "host attempt failed");
                failures.push(format!("{host}: {err}"));
            }
        }
    }
    Err(Error::AllHostsFailed(failures.join("; ")))
}
