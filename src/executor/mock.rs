//! Mock executor for tests
//!
//! Succeeds on every call by default. Each method consults an optional
//! hook first, so a test can inject failures or observations for just
//! the calls it cares about. A call log records every remote action in
//! order.

use super::{
    BlockVolumeInfo, BlockVolumeRequest, BrickSpec, Executor, HealInfo, VolumeInfo, VolumeRequest,
};
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

type Hook = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;

#[derive(Default)]
pub struct MockExecutor {
    /// Every remote action performed, as "method host subject" strings.
    pub calls: Mutex<Vec<String>>,
    pub on_brick_create: RwLock<Option<Hook>>,
    pub on_brick_destroy: RwLock<Option<Hook>>,
    pub on_volume_create: RwLock<Option<Hook>>,
    pub on_volume_destroy: RwLock<Option<Hook>>,
    pub on_volume_expand: RwLock<Option<Hook>>,
    pub on_block_volume_create: RwLock<Option<Hook>>,
    pub on_block_volume_destroy: RwLock<Option<Hook>>,
    pub on_block_volume_expand: RwLock<Option<Hook>>,
    pub on_glusterd_check: RwLock<Option<Hook>>,
}

impl MockExecutor {
    pub fn new() -> Arc<MockExecutor> {
        Arc::new(MockExecutor::default())
    }

    pub fn set_hook(slot: &RwLock<Option<Hook>>, hook: impl Fn(&str) -> Result<()> + Send + Sync + 'static) {
        *slot.write() = Some(Box::new(hook));
    }

    fn log(&self, method: &str, host: &str, subject: &str) {
        self.calls.lock().push(format!("{method} {host} {subject}"));
    }

    fn run_hook(slot: &RwLock<Option<Hook>>, host: &str) -> Result<()> {
        match slot.read().as_ref() {
            Some(hook) => hook(host),
            None => Ok(()),
        }
    }

    /// Calls whose method name matches the prefix.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn brick_create(&self, host: &str, brick: &BrickSpec) -> Result<()> {
        Self::run_hook(&self.on_brick_create, host)?;
        self.log("brick_create", host, &brick.id);
        Ok(())
    }

    async fn brick_destroy(&self, host: &str, brick: &BrickSpec) -> Result<()> {
        Self::run_hook(&self.on_brick_destroy, host)?;
        self.log("brick_destroy", host, &brick.id);
        Ok(())
    }

    async fn volume_create(&self, host: &str, req: &VolumeRequest) -> Result<VolumeInfo> {
        Self::run_hook(&self.on_volume_create, host)?;
        self.log("volume_create", host, &req.name);
        Ok(VolumeInfo {
            name: req.name.clone(),
            brick_count: req.bricks.len(),
        })
    }

    async fn volume_destroy(&self, host: &str, volume: &str) -> Result<()> {
        Self::run_hook(&self.on_volume_destroy, host)?;
        self.log("volume_destroy", host, volume);
        Ok(())
    }

    async fn volume_expand(&self, host: &str, req: &VolumeRequest) -> Result<VolumeInfo> {
        Self::run_hook(&self.on_volume_expand, host)?;
        self.log("volume_expand", host, &req.name);
        Ok(VolumeInfo {
            name: req.name.clone(),
            brick_count: req.bricks.len(),
        })
    }

    async fn volume_info(&self, host: &str, volume: &str) -> Result<VolumeInfo> {
        self.log("volume_info", host, volume);
        Ok(VolumeInfo {
            name: volume.to_string(),
            brick_count: 0,
        })
    }

    async fn volume_replace_brick(
        &self,
        host: &str,
        volume: &str,
        old: &BrickSpec,
        new: &BrickSpec,
    ) -> Result<()> {
        self.log(
            "volume_replace_brick",
            host,
            &format!("{volume} {}->{}", old.id, new.id),
        );
        Ok(())
    }

    async fn heal_info(&self, host: &str, volume: &str) -> Result<HealInfo> {
        self.log("heal_info", host, volume);
        Ok(HealInfo { pending_entries: 0 })
    }

    async fn block_volume_create(
        &self,
        host: &str,
        req: &BlockVolumeRequest,
    ) -> Result<BlockVolumeInfo> {
        Self::run_hook(&self.on_block_volume_create, host)?;
        self.log("block_volume_create", host, &req.name);
        Ok(BlockVolumeInfo {
            name: req.name.clone(),
            iqn: format!("iqn.2020-01.io.brickyard:{}", req.name),
            usable_size_gb: req.size_gb,
        })
    }

    async fn block_volume_destroy(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
    ) -> Result<()> {
        Self::run_hook(&self.on_block_volume_destroy, host)?;
        self.log("block_volume_destroy", host, &format!("{hosting_volume}/{name}"));
        Ok(())
    }

    async fn block_volume_expand(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
        new_size_gb: u64,
    ) -> Result<BlockVolumeInfo> {
        Self::run_hook(&self.on_block_volume_expand, host)?;
        self.log("block_volume_expand", host, &format!("{hosting_volume}/{name}"));
        Ok(BlockVolumeInfo {
            name: name.to_string(),
            iqn: format!("iqn.2020-01.io.brickyard:{name}"),
            usable_size_gb: new_size_gb,
        })
    }

    async fn block_volume_info(
        &self,
        host: &str,
        hosting_volume: &str,
        name: &str,
    ) -> Result<BlockVolumeInfo> {
        self.log("block_volume_info", host, &format!("{hosting_volume}/{name}"));
        Ok(BlockVolumeInfo {
            name: name.to_string(),
            iqn: format!("iqn.2020-01.io.brickyard:{name}"),
            usable_size_gb: 0,
        })
    }

    async fn glusterd_check(&self, host: &str) -> Result<()> {
        Self::run_hook(&self.on_glusterd_check, host)?;
        self.log("glusterd_check", host, "-");
        Ok(())
    }
}
