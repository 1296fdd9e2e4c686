//! Control plane configuration
//!
//! A single explicit configuration value object constructed once at
//! startup and passed by reference into the allocator, the placers, and
//! the volume provisioning logic. All size tunables live here instead of
//! in global mutable state.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One gibibyte expressed in KiB, the unit used for brick sizes.
pub const GB: u64 = 1024 * 1024;
/// One tebibyte expressed in KiB.
pub const TB: u64 = 1024 * GB;

/// Tunables for volume and brick provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Smallest brick the placer may create, in KiB.
    pub brick_min_size_kb: u64,
    /// Largest brick the placer may create, in KiB.
    pub brick_max_size_kb: u64,
    /// Upper bound on bricks per volume.
    pub max_bricks_per_volume: u64,

    /// Replica count used when a request does not specify one.
    pub default_replica: u32,
    /// Disperse data brick count used when a request does not specify one.
    pub default_disperse_data: u32,
    /// Disperse redundancy brick count used when a request does not
    /// specify one.
    pub default_disperse_redundancy: u32,

    /// Whether a block volume request may auto-provision a new hosting
    /// volume when no existing volume has room.
    pub auto_create_block_hosting_volume: bool,
    /// Size in GiB of auto-provisioned block hosting volumes.
    pub block_hosting_volume_size_gb: u64,
    /// Percentage of a block hosting volume held back from block
    /// volume carving.
    pub block_hosting_reserve_percent: u8,

    /// Divisor applied to the data brick size to obtain the arbiter
    /// brick size.
    pub arbiter_discount_factor: u64,

    /// Require every brick of a durability set to land in a distinct
    /// zone, not just on a distinct node.
    pub strict_zone_checking: bool,

    /// Ceiling on concurrently in-flight operations.
    pub op_limit: usize,
    /// Default retry budget for operations that support retry.
    pub op_retry_count: u32,

    /// Seconds between background cleaner sweeps.
    pub cleaner_interval_secs: u64,
    /// Seconds to wait after startup before the first cleaner sweep.
    pub cleaner_start_delay_secs: u64,

    /// Seconds between node health probes.
    pub health_check_interval_secs: u64,
    /// Seconds to wait after startup before the first health probe.
    pub health_check_start_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            brick_min_size_kb: GB,
            brick_max_size_kb: 4 * TB,
            max_bricks_per_volume: 32,
            default_replica: 3,
            default_disperse_data: 4,
            default_disperse_redundancy: 2,
            auto_create_block_hosting_volume: true,
            block_hosting_volume_size_gb: 500,
            block_hosting_reserve_percent: 2,
            arbiter_discount_factor: 64,
            strict_zone_checking: false,
            op_limit: 8,
            op_retry_count: 3,
            cleaner_interval_secs: 1800,
            cleaner_start_delay_secs: 60,
            health_check_interval_secs: 120,
            health_check_start_delay_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, filling unset fields with
    /// defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the allocator cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.brick_min_size_kb == 0 || self.brick_min_size_kb > self.brick_max_size_kb {
            return Err(Error::Configuration(format!(
                "invalid brick size bounds: min {} KiB, max {} KiB",
                self.brick_min_size_kb, self.brick_max_size_kb
            )));
        }
        if self.default_replica == 0 {
            return Err(Error::Configuration("replica count must be non-zero".into()));
        }
        if self.arbiter_discount_factor == 0 {
            return Err(Error::Configuration(
                "arbiter discount factor must be non-zero".into(),
            ));
        }
        if self.block_hosting_reserve_percent >= 100 {
            return Err(Error::Configuration(format!(
                "block hosting reserve ({}%) must be below 100%",
                self.block_hosting_reserve_percent
            )));
        }
        if self.op_limit == 0 {
            return Err(Error::Configuration(
                "operation limit must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Usable size in GiB of an auto-provisioned block hosting volume
    /// after the reserve is held back.
    pub fn block_hosting_usable_size_gb(&self) -> u64 {
        let reserved =
            self.block_hosting_volume_size_gb * u64::from(self.block_hosting_reserve_percent) / 100;
        self.block_hosting_volume_size_gb - reserved
    }
}
