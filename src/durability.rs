//! Volume durability schemes
//!
//! The durability scheme of a volume (none, N-way replication, or
//! erasure coding) determines how many bricks form one brick set and
//! how a requested volume size is broken down into brick sizes.

use crate::config::Config;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Redundancy policy of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Durability {
    /// Plain distribution, no redundancy.
    None,
    /// N-way replication; the arbiter flag turns the last brick of each
    /// set into a metadata-only quorum brick.
    Replicate { replica: u32, arbiter: bool },
    /// Erasure coding with `data` payload bricks and `redundancy`
    /// parity bricks per set.
    Disperse { data: u32, redundancy: u32 },
}

impl Durability {
    /// Fill zeroed counts with the configured defaults.
    pub fn set_defaults(&mut self, config: &Config) {
        match self {
            Durability::None => {}
            Durability::Replicate { replica, .. } => {
                if *replica == 0 {
                    *replica = config.default_replica;
                }
            }
            Durability::Disperse { data, redundancy } => {
                if *data == 0 {
                    *data = config.default_disperse_data;
                }
                if *redundancy == 0 {
                    *redundancy = config.default_disperse_redundancy;
                }
            }
        }
    }

    /// Number of bricks in one brick set.
    pub fn bricks_in_set(&self) -> usize {
        match self {
            Durability::None => 1,
            Durability::Replicate { replica, .. } => *replica as usize,
            Durability::Disperse { data, redundancy } => (*data + *redundancy) as usize,
        }
    }

    /// True when the last brick of each set is an arbiter brick.
    pub fn uses_arbiter(&self) -> bool {
        matches!(self, Durability::Replicate { arbiter: true, .. })
    }

    /// Returns a generator that yields successively smaller
    /// (set count, brick size) layouts for the requested volume size.
    /// The generator fails with `MinimumBrickSize` once the brick size
    /// would drop below the configured floor.
    pub fn brick_size_generator(&self, size_kb: u64, config: &Config) -> BrickSizer {
        let payload_divisor = match self {
            Durability::Disperse { data, .. } => u64::from(*data),
            _ => 1,
        };
        BrickSizer {
            next_sets: 1,
            size_kb,
            payload_divisor,
            min_kb: config.brick_min_size_kb,
            max_kb: config.brick_max_size_kb,
        }
    }
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Replicate {
            replica: 0,
            arbiter: false,
        }
    }
}

/// Successive-halving brick layout generator
#[derive(Debug)]
pub struct BrickSizer {
    next_sets: u64,
    size_kb: u64,
    payload_divisor: u64,
    min_kb: u64,
    max_kb: u64,
}

impl BrickSizer {
    /// Produce the next candidate layout: the number of brick sets and
    /// the size of each brick in KiB. The first candidate is a single
    /// set; every further call doubles the set count.
    pub fn next_layout(&mut self) -> Result<(u64, u64)> {
        loop {
            let sets = self.next_sets;
            self.next_sets *= 2;
            let brick_size = self.size_kb / sets / self.payload_divisor;
            if brick_size < self.min_kb {
                return Err(Error::MinimumBrickSize);
            }
            if brick_size <= self.max_kb {
                return Ok((sets, brick_size));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GB, TB};

    #[test]
    fn test_bricks_in_set() {
        assert_eq!(Durability::None.bricks_in_set(), 1);
        let rep = Durability::Replicate {
            replica: 3,
            arbiter: false,
        };
        assert_eq!(rep.bricks_in_set(), 3);
        let ec = Durability::Disperse {
            data: 4,
            redundancy: 2,
        };
        assert_eq!(ec.bricks_in_set(), 6);
    }

    #[test]
    fn test_defaults_fill_zeroes() {
        let config = Config::default();
        let mut d = Durability::Replicate {
            replica: 0,
            arbiter: false,
        };
        d.set_defaults(&config);
        assert_eq!(d.bricks_in_set(), 3);
    }

    #[test]
    fn test_sizer_halves_until_fit() {
        let config = Config {
            brick_max_size_kb: 1 * TB,
            ..Config::default()
        };
        let d = Durability::None;
        // 8 TiB volume: halving reaches 1 TiB bricks at 8 sets
        let mut sizer = d.brick_size_generator(8 * TB, &config);
        let (sets, size) = sizer.next_layout().unwrap();
        assert_eq!(sets, 8);
        assert_eq!(size, 1 * TB);
        // next call halves again
        let (sets, size) = sizer.next_layout().unwrap();
        assert_eq!(sets, 16);
        assert_eq!(size, TB / 2);
    }

    #[test]
    fn test_sizer_hits_minimum() {
        let config = Config::default();
        let d = Durability::None;
        // 1 GiB volume fits exactly once and cannot be halved below the
        // 1 GiB floor
        let mut sizer = d.brick_size_generator(1 * GB, &config);
        let (sets, size) = sizer.next_layout().unwrap();
        assert_eq!((sets, size), (1, GB));
        assert!(matches!(
            sizer.next_layout(),
            Err(Error::MinimumBrickSize)
        ));
    }

    #[test]
    fn test_disperse_divides_payload() {
        let config = Config {
            brick_max_size_kb: 1 * TB,
            ..Config::default()
        };
        let d = Durability::Disperse {
            data: 4,
            redundancy: 2,
        };
        let mut sizer = d.brick_size_generator(8 * TB, &config);
        let (sets, size) = sizer.next_layout().unwrap();
        // 8 TiB / 2 sets / 4 data bricks = 1 TiB per brick
        assert_eq!(sets, 2);
        assert_eq!(size, 1 * TB);
    }
}
