//! Device ring
//!
//! One ring per cluster holds every online device. For a given seed the
//! ring yields a deterministic device ordering: each device is scored
//! by hashing the seed together with its id, and devices are visited in
//! descending score order. Different seeds shuffle the ordering while
//! the same seed always reproduces it, which spreads volumes across
//! devices without any placement state.

use std::collections::HashMap;

/// Ring membership record for one device
#[derive(Debug, Clone)]
pub struct RingDevice {
    pub device_id: String,
    pub node_id: String,
}

/// Seeded deterministic ordering over a cluster's online devices
#[derive(Debug, Default)]
pub struct DeviceRing {
    devices: HashMap<String, RingDevice>,
}

impl DeviceRing {
    pub fn new() -> DeviceRing {
        DeviceRing::default()
    }

    /// Add a device to the ring. Re-adding an id replaces the record.
    pub fn add(&mut self, device: RingDevice) {
        self.devices.insert(device.device_id.clone(), device);
    }

    pub fn remove(&mut self, device_id: &str) {
        self.devices.remove(device_id);
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Node carrying the given device, if the device is in the ring.
    pub fn node_of(&self, device_id: &str) -> Option<&str> {
        self.devices.get(device_id).map(|d| d.node_id.as_str())
    }

    /// Device ids in the order determined by the seed: descending hash
    /// score, ties broken by device id.
    pub fn ordered(&self, seed: &str) -> Vec<String> {
        let mut scored: Vec<(u64, &str)> = self
            .devices
            .keys()
            .map(|id| (score(seed, id), id.as_str()))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().map(|(_, id)| id.to_string()).collect()
    }
}

fn score(seed: &str, device_id: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(seed.as_bytes());
    hasher.update(device_id.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

/// Lazily-consumed walk over one seeded ordering. Dropping the cursor
/// at any point of the walk is safe; `close` exists for callers that
/// want to stop early and be explicit about it.
#[derive(Debug)]
pub struct DeviceCursor {
    devices: std::vec::IntoIter<String>,
}

impl DeviceCursor {
    pub(crate) fn new(devices: Vec<String>) -> DeviceCursor {
        DeviceCursor {
            devices: devices.into_iter(),
        }
    }

    pub fn close(self) {}
}

impl Iterator for DeviceCursor {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.devices.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_of(n: usize) -> DeviceRing {
        let mut ring = DeviceRing::new();
        for i in 0..n {
            ring.add(RingDevice {
                device_id: format!("d{i}"),
                node_id: format!("n{}", i % 3),
            });
        }
        ring
    }

    #[test]
    fn test_ordering_is_deterministic_per_seed() {
        let ring = ring_of(8);
        let a = ring.ordered("seed-1");
        let b = ring.ordered("seed-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn test_different_seeds_shuffle() {
        let ring = ring_of(32);
        let a = ring.ordered("seed-1");
        let b = ring.ordered("seed-2");
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn test_remove_drops_device() {
        let mut ring = ring_of(4);
        ring.remove("d2");
        let order = ring.ordered("s");
        assert_eq!(order.len(), 3);
        assert!(!order.contains(&"d2".to_string()));
    }

    #[test]
    fn test_cursor_partial_consumption() {
        let ring = ring_of(8);
        let mut cursor = DeviceCursor::new(ring.ordered("s"));
        let first = cursor.next().unwrap();
        assert!(!first.is_empty());
        cursor.close();
    }
}
