//! Choosing the partition a record is appended to. Strategies are plain values owned by whoever
//! appends, there is no process wide state.

use serde::{Deserialize, Serialize};

use crate::record::Record;

pub trait Partitioner: Send + Sync {
    /// Partition in `0..partitions` for the record. `partitions` is never `0`.
    fn partition(&mut self, record: &Record, partitions: u32) -> u32;
}

/// Stable 64-bit FNV-1a hash of a key.
pub fn hash_key(key: impl AsRef<[u8]>) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    key.as_ref().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// `hash(key) mod partitions`, records sharing a key always land on the same partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyHashPartitioner;

impl Partitioner for KeyHashPartitioner {
    fn partition(&mut self, record: &Record, partitions: u32) -> u32 {
        (hash_key(&record.key) % u64::from(partitions.max(1))) as u32
    }
}

/// Spreads records evenly regardless of their key.
#[derive(Debug, Clone, Default)]
pub struct RoundRobinPartitioner {
    next: u32,
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&mut self, _record: &Record, partitions: u32) -> u32 {
        let partition = self.next % partitions.max(1);
        self.next = self.next.wrapping_add(1);
        partition
    }
}

/// Configurable choice of [Partitioner].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partitioning {
    #[default]
    KeyHash,
    RoundRobin,
}

impl Partitioning {
    pub fn partitioner(&self) -> Box<dyn Partitioner> {
        match self {
            Partitioning::KeyHash => Box::new(KeyHashPartitioner),
            Partitioning::RoundRobin => Box::new(RoundRobinPartitioner::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(hash_key(""), 0xcbf29ce484222325);
        assert_eq!(hash_key("a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn same_key_same_partition() {
        let mut partitioner = KeyHashPartitioner;
        let a = partitioner.partition(&Record::of_key("order-17"), 8);
        let b = partitioner.partition(&Record::new("order-17", "other payload"), 8);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn round_robin_cycles() {
        let mut partitioner = RoundRobinPartitioner::default();
        let record = Record::of_key("k");
        let picked: Vec<u32> = (0..5).map(|_| partitioner.partition(&record, 3)).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn round_robin_counters_are_independent() {
        let record = Record::of_key("k");
        let mut a = RoundRobinPartitioner::default();
        let mut b = RoundRobinPartitioner::default();
        a.partition(&record, 4);
        assert_eq!(b.partition(&record, 4), 0);
    }
}
