//! Partition selection for outgoing messages
//!
//! The hash partitioners reproduce the placement of earlier producer releases
//! bit for bit, so a key keeps landing on the same partition after an upgrade:
//!
//! - [`Crc32Partitioner`]: `(crc32_ieee(key) % n) & 0x7fffffff`. Empty and
//!   absent keys are both treated as unset (random partition), like librdkafka's
//!   `consistent_random`.
//! - [`Murmur2Partitioner`]: `(murmur2(key) & 0x7fffffff) % n`, the Java client
//!   algorithm. An absent key is random but an empty key is hashed.
//! - [`HashPartitioner`]: a generic 32-bit hash (`murmur3`, `fnv-1a`) with
//!   `|int32(hash) % n|`.
//!
//! Partitioners are not thread-safe. Each one owns a mutable random source, so
//! construct one per writer and only call it from that writer's send path. The
//! `&mut self` receiver on [`Partitioner::partition`] enforces this.

use crate::error::Error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors returned by [`Partitioner::partition`]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionError {
    /// The topic reported no partitions
    #[error("number of partitions must be positive")]
    NonPositivePartitions,
}

/// Maps a message key onto a partition index in `[0, num_partitions)`.
pub trait Partitioner: Send {
    /// Choose a partition for `key`. `None` means the message has no key.
    fn partition(&mut self, key: Option<&[u8]>, num_partitions: i32)
        -> Result<i32, PartitionError>;

    /// Whether the same key must always map to the same partition. A producer
    /// must not redirect a message away from the chosen partition when this is
    /// true.
    fn requires_consistency(&self) -> bool;
}

fn check_partitions(num_partitions: i32) -> Result<(), PartitionError> {
    if num_partitions <= 0 {
        return Err(PartitionError::NonPositivePartitions);
    }
    Ok(())
}

/// CRC32 (IEEE) partitioner
pub struct Crc32Partitioner {
    rng: StdRng,
}

impl Crc32Partitioner {
    /// Create a partitioner with a freshly seeded random source
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a partitioner with a fixed seed for reproducible unkeyed placement
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for Crc32Partitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Partitioner for Crc32Partitioner {
    fn partition(
        &mut self,
        key: Option<&[u8]>,
        num_partitions: i32,
    ) -> Result<i32, PartitionError> {
        check_partitions(num_partitions)?;
        match key {
            // librdkafka's crc32 balancer treats empty keys as unset
            None | Some([]) => Ok(self.rng.gen_range(0..num_partitions)),
            Some(key) => {
                let hash = crc32fast::hash(key);
                Ok(((hash % num_partitions as u32) & 0x7fff_ffff) as i32)
            }
        }
    }

    fn requires_consistency(&self) -> bool {
        true
    }
}

/// Murmur2 partitioner matching the Java client
pub struct Murmur2Partitioner {
    rng: StdRng,
}

impl Murmur2Partitioner {
    /// Create a partitioner with a freshly seeded random source
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create a partitioner with a fixed seed for reproducible unkeyed placement
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for Murmur2Partitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Partitioner for Murmur2Partitioner {
    fn partition(
        &mut self,
        key: Option<&[u8]>,
        num_partitions: i32,
    ) -> Result<i32, PartitionError> {
        check_partitions(num_partitions)?;
        // The Java and librdkafka murmur2 balancers treat an absent key as
        // unset but hash an empty key.
        match key {
            None => Ok(self.rng.gen_range(0..num_partitions)),
            Some(key) => Ok(((murmur2(key) & 0x7fff_ffff) % num_partitions as u32) as i32),
        }
    }

    fn requires_consistency(&self) -> bool {
        true
    }
}

/// Partitioner over an arbitrary 32-bit hash function
pub struct HashPartitioner {
    rng: StdRng,
    hash: fn(&[u8]) -> u32,
}

impl HashPartitioner {
    /// Create a partitioner for `hash` with a freshly seeded random source
    pub fn new(hash: fn(&[u8]) -> u32) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            hash,
        }
    }

    /// FNV-1a (32-bit) partitioner
    pub fn fnv1a() -> Self {
        Self::new(fnv1a_32)
    }

    /// Murmur3 (x86, 32-bit, seed 0) partitioner
    pub fn murmur3() -> Self {
        Self::new(murmur3_32)
    }
}

impl Partitioner for HashPartitioner {
    fn partition(
        &mut self,
        key: Option<&[u8]>,
        num_partitions: i32,
    ) -> Result<i32, PartitionError> {
        check_partitions(num_partitions)?;
        match key {
            None => Ok(self.rng.gen_range(0..num_partitions)),
            Some(key) => {
                let partition = ((self.hash)(key) as i32) % num_partitions;
                Ok(partition.abs())
            }
        }
    }

    fn requires_consistency(&self) -> bool {
        true
    }
}

/// Cycles through partitions, ignoring the key
#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    next: i32,
}

impl RoundRobinPartitioner {
    /// Create a partitioner starting at partition 0
    pub fn new() -> Self {
        Self::default()
    }
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(
        &mut self,
        _key: Option<&[u8]>,
        num_partitions: i32,
    ) -> Result<i32, PartitionError> {
        check_partitions(num_partitions)?;
        if self.next >= num_partitions {
            self.next = 0;
        }
        let partition = self.next;
        self.next += 1;
        Ok(partition)
    }

    fn requires_consistency(&self) -> bool {
        false
    }
}

/// Hash algorithm used when partitioning by key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PartitionAlgorithm {
    /// CRC32 (IEEE), the default
    #[default]
    Crc32,
    /// Java-compatible murmur2
    Murmur2,
    /// Murmur3 x86_32
    Murmur3,
    /// FNV-1a 32-bit
    Fnv1a,
}

impl FromStr for PartitionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "crc32" => Ok(PartitionAlgorithm::Crc32),
            "murmur2" => Ok(PartitionAlgorithm::Murmur2),
            "murmur3" => Ok(PartitionAlgorithm::Murmur3),
            "fnv-1a" => Ok(PartitionAlgorithm::Fnv1a),
            other => Err(Error::config(format!(
                "invalid partition algorithm: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for PartitionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionAlgorithm::Crc32 => "crc32",
            PartitionAlgorithm::Murmur2 => "murmur2",
            PartitionAlgorithm::Murmur3 => "murmur3",
            PartitionAlgorithm::Fnv1a => "fnv-1a",
        };
        f.write_str(name)
    }
}

/// How a writer places messages onto partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partitioning {
    /// Spread messages evenly, ignoring keys
    RoundRobin,
    /// Place messages by hashing their key
    ByKey(PartitionAlgorithm),
}

impl Partitioning {
    /// Build a new partitioner instance for this strategy
    pub fn new_partitioner(&self) -> Box<dyn Partitioner> {
        match self {
            Partitioning::RoundRobin => Box::new(RoundRobinPartitioner::new()),
            Partitioning::ByKey(PartitionAlgorithm::Crc32) => Box::new(Crc32Partitioner::new()),
            Partitioning::ByKey(PartitionAlgorithm::Murmur2) => {
                Box::new(Murmur2Partitioner::new())
            }
            Partitioning::ByKey(PartitionAlgorithm::Murmur3) => Box::new(HashPartitioner::murmur3()),
            Partitioning::ByKey(PartitionAlgorithm::Fnv1a) => Box::new(HashPartitioner::fnv1a()),
        }
    }
}

/// 32-bit murmur2 as implemented by the Java client's `Utils.murmur2`.
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    // Mixing constants, generated offline
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h = SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Murmur3 x86_32 with seed 0.
pub fn murmur3_32(data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h: u32 = 0;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    let mut k: u32 = 0;
    if tail.len() >= 3 {
        k ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        k ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        k ^= u32::from(tail[0]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// FNV-1a, 32-bit.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    data.iter().fold(OFFSET_BASIS, |h, &b| (h ^ u32::from(b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // Not testing for cryptographic randomness, only that unkeyed messages are
    // not falling back to hashing an empty key.
    #[test]
    fn test_unkeyed_partitions_are_spread() {
        let partitioners: Vec<(&str, Box<dyn Partitioner>)> = vec![
            ("crc32", Box::new(Crc32Partitioner::new())),
            ("murmur2", Box::new(Murmur2Partitioner::new())),
        ];
        for (name, mut partitioner) in partitioners {
            let sum: i64 = (0..1000)
                .map(|_| partitioner.partition(None, 10).unwrap() as i64)
                .sum();
            let avg = sum as f64 / 1000.0;
            assert!(
                avg > 4.0 && avg < 5.0,
                "{}: expected the average of 1000 trials from 0-9 to be near 4.5, got {}",
                name,
                avg
            );
        }
    }

    #[rstest]
    #[case::crc_hello("hello", 1000, 870)]
    #[case::crc_hello2("hello2", 1000, 502)]
    #[case::crc_hello3("hello3", 1000, 592)]
    #[case::crc_hello4("hello4", 1000, 787)]
    #[case::crc_hello5("hello5", 1000, 413)]
    #[case::crc_single("hello5", 1, 0)]
    fn test_crc32_partitioner(#[case] key: &str, #[case] partitions: i32, #[case] want: i32) {
        let mut partitioner = Crc32Partitioner::new();
        assert_eq!(partitioner.partition(Some(key.as_bytes()), partitions), Ok(want));
        assert!(partitioner.requires_consistency());
    }

    #[rstest]
    #[case::mm2_hello("hello", 1000, 229)]
    #[case::mm2_hello2("hello2", 1000, 907)]
    #[case::mm2_hello3("hello3", 1000, 759)]
    #[case::mm2_hello4("hello4", 1000, 299)]
    #[case::mm2_hello5("hello5", 1000, 841)]
    #[case::mm2_empty("", 1000, 681)]
    #[case::mm2_single("hello5", 1, 0)]
    fn test_murmur2_partitioner(#[case] key: &str, #[case] partitions: i32, #[case] want: i32) {
        let mut partitioner = Murmur2Partitioner::new();
        assert_eq!(partitioner.partition(Some(key.as_bytes()), partitions), Ok(want));
        assert!(partitioner.requires_consistency());
    }

    #[test]
    fn test_zero_partitions_is_an_error() {
        let mut partitioners: Vec<Box<dyn Partitioner>> = vec![
            Box::new(Crc32Partitioner::new()),
            Box::new(Murmur2Partitioner::new()),
            Box::new(HashPartitioner::fnv1a()),
            Box::new(HashPartitioner::murmur3()),
            Box::new(RoundRobinPartitioner::new()),
        ];
        for partitioner in partitioners.iter_mut() {
            assert_eq!(
                partitioner.partition(Some(b"hello"), 0),
                Err(PartitionError::NonPositivePartitions)
            );
            assert_eq!(
                partitioner.partition(None, 0),
                Err(PartitionError::NonPositivePartitions)
            );
        }
    }

    // The Java client's own murmur2 test set.
    #[rstest]
    #[case("21", -973932308)]
    #[case("foobar", -790332482)]
    #[case("a-little-bit-long-string", -985981536)]
    #[case("a-little-bit-longer-string", -1486304829)]
    #[case("lkjh234lh9fiuh90y23oiuhsafujhadof229phr9h19h89h8", -58897971)]
    #[case("abc", 479470107)]
    fn test_murmur2_hash(#[case] data: &str, #[case] want: i32) {
        assert_eq!(murmur2(data.as_bytes()), want as u32);
    }

    #[test]
    fn test_crc32_empty_key_is_random_but_murmur2_empty_key_is_hashed() {
        let mut crc = Crc32Partitioner::with_seed(7);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(crc.partition(Some(b""), 10).unwrap());
        }
        assert!(seen.len() > 1, "empty crc32 keys should not hash");

        let mut murmur = Murmur2Partitioner::with_seed(7);
        for _ in 0..50 {
            assert_eq!(murmur.partition(Some(b""), 1000), Ok(681));
        }
    }

    #[test]
    fn test_reference_hashes() {
        assert_eq!(murmur3_32(b"hello"), 0x248b_fa47);
        assert_eq!(murmur3_32(b""), 0);
        assert_eq!(fnv1a_32(b"hello"), 0x4f9f_2cab);
        assert_eq!(fnv1a_32(b""), 0x811c_9dc5);
    }

    #[rstest]
    #[case::fnv_hello(PartitionAlgorithm::Fnv1a, "hello", 723)]
    #[case::fnv_hello2(PartitionAlgorithm::Fnv1a, "hello2", 133)]
    #[case::fnv_empty(PartitionAlgorithm::Fnv1a, "", 35)]
    #[case::mm3_hello(PartitionAlgorithm::Murmur3, "hello", 351)]
    #[case::mm3_hello2(PartitionAlgorithm::Murmur3, "hello2", 691)]
    #[case::mm3_abc(PartitionAlgorithm::Murmur3, "abc", 294)]
    fn test_generic_hash_partitioner(
        #[case] algorithm: PartitionAlgorithm,
        #[case] key: &str,
        #[case] want: i32,
    ) {
        let mut partitioner = Partitioning::ByKey(algorithm).new_partitioner();
        assert_eq!(partitioner.partition(Some(key.as_bytes()), 1000), Ok(want));
        assert!(partitioner.requires_consistency());
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut partitioner = RoundRobinPartitioner::new();
        let picks: Vec<i32> = (0..7)
            .map(|_| partitioner.partition(Some(b"same"), 3).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
        assert!(!partitioner.requires_consistency());

        // Shrinking the partition count wraps back into range
        let mut partitioner = RoundRobinPartitioner { next: 5 };
        assert_eq!(partitioner.partition(None, 2), Ok(0));
    }

    #[test]
    fn test_partition_algorithm_names() {
        assert_eq!("".parse::<PartitionAlgorithm>().unwrap(), PartitionAlgorithm::Crc32);
        assert_eq!("crc32".parse::<PartitionAlgorithm>().unwrap(), PartitionAlgorithm::Crc32);
        assert_eq!("murmur2".parse::<PartitionAlgorithm>().unwrap(), PartitionAlgorithm::Murmur2);
        assert_eq!("murmur3".parse::<PartitionAlgorithm>().unwrap(), PartitionAlgorithm::Murmur3);
        assert_eq!("fnv-1a".parse::<PartitionAlgorithm>().unwrap(), PartitionAlgorithm::Fnv1a);
        assert!("sha1".parse::<PartitionAlgorithm>().unwrap_err().is_config_error());
        assert_eq!(PartitionAlgorithm::Fnv1a.to_string(), "fnv-1a");
    }
}
