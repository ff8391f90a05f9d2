//! Range Balancer
//!
//! Splits the hash space `[0, hash_span)` into one contiguous range per
//! member, in membership order. No messages are exchanged: every node that
//! converged over the same ordered membership computes the same table.

use serde::{Deserialize, Serialize};

use super::membership::{Membership, SlotRange};
use crate::error::{Error, Result};

/// One row of the partition table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub name: String,
    pub address: String,
    pub client_port: u16,
    pub range: SlotRange,
}

/// Result of balancing the membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTable {
    hash_span: u64,
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Size of the partitioned hash space
    pub fn hash_span(&self) -> u64 {
        self.hash_span
    }

    /// Rows in membership order
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// Slot a key hashes to
    pub fn slot_for_key(&self, key: &[u8]) -> u64 {
        u64::from(crc32fast::hash(key)) % self.hash_span
    }

    /// Member owning a slot
    pub fn owner_of(&self, slot: u64) -> Option<&PartitionEntry> {
        // Ranges are sorted and contiguous
        let idx = self.entries.partition_point(|e| e.range.max <= slot);
        self.entries.get(idx).filter(|e| e.range.contains(slot))
    }

    /// Member owning a key
    pub fn owner_for_key(&self, key: &[u8]) -> Option<&PartitionEntry> {
        self.owner_of(self.slot_for_key(key))
    }

    /// Checksum over the ordered table, for comparing tables across nodes
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.hash_span.to_le_bytes());
        for entry in &self.entries {
            hasher.update(entry.name.as_bytes());
            hasher.update(&[0]);
            hasher.update(entry.address.as_bytes());
            hasher.update(&entry.client_port.to_le_bytes());
            hasher.update(&entry.range.min.to_le_bytes());
            hasher.update(&entry.range.max.to_le_bytes());
        }
        hasher.finalize()
    }
}

/// Compute range sizes: the first `span % n` members get one extra slot
fn range_sizes(hash_span: u64, members: usize) -> impl Iterator<Item = u64> {
    let n = members as u64;
    let base = hash_span / n;
    let remainder = hash_span % n;
    (0..n).map(move |i| if i < remainder { base + 1 } else { base })
}

/// Assign every member its range and return the resulting table
pub fn balance(membership: &mut Membership, hash_span: u64) -> Result<PartitionTable> {
    if membership.is_empty() {
        return Err(Error::Partition("cannot balance an empty membership".into()));
    }
    if hash_span == 0 {
        return Err(Error::Partition("hash span must be positive".into()));
    }
    if membership.len() as u64 > hash_span {
        return Err(Error::Partition(format!(
            "{} members cannot share a hash span of {}",
            membership.len(),
            hash_span
        )));
    }

    let sizes = range_sizes(hash_span, membership.len());
    let mut entries = Vec::with_capacity(membership.len());
    let mut next_min = 0;

    for (node, size) in membership.nodes_mut().iter_mut().zip(sizes) {
        let range = SlotRange {
            min: next_min,
            max: next_min + size,
        };
        next_min = range.max;
        node.range = Some(range);

        entries.push(PartitionEntry {
            name: node.name.clone(),
            address: node.address.clone(),
            client_port: node.client_port,
            range,
        });
    }

    debug_assert_eq!(next_min, hash_span);
    Ok(PartitionTable { hash_span, entries })
}
