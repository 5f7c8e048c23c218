use std::sync::Mutex;

use ahash::RandomState;
use hashbrown::HashMap;

use crate::{util::sync::lock, Address};

/// Live chunks by start address, holding the last size seen for each.
///
/// A single mutex covers every operation; allocation rates of traced targets
/// are nowhere near the point where sharding would pay off.
#[derive(Default)]
pub struct ChunkRegistry {
    chunks: Mutex<HashMap<Address, u64, RandomState>>,
}

impl ChunkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `address`, or replace its size if it is already tracked
    pub fn upsert(&self, address: Address, size: u64) {
        lock(&self.chunks).insert(address, size);
    }

    /// Stop tracking `address`, returning the size it had. `None` for
    /// addresses that were never tracked (allocated before tracing started,
    /// already freed, or garbage).
    pub fn remove(&self, address: Address) -> Option<u64> {
        lock(&self.chunks).remove(&address)
    }

    pub fn lookup(&self, address: Address) -> Option<u64> {
        lock(&self.chunks).get(&address).copied()
    }

    pub fn len(&self) -> usize {
        lock(&self.chunks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of the live set
    pub fn snapshot(&self) -> Vec<(Address, u64)> {
        let mut chunks: Vec<_> = lock(&self.chunks).iter().map(|(&a, &s)| (a, s)).collect();
        chunks.sort_unstable();
        chunks
    }
}
