//! Encoder output accumulation
//!
//! Recording sinks emit many small fragments. They are kept in a list until
//! the count passes a ceiling, at which point the list is collapsed into one
//! fragment, so the number of live allocations stays bounded regardless of
//! export length.

use crate::error::{Error, Result};
use tracing::{debug, trace};

/// Counters describing the manager's current contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Fragments accepted since creation (or the last finalize/dispose)
    pub chunks_added: usize,
    /// Fragments currently held
    pub fragments_held: usize,
    /// Bytes currently held
    pub total_bytes: usize,
    /// Times the held fragments were collapsed
    pub consolidations: usize,
}

/// Bounded-fragmentation output buffer
#[derive(Debug)]
pub struct ChunkedOutputManager {
    fragments: Vec<Vec<u8>>,
    ceiling: usize,
    stats: ChunkStats,
}

impl ChunkedOutputManager {
    /// Create a manager that consolidates once more than `ceiling` fragments are held
    pub fn new(ceiling: usize) -> Self {
        Self {
            fragments: Vec::new(),
            ceiling: ceiling.max(1),
            stats: ChunkStats::default(),
        }
    }

    /// Append one encoder fragment
    ///
    /// Empty fragments are ignored and return `false`.
    pub fn add_chunk(&mut self, fragment: Vec<u8>) -> bool {
        if fragment.is_empty() {
            return false;
        }

        self.stats.chunks_added += 1;
        self.stats.total_bytes += fragment.len();
        self.fragments.push(fragment);

        if self.fragments.len() > self.ceiling {
            self.consolidate();
        }
        self.stats.fragments_held = self.fragments.len();
        true
    }

    fn consolidate(&mut self) {
        let merged = self.fragments.concat();
        trace!(fragments = self.fragments.len(), bytes = merged.len(), "Consolidating output fragments");
        self.fragments.clear();
        self.fragments.push(merged);
        self.stats.consolidations += 1;
    }

    /// Collapse everything into the final artifact bytes
    ///
    /// Fails with [`Error::NothingToFinalize`] if no fragment was ever
    /// added. The manager is empty afterwards.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        if self.stats.chunks_added == 0 {
            return Err(Error::NothingToFinalize);
        }

        let bytes = if self.fragments.len() == 1 {
            self.fragments.pop().unwrap_or_default()
        } else {
            self.fragments.concat()
        };
        debug!(
            chunks = self.stats.chunks_added,
            consolidations = self.stats.consolidations,
            bytes = bytes.len(),
            "Finalized output"
        );

        self.fragments.clear();
        self.stats = ChunkStats::default();
        Ok(bytes)
    }

    /// Drop all retained fragments
    pub fn dispose(&mut self) {
        self.fragments = Vec::new();
        self.stats = ChunkStats::default();
    }

    pub fn stats(&self) -> ChunkStats {
        self.stats
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_without_chunks_fails() {
        let mut manager = ChunkedOutputManager::new(50);
        assert!(matches!(manager.finalize(), Err(Error::NothingToFinalize)));

        // Empty fragments don't count
        assert!(!manager.add_chunk(Vec::new()));
        assert!(matches!(manager.finalize(), Err(Error::NothingToFinalize)));
    }

    #[test]
    fn test_consolidation_preserves_bytes_and_order() {
        let mut manager = ChunkedOutputManager::new(50);
        let mut expected = Vec::new();
        for i in 0..137u32 {
            let fragment: Vec<u8> = (0..(i % 7 + 1)).map(|j| (i + j) as u8).collect();
            expected.extend_from_slice(&fragment);
            assert!(manager.add_chunk(fragment));
            assert!(manager.stats().fragments_held <= 50);
        }

        let stats = manager.stats();
        assert_eq!(stats.chunks_added, 137);
        assert_eq!(stats.total_bytes, expected.len());
        assert!(stats.consolidations >= 2);

        let artifact = manager.finalize().unwrap();
        assert_eq!(artifact.len(), expected.len());
        assert_eq!(artifact, expected);
    }

    #[test]
    fn test_no_consolidation_at_ceiling() {
        let mut manager = ChunkedOutputManager::new(3);
        for _ in 0..3 {
            manager.add_chunk(vec![1, 2]);
        }
        assert_eq!(manager.stats().consolidations, 0);
        manager.add_chunk(vec![3]);
        assert_eq!(manager.stats().consolidations, 1);
        assert_eq!(manager.stats().fragments_held, 1);
    }

    #[test]
    fn test_finalize_resets_and_dispose_drops() {
        let mut manager = ChunkedOutputManager::new(10);
        manager.add_chunk(vec![9; 16]);
        assert_eq!(manager.finalize().unwrap().len(), 16);
        assert!(matches!(manager.finalize(), Err(Error::NothingToFinalize)));

        manager.add_chunk(vec![1; 4]);
        manager.dispose();
        assert_eq!(manager.stats(), ChunkStats::default());
        assert!(manager.finalize().is_err());
    }
}
