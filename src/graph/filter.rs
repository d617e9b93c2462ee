//! Content-hash identification of statically linked functions.
//!
//! Statically linked copies of intercepted CRT functions carry no import entry to
//! redirect, so they are recognized by the md5 digest of their byte content instead.

use rustc_hash::FxHashSet;

use crate::graph::{Block, BlockKind};

/// Matches blocks against a set of known content hashes.
#[derive(Debug, Default)]
pub struct ContentHashFilter {
    hashes: FxHashSet<String>,
}

impl ContentHashFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a lower-case hex md5 digest to the filter.
    pub fn add_hash(&mut self, digest: impl Into<String>) {
        self.hashes.insert(digest.into().to_ascii_lowercase());
    }

    /// Returns `true` if no hashes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Returns `true` if `block` is a code block whose content matches a
    /// registered hash.
    #[must_use]
    pub fn matches(&self, block: &Block) -> bool {
        if block.kind() != BlockKind::Code || block.data().is_empty() {
            return false;
        }
        self.hashes.contains(&hash_block_contents(block))
    }
}

/// Computes the lower-case hex md5 digest of a block's contents.
#[must_use]
pub fn hash_block_contents(block: &Block) -> String {
    format!("{:x}", md5::compute(block.data()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BlockGraph, ImageFormat};

    #[test]
    fn test_filter_matches_known_content() {
        let mut graph = BlockGraph::new(ImageFormat::Pe);
        let id = graph.add_block_with_data(BlockKind::Code, "memcpy", vec![0x8B, 0xC3, 0xC3]);
        let digest = hash_block_contents(graph.block(id).unwrap());

        let mut filter = ContentHashFilter::new();
        assert!(filter.is_empty());
        filter.add_hash(digest);
        assert!(filter.matches(graph.block(id).unwrap()));

        let other = graph.add_block_with_data(BlockKind::Code, "other", vec![0xC3]);
        assert!(!filter.matches(graph.block(other).unwrap()));
    }
}
