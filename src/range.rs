// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! The pure "compact range" Merkle algorithm at the heart of the integrator
//! (C4). Kept free of any I/O so it can be fuzzed and proptested in
//! isolation, the same separation a pure commit rule gets from the
//! effectful store built on top of it.

use sha2::{Digest, Sha256};

use crate::entry::rfc6962_node_hash;

/// RFC 6962 root hash of the empty tree: the SHA-256 of the empty string.
pub fn empty_root() -> [u8; 32] {
    Sha256::digest([]).into()
}

/// One finalized (non-ephemeral) node produced while appending leaves: a
/// genuine, permanent node of the Merkle tree, covering leaves
/// `[index * 2^level, (index + 1) * 2^level)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizedNode {
    pub level: u8,
    pub index: u64,
    pub hash: [u8; 32],
}

/// The minimal set of perfect-subtree roots describing a tree prefix
/// `[0, size)`. Ordered oldest/largest
/// first, newest/smallest last — this mirrors the binary representation of
/// `size`, most significant bit first.
#[derive(Debug, Clone, Default)]
pub struct CompactRange {
    nodes: Vec<(u8, u64, [u8; 32])>,
    size: u64,
}

impl CompactRange {
    /// The empty range, covering `[0, 0)`.
    pub fn new_empty() -> Self {
        Self {
            nodes: Vec::new(),
            size: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The `(level, index)` pairs this range needs to have been read from
    /// storage before it can be reconstructed via [`CompactRange::from_nodes`].
    /// Ordered oldest/largest first, matching `nodes`.
    pub fn node_coordinates(size: u64) -> Vec<(u8, u64)> {
        Self::node_coordinates_exact(size)
    }

    fn node_coordinates_exact(size: u64) -> Vec<(u8, u64)> {
        // Walk the bits of `size` from the most significant to the least,
        // tracking how many leaves have been consumed by subtrees already
        // emitted; that count, shifted down to the current level, is the
        // index of the next subtree.
        let mut coords = Vec::new();
        if size == 0 {
            return coords;
        }
        let top = 63 - size.leading_zeros();
        let mut consumed: u64 = 0;
        for level in (0..=top).rev() {
            let bit = 1u64 << level;
            if size & bit != 0 {
                let index = consumed >> level;
                coords.push((level as u8, index));
                consumed += bit;
            }
        }
        coords
    }

    /// Reconstructs the compact range for prefix `[0, size)` from previously
    /// stamped tile nodes, via `read_node(level, index) -> hash`.
    pub fn from_nodes(
        size: u64,
        mut read_node: impl FnMut(u8, u64) -> Option<[u8; 32]>,
    ) -> Option<Self> {
        let mut nodes = Vec::new();
        for (level, index) in Self::node_coordinates_exact(size) {
            let hash = read_node(level, index)?;
            nodes.push((level, index, hash));
        }
        Some(Self { nodes, size })
    }

    /// Appends one leaf hash, invoking `on_finalized` for every newly
    /// finalized non-ephemeral node (the new leaf itself, plus any interior
    /// nodes completed by carrying through equal-height subtrees).
    pub fn append(&mut self, leaf_hash: [u8; 32], mut on_finalized: impl FnMut(FinalizedNode)) {
        let leaf_index = self.size;
        on_finalized(FinalizedNode {
            level: 0,
            index: leaf_index,
            hash: leaf_hash,
        });
        self.nodes.push((0, leaf_index, leaf_hash));

        loop {
            let len = self.nodes.len();
            if len < 2 {
                break;
            }
            let (lvl_r, idx_r, _) = self.nodes[len - 1];
            let (lvl_l, idx_l, _) = self.nodes[len - 2];
            if lvl_l != lvl_r || idx_l + 1 != idx_r {
                break;
            }
            let (_, _, hash_r) = self.nodes.pop().unwrap();
            let (_, _, hash_l) = self.nodes.pop().unwrap();
            let combined = rfc6962_node_hash(&hash_l, &hash_r);
            let new_level = lvl_l + 1;
            let new_index = idx_l >> 1;
            on_finalized(FinalizedNode {
                level: new_level,
                index: new_index,
                hash: combined,
            });
            self.nodes.push((new_level, new_index, combined));
        }
        self.size += 1;
    }

    /// Appends a run of leaves, returning the finalized nodes in the order
    /// they were produced.
    pub fn append_all(&mut self, leaves: &[[u8; 32]]) -> Vec<FinalizedNode> {
        let mut out = Vec::new();
        for leaf in leaves {
            self.append(*leaf, |n| out.push(n));
        }
        out
    }

    /// The root hash of `[0, size)`. Combines remaining range roots
    /// right-to-left with ephemeral (unstored) nodes when `size` is not a
    /// power of two.
    pub fn root(&self) -> [u8; 32] {
        if self.nodes.is_empty() {
            return empty_root();
        }
        let mut iter = self.nodes.iter().rev();
        let mut acc = iter.next().unwrap().2;
        for (_, _, hash) in iter {
            acc = rfc6962_node_hash(hash, &acc);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(n: u64) -> [u8; 32] {
        crate::entry::rfc6962_leaf_hash(&n.to_be_bytes())
    }

    #[test]
    fn empty_tree_root_is_stable() {
        let r = CompactRange::new_empty();
        assert_eq!(r.root(), empty_root());
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let mut r = CompactRange::new_empty();
        let h = leaf(0);
        r.append(h, |_| {});
        assert_eq!(r.root(), h);
    }

    #[test]
    fn power_of_two_has_no_ephemeral_stack_remainder() {
        let mut r = CompactRange::new_empty();
        for i in 0..4 {
            r.append(leaf(i), |_| {});
        }
        // A tree of size 4 is one perfect subtree: exactly one stack entry.
        assert_eq!(r.nodes.len(), 1);
        assert_eq!(r.nodes[0].0, 2);
    }

    #[test]
    fn node_coordinates_cover_expected_levels() {
        // size=13 = 0b1101 -> subtrees of height 3,2,0 at indices 0,2,12.
        let coords = CompactRange::node_coordinates_exact(13);
        assert_eq!(coords, vec![(3, 0), (2, 2), (0, 12)]);
    }

    #[test]
    fn from_nodes_reconstructs_same_root_as_incremental_append() {
        let mut incremental = CompactRange::new_empty();
        let mut tiles = std::collections::HashMap::new();
        for i in 0..37u64 {
            incremental.append(leaf(i), |n| {
                tiles.insert((n.level, n.index), n.hash);
            });
        }
        let reconstructed =
            CompactRange::from_nodes(37, |level, index| tiles.get(&(level, index)).copied())
                .unwrap();
        assert_eq!(reconstructed.root(), incremental.root());
    }

    proptest! {
        #[test]
        fn appending_in_one_shot_or_incrementally_agrees(n in 0u64..200) {
            let leaves: Vec<[u8;32]> = (0..n).map(leaf).collect();

            let mut whole = CompactRange::new_empty();
            whole.append_all(&leaves);

            let mut incremental = CompactRange::new_empty();
            let mut tiles = std::collections::HashMap::new();
            for (i, l) in leaves.iter().enumerate() {
                let _ = i;
                incremental.append(*l, |node| { tiles.insert((node.level, node.index), node.hash); });
            }

            prop_assert_eq!(whole.root(), incremental.root());

            if n > 0 {
                let rebuilt = CompactRange::from_nodes(n, |level, index| tiles.get(&(level, index)).copied()).unwrap();
                prop_assert_eq!(rebuilt.root(), whole.root());
            }
        }
    }
}
