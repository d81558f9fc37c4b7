// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hash tile packing.
//!
//! A tile groups 8 consecutive Merkle levels into one artifact: tile
//! `(level, index)` physically stores the up-to-256 node hashes at absolute
//! Merkle level `8 * level`, each of which is itself the subtree root of a
//! 256-leaf range of the tile one row below (`level - 1`). This keeps a full
//! tile at exactly `256 * 32` bytes, matching the tlog-tiles
//! convention; hashes at the 7 intermediate levels within a tile's span are
//! never persisted, since a reader can always re-derive them from the 256
//! stored hashes by combining the relevant sub-range with
//! [`derive_internal_node`].

use crate::entry::rfc6962_node_hash;
use crate::layout::TILE_WIDTH;

/// A (possibly partial) hash tile: up to 256 contiguous node hashes at one
/// Merkle level.
#[derive(Debug, Clone, Default)]
pub struct Tile {
    hashes: Vec<[u8; 32]>,
}

impl Tile {
    pub fn new() -> Self {
        Self {
            hashes: Vec::with_capacity(TILE_WIDTH),
        }
    }

    pub fn push(&mut self, hash: [u8; 32]) {
        assert!(self.hashes.len() < TILE_WIDTH, "tile is already full");
        self.hashes.push(hash);
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.hashes.len() == TILE_WIDTH
    }

    pub fn get(&self, sub_index: usize) -> Option<[u8; 32]> {
        self.hashes.get(sub_index).copied()
    }

    pub fn hashes(&self) -> &[[u8; 32]] {
        &self.hashes
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.hashes.len() * 32);
        for h in &self.hashes {
            out.extend_from_slice(h);
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 32 != 0 || bytes.len() / 32 > TILE_WIDTH {
            return None;
        }
        let hashes = bytes
            .chunks_exact(32)
            .map(|c| c.try_into().unwrap())
            .collect();
        Some(Self { hashes })
    }
}

/// Maps an absolute `(level, index)` Merkle-tree coordinate to the tile that
/// owns it: `tileLevel = level/8`, `tileIndex =
/// index/256`; within the tile, `subLevel = level%8`, `subIndex = index %
/// (256 >> subLevel)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoordinate {
    pub tile_level: u8,
    pub tile_index: u64,
    pub sub_level: u8,
    pub sub_index: u64,
}

pub fn tile_coordinate(level: u8, index: u64) -> TileCoordinate {
    TileCoordinate {
        tile_level: level / 8,
        tile_index: index / TILE_WIDTH as u64,
        sub_level: level % 8,
        sub_index: index % (TILE_WIDTH as u64 >> (level % 8)),
    }
}

/// Whether a finalized node at `level` is physically stored in a tile (as
/// opposed to being derivable from one). Only the bottom of each tile's span
/// is persisted.
pub fn is_tile_boundary(level: u8) -> bool {
    level % 8 == 0
}

/// Re-derives the node hash at `sub_level` sub-levels above the tile's own
/// stored row, `sub_index` nodes across, by combining the corresponding
/// `2^sub_level` stored hashes. Used by readers needing a node at a Merkle
/// level that is not itself tile-aligned.
pub fn derive_internal_node(tile: &Tile, sub_level: u8, sub_index: u64) -> Option<[u8; 32]> {
    let width = 1usize << sub_level;
    let start = sub_index as usize * width;
    let end = start + width;
    let leaves = tile.hashes.get(start..end)?;
    Some(reduce(leaves))
}

fn reduce(hashes: &[[u8; 32]]) -> [u8; 32] {
    if hashes.len() == 1 {
        return hashes[0];
    }
    let mid = hashes.len() / 2;
    let left = reduce(&hashes[..mid]);
    let right = reduce(&hashes[mid..]);
    rfc6962_node_hash(&left, &right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_round_trips() {
        let mut t = Tile::new();
        for i in 0..10u8 {
            t.push([i; 32]);
        }
        let bytes = t.serialize();
        assert_eq!(bytes.len(), 320);
        let t2 = Tile::deserialize(&bytes).unwrap();
        assert_eq!(t2.len(), 10);
        assert_eq!(t2.get(3), Some([3u8; 32]));
    }

    #[test]
    fn coordinate_mapping_matches_spec_formula() {
        let c = tile_coordinate(8, 300);
        assert_eq!(c.tile_level, 1);
        assert_eq!(c.tile_index, 1);
        assert_eq!(c.sub_level, 0);
        assert_eq!(c.sub_index, 300 % 256);
    }

    #[test]
    fn boundary_levels_are_multiples_of_eight() {
        assert!(is_tile_boundary(0));
        assert!(is_tile_boundary(8));
        assert!(!is_tile_boundary(3));
    }

    #[test]
    fn derive_internal_node_matches_manual_reduction() {
        let mut t = Tile::new();
        for i in 0..4u8 {
            t.push([i; 32]);
        }
        let top = derive_internal_node(&t, 2, 0).unwrap();
        let l = rfc6962_node_hash(&[0u8; 32], &[1u8; 32]);
        let r = rfc6962_node_hash(&[2u8; 32], &[3u8; 32]);
        assert_eq!(top, rfc6962_node_hash(&l, &r));
    }
}
