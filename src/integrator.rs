// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! The Merkle integrator (C4) — the algorithmic core of the
//! append pipeline. Builds on the pure [`crate::range::CompactRange`]
//! algorithm, adding the effectful parts: reading just-enough existing tile
//! state to resume the compact range at the current tree size, stamping
//! newly finalized nodes into tiles, and writing the new tree state last so
//! its durable visibility is the integration linearization point.

use std::collections::HashMap;

use crate::error::{TesseraError, TesseraResult};
use crate::range::CompactRange;
use crate::storage::{LogStore, TreeState};
use crate::tile::{self, Tile};

/// Number of sub-level-0 (tile-own-row) entries of tile `(tile_level,
/// tile_index)` that are already durable at tree size `size`.
fn tile_fill_at(tile_level: u8, tile_index: u64, size: u64) -> usize {
    let step = 1u64 << (8 * tile_level as u32);
    let complete_rows = size / step;
    let base = tile_index * 256;
    complete_rows.saturating_sub(base).min(256) as usize
}

async fn load_tile(
    store: &dyn LogStore,
    tile_level: u8,
    tile_index: u64,
    size: u64,
) -> TesseraResult<Tile> {
    let fill = tile_fill_at(tile_level, tile_index, size);
    if fill == 0 {
        return Ok(Tile::new());
    }
    let partial_size = if fill == 256 { None } else { Some(fill as u8) };
    let bytes = store
        .read_tile(tile_level, tile_index, partial_size)
        .await?
        .ok_or_else(|| {
            TesseraError::invariant(format!(
                "tile ({tile_level}, {tile_index}) claimed by tree state (fill={fill}) but not readable"
            ))
        })?;
    Tile::deserialize(&bytes)
        .ok_or_else(|| TesseraError::invariant(format!("tile ({tile_level}, {tile_index}) is corrupt")))
}

/// Reconstructs the compact range for `[0, size)`, reading only the right-
/// spine nodes it needs, each by loading
/// the owning tile (full or partial, as dictated by `size`) and, if the node
/// isn't itself tile-aligned, re-deriving it from that tile's stored row.
async fn load_compact_range(store: &dyn LogStore, size: u64) -> TesseraResult<CompactRange> {
    let coords = CompactRange::node_coordinates(size);
    let mut tiles: HashMap<(u8, u64), Tile> = HashMap::new();
    for (level, index) in &coords {
        let coord = tile::tile_coordinate(*level, *index);
        let key = (coord.tile_level, coord.tile_index);
        if let std::collections::hash_map::Entry::Vacant(e) = tiles.entry(key) {
            e.insert(load_tile(store, key.0, key.1, size).await?);
        }
    }
    CompactRange::from_nodes(size, |level, index| {
        let coord = tile::tile_coordinate(level, index);
        let tile = tiles.get(&(coord.tile_level, coord.tile_index))?;
        if coord.sub_level == 0 {
            tile.get(coord.sub_index as usize)
        } else {
            tile::derive_internal_node(tile, coord.sub_level, coord.sub_index)
        }
    })
    .ok_or_else(|| TesseraError::invariant("failed to reconstruct compact range from stored tiles"))
}

/// Extends the tree by `leaves` (already RFC 6962 leaf-hashed), writing any
/// newly completed/extended tiles and, last, the new tree state. Returns the
/// resulting tree state.
///
/// Preconditions: `leaves` is non-empty and at most one integration for this
/// log is in flight at a time.
pub async fn integrate(
    store: &dyn LogStore,
    starting_size: u64,
    leaves: &[[u8; 32]],
) -> TesseraResult<TreeState> {
    let mut range = load_compact_range(store, starting_size).await?;

    let mut finalized = Vec::new();
    for leaf in leaves {
        range.append(*leaf, |node| finalized.push(node));
    }
    let new_state = TreeState {
        size: range.size(),
        root_hash: range.root(),
    };

    let mut touched: HashMap<(u8, u64), Tile> = HashMap::new();
    for node in &finalized {
        if !tile::is_tile_boundary(node.level) {
            continue;
        }
        let coord = tile::tile_coordinate(node.level, node.index);
        let key = (coord.tile_level, coord.tile_index);
        if !touched.contains_key(&key) {
            let existing = load_tile(store, key.0, key.1, starting_size).await?;
            touched.insert(key, existing);
        }
        touched.get_mut(&key).unwrap().push(node.hash);
    }

    for ((tile_level, tile_index), tile) in touched {
        let partial_size = if tile.is_full() {
            None
        } else {
            Some(tile.len() as u8)
        };
        store
            .write_tile(tile_level, tile_index, partial_size, tile.serialize())
            .await?;
    }

    // Linearization point: durable visibility of the new tree state is what
    // makes this integration observable.
    store.write_tree_state(new_state).await?;
    Ok(new_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::rfc6962_leaf_hash;
    use crate::storage::MemoryStore;

    fn leaf(n: u64) -> [u8; 32] {
        rfc6962_leaf_hash(&n.to_be_bytes())
    }

    #[tokio::test]
    async fn integrates_in_multiple_rounds_matches_one_shot() {
        let store_multi = MemoryStore::new();
        let mut size = 0u64;
        for round in 0..5u64 {
            let leaves: Vec<_> = (0..7).map(|i| leaf(round * 7 + i)).collect();
            let state = integrate(&*store_multi, size, &leaves).await.unwrap();
            size = state.size;
        }

        let store_one_shot = MemoryStore::new();
        let leaves: Vec<_> = (0..35).map(leaf).collect();
        let state_one_shot = integrate(&*store_one_shot, 0, &leaves).await.unwrap();

        let final_state = store_multi.read_tree_state().await.unwrap().unwrap();
        assert_eq!(final_state.size, 35);
        assert_eq!(final_state.root_hash, state_one_shot.root_hash);
    }

    #[tokio::test]
    async fn tree_state_matches_pure_compact_range_over_same_leaves() {
        let store = MemoryStore::new();
        let leaves: Vec<_> = (0..300).map(leaf).collect();
        integrate(&*store, 0, &leaves).await.unwrap();

        let mut reference = CompactRange::new_empty();
        reference.append_all(&leaves);

        let state = store.read_tree_state().await.unwrap().unwrap();
        assert_eq!(state.size, 300);
        assert_eq!(state.root_hash, reference.root());
    }

    #[tokio::test]
    async fn restart_resumes_from_durable_tree_state_alone() {
        let store = MemoryStore::new();
        let leaves: Vec<_> = (0..10).map(leaf).collect();
        integrate(&*store, 0, &leaves[..6]).await.unwrap();
        // Simulate a fresh process: only tree state + tiles on disk are used.
        let resumed = integrate(&*store, 6, &leaves[6..]).await.unwrap();

        let mut reference = CompactRange::new_empty();
        reference.append_all(&leaves);
        assert_eq!(resumed.root_hash, reference.root());
        assert_eq!(resumed.size, 10);
    }
}
