// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! Entry bundle artifact.
//!
//! A bundle is the concatenation, in index order, of each entry's
//! materialized bundle bytes for a contiguous run of up to 256 entries
//! sharing the same high-order index (`index / 256`). Entries already carry
//! their own length prefix (see [`crate::entry::DefaultMaterializer`]), so a
//! bundle's wire form is simply the concatenation of its entries' bytes in
//! order; parsing walks that same length prefix back off.

use crate::error::{TesseraError, TesseraResult};
use crate::layout::TILE_WIDTH;

/// An in-progress or flushed entry bundle: up to 256 entries sharing bundle
/// index `b = index / 256`.
#[derive(Debug, Clone, Default)]
pub struct EntryBundle {
    entries: Vec<Vec<u8>>,
}

impl EntryBundle {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(TILE_WIDTH),
        }
    }

    pub fn push(&mut self, bundle_bytes: Vec<u8>) {
        assert!(self.entries.len() < TILE_WIDTH, "bundle is already full");
        self.entries.push(bundle_bytes);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() == TILE_WIDTH
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.entries.concat()
    }

    /// Parses the length-prefixed entries out of a serialized bundle (full
    /// or partial). Used by the migration target and by the persistent
    /// antispam follower, both of which only ever see already-published
    /// bytes.
    pub fn parse(bytes: &[u8]) -> TesseraResult<Vec<&[u8]>> {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            if offset + 4 > bytes.len() {
                return Err(TesseraError::invariant("truncated bundle length prefix"));
            }
            let len = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + len > bytes.len() {
                return Err(TesseraError::invariant("truncated bundle entry data"));
            }
            entries.push(&bytes[offset..offset + len]);
            offset += len;
        }
        Ok(entries)
    }
}

/// Per-entry leaf hasher used to recover leaf hashes from a bundle's raw
/// bytes during migration integration. CT-shaped logs, whose leaf hash
/// depends on the assigned index, supply their own via
/// `Options::bundle_leaf_hasher`; [`default_bundle_leaf_hasher`] covers
/// index-independent logs.
pub type BundleLeafHasher = dyn Fn(&[u8]) -> TesseraResult<Vec<[u8; 32]>> + Send + Sync;

/// Default `bundleLeafHasher`: recovers the
/// RFC 6962 leaf hash of each entry in a bundle, for non-CT logs where the
/// leaf hash does not depend on the assigned index.
pub fn default_bundle_leaf_hasher(bundle_bytes: &[u8]) -> TesseraResult<Vec<[u8; 32]>> {
    Ok(EntryBundle::parse(bundle_bytes)?
        .into_iter()
        .map(crate::entry::rfc6962_leaf_hash)
        .collect())
}

/// Default `bundleIdHasher`/`bundleHasher`: recovers
/// the dedup identity hash of each entry in a bundle.
pub fn default_bundle_identity_hasher(bundle_bytes: &[u8]) -> TesseraResult<Vec<[u8; 32]>> {
    Ok(EntryBundle::parse(bundle_bytes)?
        .into_iter()
        .map(crate::entry::default_identity)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Entry, EntryMaterializer};

    #[test]
    fn parse_round_trips_pushed_entries() {
        let mut bundle = EntryBundle::new();
        let mut expected = Vec::new();
        for data in [&b"a"[..], b"bb", b"ccc"] {
            let e = Entry::new(data.to_vec());
            let (bytes, _) = crate::entry::DefaultMaterializer.materialize(e.data(), 0);
            bundle.push(bytes);
            expected.push(data.to_vec());
        }
        let serialized = bundle.serialize();
        let parsed = EntryBundle::parse(&serialized).unwrap();
        let parsed: Vec<Vec<u8>> = parsed.into_iter().map(|s| s.to_vec()).collect();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn rejects_truncated_bundle() {
        let err = EntryBundle::parse(&[0, 0, 0, 5, 1, 2]);
        assert!(err.is_err());
    }
}
