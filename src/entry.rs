// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! Entry model (C1).
//!
//! An [`Entry`] is immutable once constructed. Its bundle-serialized bytes
//! and RFC 6962 leaf hash are late-bound: they are only computed once the
//! sequencer has assigned the entry its index, via [`Entry::materialize`].
//! Before that point only [`Entry::data`] and [`Entry::identity`] are legal
//! to read.

use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// RFC 6962 leaf hash: `H(0x00 || leafBytes)`.
pub fn rfc6962_leaf_hash(leaf_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(leaf_bytes);
    hasher.finalize().into()
}

/// RFC 6962 interior node hash: `H(0x01 || left || right)`.
pub fn rfc6962_node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Computes the default identity hash of an entry: plain SHA-256 of its data.
/// Applications whose notion of "sameness" is semantic (e.g. Certificate
/// Transparency, which dedups on the parsed certificate rather than its raw
/// submission encoding) override this via [`Entry::with_identity`].
pub fn default_identity(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Per-entry override hook, exposed to a host application via
/// [`crate::options::Options::identity_hasher`], letting it assign the
/// identity hash used for dedup equivalence independently of
/// [`default_identity`].
pub trait IdentityHasher: Send + Sync {
    fn identity(&self, data: &[u8]) -> [u8; 32];
}

/// Computes an entry's bundle bytes and leaf hash given its assigned index.
/// The generic (non-CT) default ignores `index` entirely: bundle bytes are a
/// length-prefixed copy of the submitted data, and the leaf hash is the
/// plain RFC 6962 hash of that data. A CT-shaped log supplies its own
/// implementation whose output is a function of `index` as well as `data`.
pub trait EntryMaterializer: Send + Sync {
    /// Returns `(bundle_bytes, leaf_hash)` for `data` once it has been
    /// assigned `index`.
    fn materialize(&self, data: &[u8], index: u64) -> (Vec<u8>, [u8; 32]);
}

/// Default materializer for generic (non-CT) logs: a 4-byte big-endian
/// length prefix followed by the raw entry data, leaf-hashed per RFC 6962.
pub struct DefaultMaterializer;

impl EntryMaterializer for DefaultMaterializer {
    fn materialize(&self, data: &[u8], _index: u64) -> (Vec<u8>, [u8; 32]) {
        let mut bundle_bytes = Vec::with_capacity(4 + data.len());
        bundle_bytes.extend_from_slice(&(data.len() as u32).to_be_bytes());
        bundle_bytes.extend_from_slice(data);
        (bundle_bytes, rfc6962_leaf_hash(data))
    }
}

/// An immutable, not-yet-sequenced submission. Owned by the caller until
/// returned from `Add`, then by the batching queue, then by the sequencer
/// until its index future resolves.
#[derive(Clone)]
pub struct Entry {
    data: Bytes,
    identity: [u8; 32],
    materializer: Arc<dyn EntryMaterializer>,
}

impl Entry {
    /// Builds an entry whose identity is the default SHA-256 of `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let identity = default_identity(&data);
        Self {
            data,
            identity,
            materializer: Arc::new(DefaultMaterializer),
        }
    }

    /// Builds an entry with an explicit identity override, for applications
    /// whose dedup equivalence is semantic rather than byte-exact
    ///.
    pub fn with_identity(data: impl Into<Bytes>, identity: [u8; 32]) -> Self {
        Self {
            data: data.into(),
            identity,
            materializer: Arc::new(DefaultMaterializer),
        }
    }

    /// Builds an entry with a custom late-binding materializer, for logs
    /// (e.g. CT) whose bundle bytes and leaf hash depend on the assigned
    /// index.
    pub fn with_materializer(
        data: impl Into<Bytes>,
        identity: [u8; 32],
        materializer: Arc<dyn EntryMaterializer>,
    ) -> Self {
        Self {
            data: data.into(),
            identity,
            materializer,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn identity(&self) -> [u8; 32] {
        self.identity
    }

    /// Late-bound: computes this entry's bundle bytes and leaf hash now that
    /// `index` has been assigned. Must only be called once per entry, by the
    /// sequencer.
    pub(crate) fn materialize(&self, index: u64) -> (Vec<u8>, [u8; 32]) {
        self.materializer.materialize(&self.data, index)
    }

    /// Lossless marshal of the pre-sequencing state of an entry: `data` and
    /// `identity`. Used to satisfy the dedup round-trip law; the
    /// leaf hash and bundle bytes are not part of this form because, for a
    /// CT-shaped materializer, they do not exist until an index is assigned.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len() + 32);
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.identity);
        out
    }

    /// Inverse of [`Entry::marshal`]. The unmarshaled entry always carries
    /// the default materializer: a custom materializer is not itself
    /// serializable and must be reattached by the caller if needed.
    pub fn unmarshal(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes(bytes[0..4].try_into().ok()?) as usize;
        if bytes.len() != 4 + len + 32 {
            return None;
        }
        let data = Bytes::copy_from_slice(&bytes[4..4 + len]);
        let identity: [u8; 32] = bytes[4 + len..4 + len + 32].try_into().ok()?;
        Some(Self {
            data,
            identity,
            materializer: Arc::new(DefaultMaterializer),
        })
    }
}

/// Result of a successful or deduplicated `Add`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Index {
    pub index: u64,
    /// `true` if `index` was assigned to an earlier, identity-equivalent
    /// submission rather than to this one.
    pub is_dup: bool,
}

impl Index {
    pub fn new(index: u64) -> Self {
        Self {
            index,
            is_dup: false,
        }
    }

    pub fn dup_of(index: u64) -> Self {
        Self {
            index,
            is_dup: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_round_trips() {
        let e = Entry::new(Bytes::from_static(b"hello world"));
        let bytes = e.marshal();
        let e2 = Entry::unmarshal(&bytes).unwrap();
        assert_eq!(e2.data(), e.data());
        assert_eq!(e2.identity(), e.identity());
    }

    #[test]
    fn default_materializer_is_index_independent() {
        let e = Entry::new(Bytes::from_static(b"A"));
        let (bundle0, leaf0) = e.materialize(0);
        let (bundle7, leaf7) = e.materialize(7);
        assert_eq!(bundle0, bundle7);
        assert_eq!(leaf0, leaf7);
        assert_eq!(leaf0, rfc6962_leaf_hash(b"A"));
    }

    #[test]
    fn identity_override_changes_dedup_key_not_data() {
        let custom = [7u8; 32];
        let e = Entry::with_identity(Bytes::from_static(b"A"), custom);
        assert_eq!(e.identity(), custom);
        assert_eq!(e.data(), b"A");
    }
}
