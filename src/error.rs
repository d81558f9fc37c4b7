// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors surfaced by the append pipeline and migration target.
///
/// [`TesseraError::Pushback`] is returned
/// to the caller immediately and is not a failure; [`TesseraError::Io`] is
/// transient and the failing batch/task is abandoned and retried later;
/// [`TesseraError::Invariant`] is fatal and halts the affected workflow.
#[derive(Error, Debug, Clone)]
pub enum TesseraError {
    /// The queue or antispam buffer is saturated. Callers must retry later.
    #[error("pushback: too many outstanding entries")]
    Pushback,

    /// A transient I/O failure against the driver (storage backend).
    #[error("driver I/O error: {0}")]
    Io(String),

    /// A logic or invariant violation: assigned index mismatch, local root
    /// disagreement during migration, a tile claimed by tree-state but not
    /// readable, etc. Requires operator attention.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The checkpoint signer returned an error.
    #[error("checkpoint signer failed: {0}")]
    Signer(String),
}

impl TesseraError {
    pub fn io(err: impl std::fmt::Display) -> Self {
        TesseraError::Io(err.to_string())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        TesseraError::Invariant(msg.into())
    }

    /// Whether this error should be retried by a background loop rather than
    /// treated as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, TesseraError::Io(_) | TesseraError::Pushback)
    }
}

pub type TesseraResult<T> = Result<T, TesseraError>;
