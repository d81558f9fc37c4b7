// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenario tests, exercising [`crate::Appender`] as a whole
//! against [`crate::storage::MemoryStore`] rather than any one component in
//! isolation. Placed in their own module, separate from the per-file unit
//! tests.
