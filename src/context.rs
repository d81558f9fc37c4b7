// Copyright (c) Tessera Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::metrics::Metrics;
use crate::options::Options;

/// Context contains the per-log configuration and metrics shared by every
/// component of one [`crate::Appender`].
#[derive(Clone)]
pub struct Context {
    /// Checkpoint `origin` line, e.g. `"example.com/log-name"`.
    pub origin: String,
    pub options: Options,
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(origin: impl Into<String>, options: Options, metrics: Arc<Metrics>) -> Self {
        Self {
            origin: origin.into(),
            options,
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(origin: impl Into<String>, options: Options) -> Self {
        Self::new(origin, options, Arc::new(Metrics::new(&prometheus::Registry::new())))
    }
}
