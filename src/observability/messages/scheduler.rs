// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for scheduler lifecycle and cluster membership events.

use std::fmt::{Display, Formatter};

use tracing::Span;

use crate::observability::messages::StructuredLog;

/// A worker joined the cluster.
pub struct WorkerRegistered<'a> {
    pub worker: &'a str,
    pub ncores: usize,
    pub preloaded_keys: usize,
}

impl Display for WorkerRegistered<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Registered worker {} with {} cores and {} resident keys",
            self.worker, self.ncores, self.preloaded_keys
        )
    }
}

impl StructuredLog for WorkerRegistered<'_> {
    fn log(&self) {
        tracing::info!(
            worker = self.worker,
            ncores = self.ncores,
            preloaded_keys = self.preloaded_keys,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::info_span!(
            "worker_registration",
            span_name = name,
            worker = self.worker,
            ncores = self.ncores,
        )
    }
}

/// A worker left the cluster, voluntarily or not.
pub struct WorkerRemoved<'a> {
    pub worker: &'a str,
    pub resident_keys: usize,
    pub healed: bool,
}

impl Display for WorkerRemoved<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Removed worker {} holding {} resident keys (healed: {})",
            self.worker, self.resident_keys, self.healed
        )
    }
}

impl StructuredLog for WorkerRemoved<'_> {
    fn log(&self) {
        tracing::warn!(
            worker = self.worker,
            resident_keys = self.resident_keys,
            healed = self.healed,
            "{}", self
        );
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "worker_removal",
            span_name = name,
            worker = self.worker,
            resident_keys = self.resident_keys,
        )
    }
}

/// A full cluster restart was requested.
pub struct ClusterRestarted {
    pub workers: usize,
    pub nannies: usize,
}

impl Display for ClusterRestarted {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Restarted cluster: {} workers through {} nannies, all computation state discarded",
            self.workers, self.nannies
        )
    }
}

impl StructuredLog for ClusterRestarted {
    fn log(&self) {
        tracing::warn!(workers = self.workers, nannies = self.nannies, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "cluster_restart",
            span_name = name,
            workers = self.workers,
            nannies = self.nannies,
        )
    }
}
