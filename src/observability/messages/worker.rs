// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Message types for dispatcher and worker stream events.

use std::fmt::{Display, Formatter};

use tracing::Span;

use crate::observability::messages::StructuredLog;

/// A worker's stream failed; the worker is being dropped from the cluster.
pub struct WorkerStreamFailed<'a> {
    pub worker: &'a str,
    pub error: &'a str,
}

impl Display for WorkerStreamFailed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "Worker {} failed from closed stream: {}",
            self.worker, self.error
        )
    }
}

impl StructuredLog for WorkerStreamFailed<'_> {
    fn log(&self) {
        tracing::warn!(worker = self.worker, error = self.error, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::warn_span!(
            "worker_stream_failure",
            span_name = name,
            worker = self.worker,
        )
    }
}

/// A dispatcher core shut down cleanly.
pub struct DispatcherClosed<'a> {
    pub worker: &'a str,
    pub core: usize,
}

impl Display for DispatcherClosed<'_> {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Dispatcher core {} for worker {} closed", self.core, self.worker)
    }
}

impl StructuredLog for DispatcherClosed<'_> {
    fn log(&self) {
        tracing::debug!(worker = self.worker, core = self.core, "{}", self);
    }

    fn span(&self, name: &str) -> Span {
        tracing::debug_span!(
            "dispatcher_close",
            span_name = name,
            worker = self.worker,
            core = self.core,
        )
    }
}
