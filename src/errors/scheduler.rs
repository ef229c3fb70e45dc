// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Errors surfaced by the scheduling core.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::graph::Key;

/// Errors that can occur while scheduling or mutating graph state
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A task is restricted to hosts on which no worker is registered,
    /// and the restriction is not loose
    #[error("task '{key}' has no valid workers under restrictions {restrictions:?}")]
    NoValidWorker {
        key: Key,
        restrictions: BTreeSet<String>,
    },

    /// An operation required at least one registered worker
    #[error("no workers registered")]
    NoWorkers,

    /// The state validator found a broken invariant
    #[error("inconsistent scheduler state: {0}")]
    InconsistentState(String),

    /// A gather could not locate one or more keys on any worker
    #[error("keys not available on any worker: {keys:?}")]
    KeysUnavailable { keys: Vec<Key> },

    /// The scheduler is shutting down and no longer accepts work
    #[error("scheduler is closed")]
    Closed,

    /// I/O failure talking to a collaborator process
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
