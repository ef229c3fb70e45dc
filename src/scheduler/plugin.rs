// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Observer plugins invoked synchronously from state transitions.
//!
//! Hooks run inside the transition that triggered them, against a snapshot
//! copy of the plugin list, and their failures are logged and swallowed; a
//! plugin can never abort a transition.

use std::collections::{HashMap, HashSet};

use crate::graph::{Key, Task, WorkerAddr};
use crate::scheduler::state::SchedulerState;

/// External observer of scheduler transitions. Every hook has a default
/// no-op body, so implementors override only what they watch.
pub trait SchedulerPlugin: Send + Sync {
    /// A task completed and its result entered distributed memory.
    fn task_finished(
        &self,
        _state: &SchedulerState,
        _key: &Key,
        _worker: &WorkerAddr,
        _nbytes: u64,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A task raised on a worker.
    fn task_erred(
        &self,
        _state: &SchedulerState,
        _key: &Key,
        _worker: &WorkerAddr,
        _exception: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A sub-graph was admitted.
    fn update_graph(
        &self,
        _state: &SchedulerState,
        _dsk: &HashMap<Key, Task>,
        _keys: &HashSet<Key>,
        _restrictions: &HashMap<Key, HashSet<String>>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// The cluster was restarted and all computation state discarded.
    fn restart(&self, _state: &SchedulerState) -> anyhow::Result<()> {
        Ok(())
    }
}
