// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Typed messages exchanged between the scheduler, its worker dispatchers,
//! and attached observers.
//!
//! Everything that conceptually crosses a process boundary derives `serde`.
//! `SchedulerCommand` is the in-process actor protocol; its reply-carrying
//! variants hold oneshot senders and therefore stay unserialised.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::errors::SchedulerError;
use crate::graph::{Key, Task, WorkerAddr};
use crate::scheduler::SchedulerState;

/// Instruction delivered on a worker's dispatcher queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum WorkerCommand {
    /// Run one task on the worker, shipping the locations of its inputs
    ComputeTask {
        key: Key,
        task: Task,
        who_has: HashMap<Key, HashSet<WorkerAddr>>,
    },
    /// Shut down one dispatcher core
    Close { report: bool },
}

/// Outcome of a single compute (or raw-data upload) round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ComputeResponse {
    /// The task ran and its result now lives on the worker
    Finished { nbytes: u64 },
    /// User code raised; the error and traceback travel back verbatim
    Error { exception: String, traceback: String },
    /// One or more dependencies were absent on every reachable worker
    MissingData { missing: HashSet<Key> },
}

/// Events published to every attached report observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Report {
    StreamStart,
    KeyInMemory { key: Key, workers: Vec<WorkerAddr> },
    TaskErred { key: Key, exception: String, traceback: String },
    LostKey { key: Key },
    Restart,
    WorkerFinished { worker: WorkerAddr },
    StreamClosed,
    Close,
}

/// A resource usage sample pushed by a nanny.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub timestamp_ms: u64,
}

/// Projection applied to the scheduler state on each feed tick.
pub type FeedProjection = Box<dyn Fn(&SchedulerState, Option<&Value>) -> Value + Send + Sync>;
/// One-time setup producing the feed's carried state.
pub type FeedSetup = Box<dyn Fn(&SchedulerState) -> Value + Send + Sync>;
/// Teardown invoked when the feed observer hangs up.
pub type FeedTeardown = Box<dyn Fn(&SchedulerState, Option<&Value>) + Send + Sync>;

/// The scheduler's inbound operation set.
pub enum SchedulerCommand {
    Register {
        addr: WorkerAddr,
        keys: HashSet<Key>,
        ncores: usize,
        nanny_port: Option<u16>,
    },
    Unregister {
        addr: WorkerAddr,
    },
    UpdateGraph {
        dsk: HashMap<Key, Task>,
        keys: HashSet<Key>,
        restrictions: Option<HashMap<Key, HashSet<String>>>,
        loose_restrictions: Option<HashSet<Key>>,
    },
    UpdateData {
        who_has: HashMap<Key, HashSet<WorkerAddr>>,
        nbytes: HashMap<Key, u64>,
    },
    MissingData {
        missing: HashSet<Key>,
        key: Option<Key>,
        worker: Option<WorkerAddr>,
    },
    ReleaseHeldData {
        keys: HashSet<Key>,
    },
    Restart,
    Gather {
        keys: Vec<Key>,
        resp: oneshot::Sender<Result<HashMap<Key, Value>, SchedulerError>>,
    },
    Scatter {
        data: HashMap<Key, Value>,
        workers: Option<Vec<WorkerAddr>>,
        resp: oneshot::Sender<Result<HashMap<Key, HashSet<WorkerAddr>>, SchedulerError>>,
    },
    Broadcast {
        msg: Value,
        resp: oneshot::Sender<Result<HashMap<WorkerAddr, Value>, SchedulerError>>,
    },
    Ncores {
        addresses: Option<Vec<WorkerAddr>>,
        resp: oneshot::Sender<HashMap<WorkerAddr, Option<usize>>>,
    },
    HasWhat {
        addresses: Option<Vec<WorkerAddr>>,
        resp: oneshot::Sender<HashMap<WorkerAddr, HashSet<Key>>>,
    },
    WhoHas {
        keys: Option<Vec<Key>>,
        resp: oneshot::Sender<HashMap<Key, HashSet<WorkerAddr>>>,
    },
    Feed {
        function: FeedProjection,
        setup: Option<FeedSetup>,
        teardown: Option<FeedTeardown>,
        interval: Duration,
        sink: mpsc::Sender<Value>,
    },
    Terminate,
}

impl std::fmt::Debug for SchedulerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            SchedulerCommand::Register { .. } => "register",
            SchedulerCommand::Unregister { .. } => "unregister",
            SchedulerCommand::UpdateGraph { .. } => "update-graph",
            SchedulerCommand::UpdateData { .. } => "update-data",
            SchedulerCommand::MissingData { .. } => "missing-data",
            SchedulerCommand::ReleaseHeldData { .. } => "release-held-data",
            SchedulerCommand::Restart => "restart",
            SchedulerCommand::Gather { .. } => "gather",
            SchedulerCommand::Scatter { .. } => "scatter",
            SchedulerCommand::Broadcast { .. } => "broadcast",
            SchedulerCommand::Ncores { .. } => "ncores",
            SchedulerCommand::HasWhat { .. } => "has_what",
            SchedulerCommand::WhoHas { .. } => "who_has",
            SchedulerCommand::Feed { .. } => "feed",
            SchedulerCommand::Terminate => "terminate",
        };
        f.debug_struct("SchedulerCommand").field("op", &op).finish()
    }
}
