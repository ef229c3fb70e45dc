// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Collaborator seams the scheduling core talks through.
//!
//! The core never owns sockets; it drives workers, nannies, and the center
//! registry through these traits. Production deployments put a transport
//! behind them; the in-process [`local`] backend and the test doubles put a
//! plain struct behind them.

pub mod local;

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::graph::{Key, Task, WorkerAddr};
use crate::messages::{ComputeResponse, ResourceSample};

/// Remote surface of one worker process.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Execute a task, fetching dependencies from the given locations.
    async fn compute(
        &self,
        key: &Key,
        task: &Task,
        who_has: &HashMap<Key, HashSet<WorkerAddr>>,
    ) -> io::Result<ComputeResponse>;

    /// Install externally supplied values; returns the stored byte sizes.
    async fn update_data(&self, data: HashMap<Key, Value>) -> io::Result<HashMap<Key, u64>>;

    /// Fetch values the worker holds. Absent keys are simply omitted.
    async fn get_data(&self, keys: &[Key]) -> io::Result<HashMap<Key, Value>>;

    /// Drop values from the worker's memory.
    async fn delete_data(&self, keys: &[Key]) -> io::Result<()>;

    /// Generic request/response fan-out channel (`broadcast` op).
    async fn send_recv(&self, msg: Value) -> io::Result<Value>;

    /// Ask the worker to shut down.
    async fn close(&self) -> io::Result<()>;
}

/// Remote surface of a nanny process supervisor.
#[async_trait]
pub trait NannyRpc: Send + Sync {
    /// Kill the supervised worker process.
    async fn kill(&self) -> io::Result<()>;

    /// Start a fresh worker process.
    async fn instantiate(&self) -> io::Result<()>;

    /// Subscribe to periodic resource samples from the supervised worker.
    async fn monitor_resources(
        &self,
        interval: Duration,
    ) -> io::Result<mpsc::Receiver<ResourceSample>>;
}

/// Remote surface of the cluster membership registry.
#[async_trait]
pub trait CenterRpc: Send + Sync {
    async fn ncores(&self) -> io::Result<HashMap<WorkerAddr, usize>>;
    async fn has_what(&self) -> io::Result<HashMap<WorkerAddr, HashSet<Key>>>;
    async fn who_has(&self) -> io::Result<HashMap<Key, HashSet<WorkerAddr>>>;
    async fn nannies(&self) -> io::Result<HashMap<WorkerAddr, Option<u16>>>;
    async fn unregister(&self, addr: &WorkerAddr) -> io::Result<()>;
    async fn close(&self) -> io::Result<()>;
}

/// Dials collaborator endpoints by address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn worker(&self, addr: &WorkerAddr) -> io::Result<Arc<dyn WorkerRpc>>;
    async fn nanny(&self, addr: &WorkerAddr) -> io::Result<Arc<dyn NannyRpc>>;
}

/// Cache of live worker handles, one per address, shared by reference
/// across every dispatcher coroutine. The underlying `WorkerRpc` must
/// tolerate concurrent calls.
pub struct RpcPool {
    connector: Arc<dyn Connector>,
    workers: Mutex<HashMap<WorkerAddr, Arc<dyn WorkerRpc>>>,
}

impl RpcPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// The cached handle for `addr`, dialling on first use.
    pub async fn worker(&self, addr: &WorkerAddr) -> io::Result<Arc<dyn WorkerRpc>> {
        {
            let workers = self.workers.lock().await;
            if let Some(handle) = workers.get(addr) {
                return Ok(handle.clone());
            }
        }
        let handle = self.connector.worker(addr).await?;
        let mut workers = self.workers.lock().await;
        Ok(workers.entry(addr.clone()).or_insert(handle).clone())
    }

    /// Nanny handles are short-lived; no caching.
    pub async fn nanny(&self, addr: &WorkerAddr) -> io::Result<Arc<dyn NannyRpc>> {
        self.connector.nanny(addr).await
    }

    /// Drop the cached handle for a departed worker.
    pub async fn forget(&self, addr: &WorkerAddr) {
        self.workers.lock().await.remove(addr);
    }
}
