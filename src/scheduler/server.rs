//! The scheduler server: dispatcher coroutines, the command multiplexer,
//! report fan-out, and cluster lifecycle operations.
//!
//! All graph state lives in one [`SchedulerState`] behind a single mutex;
//! transitions run under one lock acquisition and the lock is never held
//! across worker I/O. Each worker gets one dispatcher queue shared by
//! `ncores` dispatcher coroutines, so per-worker message order is FIFO and
//! a `close` per core drains the pool cleanly. Stream failures on any core
//! translate into `remove_worker` for the whole worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::errors::SchedulerError;
use crate::graph::{Key, Task, WorkerAddr};
use crate::messages::{
    ComputeResponse, FeedProjection, FeedSetup, FeedTeardown, Report, ResourceSample,
    SchedulerCommand, WorkerCommand,
};
use crate::observability::messages::scheduler::{
    ClusterRestarted, WorkerRegistered, WorkerRemoved,
};
use crate::observability::messages::worker::{DispatcherClosed, WorkerStreamFailed};
use crate::observability::messages::StructuredLog;
use crate::scheduler::plugin::SchedulerPlugin;
use crate::scheduler::state::SchedulerState;
use crate::worker::{CenterRpc, Connector, RpcPool};

/// Basic information about a scheduler and its cluster.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerIdentity {
    pub kind: String,
    pub id: String,
    pub workers: Vec<WorkerAddr>,
}

/// Dynamic distributed task scheduler.
///
/// The scheduler tracks the current state of workers, data, and
/// computations, reacts to events by controlling workers, and continuously
/// works toward the requested outputs of an ever-growing task graph. It
/// never computes anything itself; it only decides and records.
pub struct Scheduler {
    id: String,
    config: SchedulerConfig,
    state: Arc<Mutex<SchedulerState>>,
    pool: Arc<RpcPool>,
    center: Option<Arc<dyn CenterRpc>>,
    reports: broadcast::Sender<Report>,
    worker_tasks: Mutex<HashMap<WorkerAddr, JoinHandle<()>>>,
    resource_logs: Mutex<HashMap<WorkerAddr, VecDeque<ResourceSample>>>,
    shutdown: CancellationToken,
    closing: AtomicBool,
    periodic_started: AtomicBool,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        connector: Arc<dyn Connector>,
        center: Option<Arc<dyn CenterRpc>>,
    ) -> Arc<Self> {
        let (reports, _) = broadcast::channel(1024);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Arc::new(Self {
            id: format!("scheduler-{nanos:x}"),
            state: Arc::new(Mutex::new(SchedulerState::new(reports.clone()))),
            pool: Arc::new(RpcPool::new(connector)),
            center,
            config,
            reports,
            worker_tasks: Mutex::new(HashMap::new()),
            resource_logs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            periodic_started: AtomicBool::new(false),
        })
    }

    /// Attach an observer to the report fan-out. Observers that cannot keep
    /// up lag and drop messages instead of stalling the scheduler.
    pub fn subscribe(&self) -> broadcast::Receiver<Report> {
        self.reports.subscribe()
    }

    /// Shared handle to the mutable state, mainly for introspection.
    pub fn state(&self) -> Arc<Mutex<SchedulerState>> {
        self.state.clone()
    }

    pub async fn add_plugin(&self, plugin: Arc<dyn SchedulerPlugin>) {
        self.state.lock().await.add_plugin(plugin);
    }

    /// Basic information about ourselves and our cluster.
    pub async fn identity(&self) -> SchedulerIdentity {
        let state = self.state.lock().await;
        let mut workers: Vec<WorkerAddr> = state.ncores.keys().cloned().collect();
        workers.sort();
        SchedulerIdentity {
            kind: "Scheduler".to_string(),
            id: self.id.clone(),
            workers,
        }
    }

    /// Reset computation state, spawn dispatchers for every registered
    /// worker, start the periodic delete broadcast, and heal.
    pub async fn start(self: &Arc<Self>) {
        let (receivers, cores) = {
            let mut state = self.state.lock().await;
            (state.reset_for_start(), state.ncores.clone())
        };
        for (addr, rx) in receivers {
            let ncores = cores.get(&addr).copied().unwrap_or(1);
            self.spawn_worker(addr, rx, ncores).await;
        }
        if let Err(err) = self.state.lock().await.heal_state() {
            error!(%err, "heal after start failed");
        }
        self.start_periodic_tasks();
        info!(id = %self.id, "scheduler running");
    }

    /// Pull cluster membership from the center registry and start listening
    /// to its nannies for resource samples.
    pub async fn sync_center(self: &Arc<Self>) {
        let Some(center) = self.center.clone() else {
            return;
        };
        let fetched = async {
            Ok::<_, io::Error>((
                center.ncores().await?,
                center.has_what().await?,
                center.who_has().await?,
                center.nannies().await?,
            ))
        }
        .await;
        let (ncores, has_what, who_has, nannies) = match fetched {
            Ok(parts) => parts,
            Err(err) => {
                warn!(%err, "could not sync with center");
                return;
            }
        };
        {
            let mut state = self.state.lock().await;
            state.ncores = ncores;
            state.has_what = has_what;
            state.who_has = who_has;
            state.nannies = nannies.clone();
        }
        for (worker, port) in nannies {
            if let Some(port) = port {
                self.clone()
                    .spawn_nanny_listener(WorkerAddr::new(worker.host, port))
                    .await;
            }
        }
    }

    /// Register a worker and, if it is new, launch its dispatchers.
    pub async fn add_worker(
        self: &Arc<Self>,
        addr: WorkerAddr,
        keys: HashSet<Key>,
        ncores: usize,
        nanny_port: Option<u16>,
    ) {
        let preloaded = keys.len();
        let receiver = {
            self.state
                .lock()
                .await
                .add_worker_state(&addr, keys, ncores, nanny_port)
        };
        WorkerRegistered {
            worker: &addr.to_string(),
            ncores,
            preloaded_keys: preloaded,
        }
        .log();
        if let Some(rx) = receiver {
            self.spawn_worker(addr, rx, ncores).await;
        }
    }

    /// Drop a worker and heal the surviving state around the loss.
    pub async fn remove_worker(self: &Arc<Self>, addr: &WorkerAddr) {
        self.remove_worker_inner(addr, true).await;
    }

    async fn remove_worker_inner(self: &Arc<Self>, addr: &WorkerAddr, heal: bool) {
        let (removed, resident) = {
            let mut state = self.state.lock().await;
            let resident = state.has_what.get(addr).map_or(0, HashSet::len);
            let removed = match state.remove_worker_state(addr, heal) {
                Ok(removed) => removed,
                Err(err) => {
                    error!(%err, worker = %addr, "heal after worker removal failed");
                    true
                }
            };
            (removed, resident)
        };
        if removed {
            self.pool.forget(addr).await;
            WorkerRemoved {
                worker: &addr.to_string(),
                resident_keys: resident,
                healed: heal,
            }
            .log();
        }
    }

    /// Admit a new sub-graph. Placement failures (no workers, violated
    /// restrictions) surface synchronously from here. Restriction hosts
    /// resolve to IPs before the state lock is taken, so DNS latency never
    /// stalls the transition.
    pub async fn update_graph(
        &self,
        dsk: HashMap<Key, Task>,
        keys: HashSet<Key>,
        restrictions: Option<HashMap<Key, HashSet<String>>>,
        loose_restrictions: Option<HashSet<Key>>,
    ) -> Result<(), SchedulerError> {
        let restrictions = match restrictions {
            Some(restrictions) => Some(canonicalise_restrictions(restrictions).await),
            None => None,
        };
        self.state
            .lock()
            .await
            .update_graph(dsk, keys, restrictions, loose_restrictions)
    }

    /// Record externally provided data.
    pub async fn update_data(
        &self,
        who_has: HashMap<Key, HashSet<WorkerAddr>>,
        nbytes: HashMap<Key, u64>,
    ) {
        self.state.lock().await.update_data(who_has, nbytes);
    }

    /// Unpin keys a client no longer needs kept in memory.
    pub async fn release_held_data(&self, keys: &HashSet<Key>) {
        self.state.lock().await.release_held_data(keys);
    }

    /// Collect the values of `keys` from the workers holding them.
    pub async fn gather(&self, keys: &[Key]) -> Result<HashMap<Key, Value>, SchedulerError> {
        let who_has: Vec<(Key, Vec<WorkerAddr>)> = {
            let state = self.state.lock().await;
            keys.iter()
                .map(|key| {
                    let mut holders: Vec<WorkerAddr> = state
                        .who_has
                        .get(key)
                        .into_iter()
                        .flatten()
                        .cloned()
                        .collect();
                    holders.sort();
                    (key.clone(), holders)
                })
                .collect()
        };

        let mut data = HashMap::new();
        let mut unavailable = Vec::new();
        for (key, holders) in who_has {
            let mut found = false;
            for addr in holders {
                let Ok(worker) = self.pool.worker(&addr).await else {
                    continue;
                };
                match worker.get_data(std::slice::from_ref(&key)).await {
                    Ok(mut values) => {
                        if let Some(value) = values.remove(&key) {
                            data.insert(key.clone(), value);
                            found = true;
                            break;
                        }
                    }
                    Err(err) => debug!(%key, worker = %addr, %err, "gather fetch failed"),
                }
            }
            if !found {
                unavailable.push(key);
            }
        }
        if unavailable.is_empty() {
            Ok(data)
        } else {
            unavailable.sort();
            Err(SchedulerError::KeysUnavailable { keys: unavailable })
        }
    }

    /// Distribute externally provided values across workers and register
    /// them as pinned data.
    pub async fn scatter(
        &self,
        data: HashMap<Key, Value>,
        workers: Option<Vec<WorkerAddr>>,
    ) -> Result<HashMap<Key, HashSet<WorkerAddr>>, SchedulerError> {
        let targets: Vec<WorkerAddr> = match workers {
            Some(listed) if !listed.is_empty() => listed,
            _ => {
                let state = self.state.lock().await;
                let mut all: Vec<WorkerAddr> = state.ncores.keys().cloned().collect();
                all.sort();
                all
            }
        };
        if targets.is_empty() {
            return Err(SchedulerError::NoWorkers);
        }

        let mut entries: Vec<(Key, Value)> = data.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let mut per_worker: HashMap<WorkerAddr, HashMap<Key, Value>> = HashMap::new();
        for (i, (key, value)) in entries.into_iter().enumerate() {
            per_worker
                .entry(targets[i % targets.len()].clone())
                .or_default()
                .insert(key, value);
        }

        let mut who_has: HashMap<Key, HashSet<WorkerAddr>> = HashMap::new();
        let mut nbytes = HashMap::new();
        for (addr, chunk) in per_worker {
            let worker = self.pool.worker(&addr).await?;
            let keys: Vec<Key> = chunk.keys().cloned().collect();
            let sizes = worker.update_data(chunk).await?;
            for key in keys {
                who_has.entry(key).or_default().insert(addr.clone());
            }
            nbytes.extend(sizes);
        }
        self.state
            .lock()
            .await
            .update_data(who_has.clone(), nbytes);
        Ok(who_has)
    }

    /// Fan a message out to every registered worker, returning the replies.
    pub async fn broadcast(
        &self,
        msg: Value,
    ) -> Result<HashMap<WorkerAddr, Value>, SchedulerError> {
        let targets: Vec<WorkerAddr> = {
            let state = self.state.lock().await;
            state.ncores.keys().cloned().collect()
        };
        let mut responses = HashMap::new();
        for addr in targets {
            let worker = self.pool.worker(&addr).await?;
            let reply = worker.send_recv(msg.clone()).await?;
            responses.insert(addr, reply);
        }
        Ok(responses)
    }

    /// Periodically push a projection of the scheduler state to `sink`
    /// until the receiver hangs up or the scheduler shuts down.
    pub fn feed(
        self: &Arc<Self>,
        function: FeedProjection,
        setup: Option<FeedSetup>,
        teardown: Option<FeedTeardown>,
        interval: Duration,
        sink: mpsc::Sender<Value>,
    ) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let carried: Option<Value> = match &setup {
                Some(setup) => Some(setup(&*scheduler.state.lock().await)),
                None => None,
            };
            loop {
                let payload = function(&*scheduler.state.lock().await, carried.as_ref());
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    sent = sink.send(payload) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            if let Some(teardown) = teardown {
                teardown(&*scheduler.state.lock().await, carried.as_ref());
            }
        });
    }

    /// Restart every worker through its nanny and reset local state. The
    /// only recovery from full-cluster loss: all computation is discarded.
    pub async fn restart(self: &Arc<Self>) {
        info!("restarting cluster");
        let nannies: HashMap<WorkerAddr, Option<u16>> =
            { self.state.lock().await.nannies.clone() };
        let workers: Vec<WorkerAddr> = nannies.keys().cloned().collect();
        for addr in &workers {
            self.remove_worker_inner(addr, false).await;
        }

        let timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let mut nanny_rpcs = Vec::new();
        for (worker, port) in &nannies {
            let Some(port) = port else { continue };
            let nanny_addr = WorkerAddr::new(worker.host.clone(), *port);
            match self.pool.nanny(&nanny_addr).await {
                Ok(rpc) => nanny_rpcs.push((nanny_addr, rpc)),
                Err(err) => warn!(nanny = %nanny_addr, %err, "could not reach nanny"),
            }
        }

        for (addr, nanny) in &nanny_rpcs {
            match tokio::time::timeout(timeout, nanny.kill()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(nanny = %addr, %err, "nanny kill failed"),
                Err(_) => warn!(nanny = %addr, "nanny kill timed out"),
            }
        }

        while !self.state.lock().await.ncores.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        for (addr, nanny) in &nanny_rpcs {
            match tokio::time::timeout(timeout, nanny.instantiate()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(nanny = %addr, %err, "nanny instantiate failed"),
                Err(_) => warn!(nanny = %addr, "nanny instantiate timed out"),
            }
        }

        if self.center.is_some() {
            self.sync_center().await;
        }
        self.start().await;

        let _ = self.reports.send(Report::Restart);
        {
            let state = self.state.lock().await;
            for plugin in state.plugin_snapshot() {
                if let Err(err) = plugin.restart(&state) {
                    error!(%err, "plugin restart hook failed");
                }
            }
        }
        ClusterRestarted {
            workers: workers.len(),
            nannies: nanny_rpcs.len(),
        }
        .log();
    }

    /// Filtered view of declared core counts.
    pub async fn get_ncores(
        &self,
        addresses: Option<Vec<WorkerAddr>>,
    ) -> HashMap<WorkerAddr, Option<usize>> {
        let state = self.state.lock().await;
        match addresses {
            Some(listed) => listed
                .into_iter()
                .map(|addr| {
                    let cores = state.ncores.get(&addr).copied();
                    (addr, cores)
                })
                .collect(),
            None => state
                .ncores
                .iter()
                .map(|(addr, cores)| (addr.clone(), Some(*cores)))
                .collect(),
        }
    }

    /// Filtered view of worker residency.
    pub async fn get_has_what(
        &self,
        addresses: Option<Vec<WorkerAddr>>,
    ) -> HashMap<WorkerAddr, HashSet<Key>> {
        let state = self.state.lock().await;
        match addresses {
            Some(listed) => listed
                .into_iter()
                .map(|addr| {
                    let keys = state.has_what.get(&addr).cloned().unwrap_or_default();
                    (addr, keys)
                })
                .collect(),
            None => state.has_what.clone(),
        }
    }

    /// Filtered view of key residency.
    pub async fn get_who_has(
        &self,
        keys: Option<Vec<Key>>,
    ) -> HashMap<Key, HashSet<WorkerAddr>> {
        let state = self.state.lock().await;
        match keys {
            Some(listed) => listed
                .into_iter()
                .map(|key| {
                    let holders = state.who_has.get(&key).cloned().unwrap_or_default();
                    (key, holders)
                })
                .collect(),
            None => state.who_has.clone(),
        }
    }

    /// Recent resource samples per nanny, newest last.
    pub async fn diagnostic_resources(
        &self,
        n: usize,
    ) -> HashMap<WorkerAddr, Vec<ResourceSample>> {
        self.resource_logs
            .lock()
            .await
            .iter()
            .map(|(addr, log)| {
                let skip = log.len().saturating_sub(n);
                (addr.clone(), log.iter().skip(skip).cloned().collect())
            })
            .collect()
    }

    /// Spawn a command multiplexer and hand back its inbox.
    pub fn command_channel(self: &Arc<Self>) -> mpsc::UnboundedSender<SchedulerCommand> {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.handle_commands(rx).await;
        });
        tx
    }

    /// Master loop: consume inbound operations one at a time and apply
    /// them. Runs once per attached command stream.
    pub async fn handle_commands(self: &Arc<Self>, mut rx: UnboundedReceiver<SchedulerCommand>) {
        let _ = self.reports.send(Report::StreamStart);
        while let Some(command) = rx.recv().await {
            debug!(?command, "scheduler receives message");
            match command {
                SchedulerCommand::Register {
                    addr,
                    keys,
                    ncores,
                    nanny_port,
                } => self.add_worker(addr, keys, ncores, nanny_port).await,
                SchedulerCommand::Unregister { addr } => self.remove_worker(&addr).await,
                SchedulerCommand::UpdateGraph {
                    dsk,
                    keys,
                    restrictions,
                    loose_restrictions,
                } => {
                    if let Err(err) = self
                        .update_graph(dsk, keys, restrictions, loose_restrictions)
                        .await
                    {
                        error!(%err, "update-graph failed");
                    }
                }
                SchedulerCommand::UpdateData { who_has, nbytes } => {
                    self.update_data(who_has, nbytes).await;
                }
                SchedulerCommand::MissingData {
                    missing,
                    key,
                    worker,
                } => {
                    let mut state = self.state.lock().await;
                    if let Err(err) =
                        state.mark_missing_data(missing, key.as_ref(), worker.as_ref())
                    {
                        error!(%err, "missing-data recovery failed");
                    }
                }
                SchedulerCommand::ReleaseHeldData { keys } => {
                    self.release_held_data(&keys).await;
                }
                SchedulerCommand::Restart => self.restart().await,
                SchedulerCommand::Gather { keys, resp } => {
                    let _ = resp.send(self.gather(&keys).await);
                }
                SchedulerCommand::Scatter {
                    data,
                    workers,
                    resp,
                } => {
                    let _ = resp.send(self.scatter(data, workers).await);
                }
                SchedulerCommand::Broadcast { msg, resp } => {
                    let _ = resp.send(self.broadcast(msg).await);
                }
                SchedulerCommand::Ncores { addresses, resp } => {
                    let _ = resp.send(self.get_ncores(addresses).await);
                }
                SchedulerCommand::HasWhat { addresses, resp } => {
                    let _ = resp.send(self.get_has_what(addresses).await);
                }
                SchedulerCommand::WhoHas { keys, resp } => {
                    let _ = resp.send(self.get_who_has(keys).await);
                }
                SchedulerCommand::Feed {
                    function,
                    setup,
                    teardown,
                    interval,
                    sink,
                } => self.feed(function, setup, teardown, interval, sink),
                SchedulerCommand::Terminate => {
                    self.close().await;
                    break;
                }
            }
        }
        let _ = self.reports.send(Report::StreamClosed);
        debug!("finished scheduling loop");
    }

    /// Graceful shutdown: flush pending deletes, close every dispatcher
    /// core, wait for them, and tell the center. Safe to call from several
    /// paths at once; only the first does the work.
    pub async fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing scheduler");
        self.shutdown.cancel();
        self.clear_data_from_workers().await;
        {
            let state = self.state.lock().await;
            for (addr, queue) in &state.worker_queues {
                let cores = state.ncores.get(addr).copied().unwrap_or(1);
                for _ in 0..cores {
                    let _ = queue.send(WorkerCommand::Close { report: true });
                }
            }
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.worker_tasks.lock().await;
            tasks.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(center) = &self.center {
            let _ = center.close().await;
        }
        let _ = self.reports.send(Report::Close);
    }

    async fn spawn_worker(
        self: &Arc<Self>,
        addr: WorkerAddr,
        rx: UnboundedReceiver<WorkerCommand>,
        cores: usize,
    ) {
        let queue = Arc::new(Mutex::new(rx));
        let scheduler = self.clone();
        let task_addr = addr.clone();
        let handle = tokio::spawn(async move {
            let mut set = JoinSet::new();
            for core in 0..cores.max(1) {
                set.spawn(scheduler.clone().worker_core(
                    task_addr.clone(),
                    core,
                    queue.clone(),
                ));
            }
            let mut failure: Option<io::Error> = None;
            let mut report_finish = false;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(report)) => report_finish |= report,
                    Ok(Err(err)) => {
                        if failure.is_none() {
                            failure = Some(err);
                        }
                        set.abort_all();
                    }
                    Err(join_err) if join_err.is_cancelled() => {}
                    Err(join_err) => {
                        if failure.is_none() {
                            failure = Some(io::Error::other(join_err.to_string()));
                        }
                    }
                }
            }
            if let Some(err) = failure {
                WorkerStreamFailed {
                    worker: &task_addr.to_string(),
                    error: &err.to_string(),
                }
                .log();
                scheduler.remove_worker(&task_addr).await;
            } else {
                if let Ok(worker) = scheduler.pool.worker(&task_addr).await {
                    // best effort farewell to a worker that closed cleanly
                    let _ = worker.close().await;
                }
                // a non-reporting close (worker removal) suppresses the event
                if report_finish {
                    let _ = scheduler.reports.send(Report::WorkerFinished {
                        worker: task_addr.clone(),
                    });
                }
            }
            scheduler.worker_tasks.lock().await.remove(&task_addr);
        });
        self.worker_tasks.lock().await.insert(addr, handle);
    }

    /// One dispatcher core: pull instructions off the shared worker queue,
    /// drive the worker RPC, and feed the outcome back into the state
    /// machine. I/O errors bubble up and take the whole worker down.
    ///
    /// Returns whether the close that stopped this core asked for a
    /// `worker-finished` report; a dropped queue counts as non-reporting.
    async fn worker_core(
        self: Arc<Self>,
        addr: WorkerAddr,
        core: usize,
        queue: Arc<Mutex<UnboundedReceiver<WorkerCommand>>>,
    ) -> io::Result<bool> {
        debug!(worker = %addr, core, "start dispatcher core");
        let mut report_finish = false;
        loop {
            let msg = { queue.lock().await.recv().await };
            let Some(msg) = msg else { break };
            match msg {
                WorkerCommand::Close { report } => {
                    report_finish = report;
                    break;
                }
                WorkerCommand::ComputeTask { key, task, who_has } => {
                    let worker = self.pool.worker(&addr).await?;
                    let response = if task.is_application() {
                        worker.compute(&key, &task, &who_has).await?
                    } else {
                        // raw data travels through update_data instead
                        let data = HashMap::from([(key.clone(), task.literal_value())]);
                        let sizes = worker.update_data(data).await?;
                        ComputeResponse::Finished {
                            nbytes: sizes.get(&key).copied().unwrap_or(0),
                        }
                    };
                    debug!(worker = %addr, %key, ?response, "compute response");
                    let mut state = self.state.lock().await;
                    match response {
                        ComputeResponse::Finished { nbytes } => {
                            state.mark_task_finished(&key, &addr, nbytes);
                        }
                        ComputeResponse::Error {
                            exception,
                            traceback,
                        } => {
                            state.mark_task_erred(&key, &addr, exception, traceback);
                        }
                        ComputeResponse::MissingData { missing } => {
                            if let Err(err) =
                                state.mark_missing_data(missing, Some(&key), Some(&addr))
                            {
                                warn!(%key, %err, "missing-data recovery incomplete");
                            }
                        }
                    }
                }
            }
        }
        DispatcherClosed {
            worker: &addr.to_string(),
            core,
        }
        .log();
        Ok(report_finish)
    }

    fn start_periodic_tasks(self: &Arc<Self>) {
        if self.periodic_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_millis(scheduler.config.delete_interval_ms);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    _ = ticker.tick() => scheduler.clear_data_from_workers().await,
                }
            }
        });
    }

    /// Drain the pending-deletion map and issue bulk deletes, swallowing
    /// transport errors: collection is best effort.
    async fn clear_data_from_workers(&self) {
        let drained = { std::mem::take(&mut self.state.lock().await.deleted_keys) };
        for (addr, keys) in drained {
            debug!(worker = %addr, count = keys.len(), "remove keys from worker");
            let keys: Vec<Key> = keys.into_iter().collect();
            match self.pool.worker(&addr).await {
                Ok(worker) => {
                    if let Err(err) = worker.delete_data(&keys).await {
                        debug!(worker = %addr, %err, "delete broadcast failed");
                    }
                }
                Err(err) => debug!(worker = %addr, %err, "delete broadcast unreachable"),
            }
        }
    }

    async fn spawn_nanny_listener(self: Arc<Self>, nanny_addr: WorkerAddr) {
        let interval = Duration::from_millis(self.config.resource_interval_ms);
        let nanny = match self.pool.nanny(&nanny_addr).await {
            Ok(nanny) => nanny,
            Err(err) => {
                warn!(nanny = %nanny_addr, %err, "could not dial nanny");
                return;
            }
        };
        let mut samples = match nanny.monitor_resources(interval).await {
            Ok(samples) => samples,
            Err(err) => {
                warn!(nanny = %nanny_addr, %err, "could not monitor nanny resources");
                return;
            }
        };
        let scheduler = self.clone();
        tokio::spawn(async move {
            while let Some(sample) = samples.recv().await {
                let mut logs = scheduler.resource_logs.lock().await;
                let log = logs.entry(nanny_addr.clone()).or_default();
                if log.len() >= scheduler.config.resource_log_size {
                    log.pop_front();
                }
                log.push_back(sample);
            }
        });
    }
}

/// Canonicalise every restriction host to an IP where possible.
async fn canonicalise_restrictions(
    restrictions: HashMap<Key, HashSet<String>>,
) -> HashMap<Key, HashSet<String>> {
    let mut canonical = HashMap::with_capacity(restrictions.len());
    for (key, hosts) in restrictions {
        let mut resolved = HashSet::with_capacity(hosts.len());
        for host in hosts {
            resolved.insert(ensure_ip(host).await);
        }
        canonical.insert(key, resolved);
    }
    canonical
}

/// Resolve a restriction host to an IP; unresolvable names are kept
/// verbatim.
async fn ensure_ip(host: String) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    let result: std::io::Result<Vec<std::net::SocketAddr>> =
        tokio::net::lookup_host((host.as_str(), 0u16))
            .await
            .map(|iter| iter.collect());
    match result {
        Ok(addrs) => addrs
            .into_iter()
            .next()
            .map(|sockaddr| sockaddr.ip().to_string())
            .unwrap_or(host),
        Err(err) => {
            warn!(%host, %err, "could not resolve restriction host");
            host
        }
    }
}
