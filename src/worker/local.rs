//! In-process worker backend.
//!
//! `LocalCluster` keeps a set of `LocalWorker`s addressable by
//! `WorkerAddr` and implements [`Connector`] so a scheduler can drive them
//! exactly as it would drive remote processes. Workers hold their data in
//! plain maps and evaluate tasks with a small builtin function table. This
//! backend exists for the demo binary and the tests; the scheduling core
//! itself never evaluates a task.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::graph::{Key, Task, TaskArg, WorkerAddr, IDENTITY};
use crate::messages::{ComputeResponse, ResourceSample};
use crate::worker::{Connector, NannyRpc, WorkerRpc};

/// Signature of a builtin task function.
pub type BuiltinFn = fn(&[Value]) -> Result<Value, String>;

/// The default function table: `identity` plus a handful of small
/// numeric/string helpers, and `fail` which always errors.
pub fn builtin_functions() -> HashMap<String, BuiltinFn> {
    fn identity(args: &[Value]) -> Result<Value, String> {
        args.first()
            .cloned()
            .ok_or_else(|| "identity takes one argument".to_string())
    }

    fn numbers(args: &[Value]) -> Result<Vec<f64>, String> {
        args.iter()
            .map(|v| v.as_f64().ok_or_else(|| format!("not a number: {v}")))
            .collect()
    }

    fn inc(args: &[Value]) -> Result<Value, String> {
        let nums = numbers(args)?;
        match nums.as_slice() {
            [x] => Ok(json!(x + 1.0)),
            _ => Err("inc takes one numeric argument".to_string()),
        }
    }

    fn add(args: &[Value]) -> Result<Value, String> {
        Ok(json!(numbers(args)?.iter().sum::<f64>()))
    }

    fn concat(args: &[Value]) -> Result<Value, String> {
        let mut out = String::new();
        for arg in args {
            match arg {
                Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        Ok(Value::String(out))
    }

    fn fail(_args: &[Value]) -> Result<Value, String> {
        Err("intentional failure".to_string())
    }

    let mut table: HashMap<String, BuiltinFn> = HashMap::new();
    table.insert(IDENTITY.to_string(), identity);
    table.insert("inc".to_string(), inc);
    table.insert("add".to_string(), add);
    table.insert("sum".to_string(), add);
    table.insert("concat".to_string(), concat);
    table.insert("fail".to_string(), fail);
    table
}

/// Evaluate a (possibly nested) task against an environment of resolved
/// dependency values.
pub fn execute_task(
    task: &Task,
    env: &HashMap<Key, Value>,
    functions: &HashMap<String, BuiltinFn>,
) -> Result<Value, String> {
    match task {
        Task::Literal(v) => Ok(v.clone()),
        Task::Alias(key) => env
            .get(key)
            .cloned()
            .ok_or_else(|| format!("unresolved key '{key}'")),
        Task::Apply { function, args } => {
            let mut resolved = Vec::with_capacity(args.len());
            for arg in args {
                let value = match arg {
                    TaskArg::KeyRef(key) => env
                        .get(key)
                        .cloned()
                        .ok_or_else(|| format!("unresolved key '{key}'"))?,
                    TaskArg::Literal(v) => v.clone(),
                    TaskArg::Nested(inner) => execute_task(inner, env, functions)?,
                };
                resolved.push(value);
            }
            let f = functions
                .get(function)
                .ok_or_else(|| format!("unknown function '{function}'"))?;
            f(&resolved)
        }
    }
}

fn value_nbytes(value: &Value) -> u64 {
    serde_json::to_vec(value).map(|b| b.len() as u64).unwrap_or(0)
}

/// A set of in-process workers reachable by address.
pub struct LocalCluster {
    workers: Mutex<HashMap<WorkerAddr, Arc<LocalWorker>>>,
    functions: Arc<HashMap<String, BuiltinFn>>,
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: Mutex::new(HashMap::new()),
            functions: Arc::new(builtin_functions()),
        })
    }

    /// Create (or return) the worker listening on `addr`.
    pub fn add_worker(self: &Arc<Self>, addr: WorkerAddr) -> Arc<LocalWorker> {
        let mut workers = self.workers.lock().expect("cluster lock");
        workers
            .entry(addr.clone())
            .or_insert_with(|| {
                Arc::new(LocalWorker {
                    addr,
                    cluster: Arc::downgrade(self),
                    data: Mutex::new(HashMap::new()),
                    functions: self.functions.clone(),
                })
            })
            .clone()
    }

    pub fn lookup(&self, addr: &WorkerAddr) -> Option<Arc<LocalWorker>> {
        self.workers.lock().expect("cluster lock").get(addr).cloned()
    }

    /// Tear a worker down, losing whatever data it held.
    pub fn kill_worker(&self, addr: &WorkerAddr) {
        self.workers.lock().expect("cluster lock").remove(addr);
    }
}

#[async_trait]
impl Connector for LocalCluster {
    async fn worker(&self, addr: &WorkerAddr) -> io::Result<Arc<dyn WorkerRpc>> {
        self.lookup(addr)
            .map(|w| w as Arc<dyn WorkerRpc>)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, format!("no worker at {addr}"))
            })
    }

    async fn nanny(&self, addr: &WorkerAddr) -> io::Result<Arc<dyn NannyRpc>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("local cluster runs no nanny at {addr}"),
        ))
    }
}

/// One in-process worker: a data map plus the shared function table.
pub struct LocalWorker {
    addr: WorkerAddr,
    cluster: Weak<LocalCluster>,
    data: Mutex<HashMap<Key, Value>>,
    functions: Arc<HashMap<String, BuiltinFn>>,
}

impl LocalWorker {
    pub fn addr(&self) -> &WorkerAddr {
        &self.addr
    }

    pub fn has_key(&self, key: &Key) -> bool {
        self.data.lock().expect("worker lock").contains_key(key)
    }

    /// Drop a value behind the scheduler's back. Test hook for exercising
    /// missing-data recovery.
    pub fn drop_key(&self, key: &Key) {
        self.data.lock().expect("worker lock").remove(key);
    }

    /// Resolve the dependency environment for a task, pulling values from
    /// local memory first and then from the peers listed in `who_has`.
    async fn resolve_deps(
        &self,
        task: &Task,
        who_has: &HashMap<Key, HashSet<WorkerAddr>>,
    ) -> Result<HashMap<Key, Value>, HashSet<Key>> {
        let mut env = HashMap::new();
        let mut missing = HashSet::new();
        for key in task.refs() {
            if env.contains_key(key) {
                continue;
            }
            if let Some(value) = self.data.lock().expect("worker lock").get(key).cloned() {
                env.insert(key.clone(), value);
                continue;
            }
            let mut found = None;
            if let Some(holders) = who_has.get(key) {
                let cluster = self.cluster.upgrade();
                for holder in holders {
                    if *holder == self.addr {
                        continue;
                    }
                    let Some(peer) = cluster.as_ref().and_then(|c| c.lookup(holder)) else {
                        continue;
                    };
                    if let Ok(mut data) = peer.get_data(std::slice::from_ref(key)).await {
                        if let Some(value) = data.remove(key) {
                            found = Some(value);
                            break;
                        }
                    }
                }
            }
            match found {
                Some(value) => {
                    // keep a replica locally, as a real worker would
                    self.data
                        .lock()
                        .expect("worker lock")
                        .insert(key.clone(), value.clone());
                    env.insert(key.clone(), value);
                }
                None => {
                    missing.insert(key.clone());
                }
            }
        }
        if missing.is_empty() {
            Ok(env)
        } else {
            Err(missing)
        }
    }
}

#[async_trait]
impl WorkerRpc for LocalWorker {
    async fn compute(
        &self,
        key: &Key,
        task: &Task,
        who_has: &HashMap<Key, HashSet<WorkerAddr>>,
    ) -> io::Result<ComputeResponse> {
        let env = match self.resolve_deps(task, who_has).await {
            Ok(env) => env,
            Err(missing) => return Ok(ComputeResponse::MissingData { missing }),
        };
        match execute_task(task, &env, &self.functions) {
            Ok(value) => {
                let nbytes = value_nbytes(&value);
                self.data
                    .lock()
                    .expect("worker lock")
                    .insert(key.clone(), value);
                Ok(ComputeResponse::Finished { nbytes })
            }
            Err(exception) => Ok(ComputeResponse::Error {
                traceback: format!("while computing '{key}': {exception}"),
                exception,
            }),
        }
    }

    async fn update_data(&self, data: HashMap<Key, Value>) -> io::Result<HashMap<Key, u64>> {
        let mut store = self.data.lock().expect("worker lock");
        let mut nbytes = HashMap::with_capacity(data.len());
        for (key, value) in data {
            nbytes.insert(key.clone(), value_nbytes(&value));
            store.insert(key, value);
        }
        Ok(nbytes)
    }

    async fn get_data(&self, keys: &[Key]) -> io::Result<HashMap<Key, Value>> {
        let store = self.data.lock().expect("worker lock");
        Ok(keys
            .iter()
            .filter_map(|k| store.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn delete_data(&self, keys: &[Key]) -> io::Result<()> {
        let mut store = self.data.lock().expect("worker lock");
        for key in keys {
            store.remove(key);
        }
        Ok(())
    }

    async fn send_recv(&self, msg: Value) -> io::Result<Value> {
        match msg.get("op").and_then(Value::as_str) {
            Some("ping") => Ok(json!({ "op": "pong", "worker": self.addr.to_string() })),
            Some("nkeys") => Ok(json!(self.data.lock().expect("worker lock").len())),
            _ => Ok(Value::Null),
        }
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A nanny double that only produces resource samples; `kill` and
/// `instantiate` act on the owning cluster.
pub struct LocalNanny {
    cluster: Weak<LocalCluster>,
    worker_addr: WorkerAddr,
}

impl LocalNanny {
    pub fn new(cluster: &Arc<LocalCluster>, worker_addr: WorkerAddr) -> Self {
        Self {
            cluster: Arc::downgrade(cluster),
            worker_addr,
        }
    }
}

#[async_trait]
impl NannyRpc for LocalNanny {
    async fn kill(&self) -> io::Result<()> {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.kill_worker(&self.worker_addr);
        }
        Ok(())
    }

    async fn instantiate(&self) -> io::Result<()> {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.add_worker(self.worker_addr.clone());
        }
        Ok(())
    }

    async fn monitor_resources(
        &self,
        interval: Duration,
    ) -> io::Result<mpsc::Receiver<ResourceSample>> {
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let sample = ResourceSample {
                    cpu_percent: 0.0,
                    memory_percent: 0.0,
                    timestamp_ms: std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_task_evaluates_nested_applications() {
        let functions = builtin_functions();
        let mut env = HashMap::new();
        env.insert("x".to_string(), json!(10));

        let task = Task::apply(
            "add",
            vec![
                TaskArg::KeyRef("x".to_string()),
                TaskArg::Nested(Box::new(Task::apply(
                    "inc",
                    vec![TaskArg::Literal(json!(1))],
                ))),
            ],
        );

        assert_eq!(execute_task(&task, &env, &functions).unwrap(), json!(12.0));
    }

    #[test]
    fn test_execute_task_identity_is_a_primitive() {
        let functions = builtin_functions();
        let mut env = HashMap::new();
        env.insert("x".to_string(), json!("payload"));
        let task = Task::identity_of("x");
        assert_eq!(
            execute_task(&task, &env, &functions).unwrap(),
            json!("payload")
        );
    }

    #[test]
    fn test_execute_task_unknown_function_errors() {
        let functions = builtin_functions();
        let env = HashMap::new();
        let task = Task::apply("no_such_fn", vec![]);
        let err = execute_task(&task, &env, &functions).unwrap_err();
        assert!(err.contains("no_such_fn"));
    }

    #[tokio::test]
    async fn test_compute_fetches_dependencies_from_peers() {
        let cluster = LocalCluster::new();
        let a = cluster.add_worker(WorkerAddr::new("a", 1));
        let b = cluster.add_worker(WorkerAddr::new("b", 1));

        a.update_data(HashMap::from([("x".to_string(), json!(41))]))
            .await
            .unwrap();

        let who_has = HashMap::from([(
            "x".to_string(),
            HashSet::from([WorkerAddr::new("a", 1)]),
        )]);
        let task = Task::apply("inc", vec![TaskArg::KeyRef("x".to_string())]);
        let resp = b.compute(&"y".to_string(), &task, &who_has).await.unwrap();

        assert!(matches!(resp, ComputeResponse::Finished { .. }));
        assert!(b.has_key(&"y".to_string()));
        // the fetched dependency was replicated locally
        assert!(b.has_key(&"x".to_string()));
    }

    #[tokio::test]
    async fn test_compute_reports_missing_dependencies() {
        let cluster = LocalCluster::new();
        let b = cluster.add_worker(WorkerAddr::new("b", 1));

        let who_has = HashMap::from([(
            "x".to_string(),
            HashSet::from([WorkerAddr::new("gone", 1)]),
        )]);
        let task = Task::apply("inc", vec![TaskArg::KeyRef("x".to_string())]);
        let resp = b.compute(&"y".to_string(), &task, &who_has).await.unwrap();

        match resp {
            ComputeResponse::MissingData { missing } => {
                assert_eq!(missing, HashSet::from(["x".to_string()]));
            }
            other => panic!("expected missing-data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compute_surfaces_task_errors() {
        let cluster = LocalCluster::new();
        let a = cluster.add_worker(WorkerAddr::new("a", 1));
        let task = Task::apply("fail", vec![]);
        let resp = a.compute(&"k".to_string(), &task, &HashMap::new()).await.unwrap();
        match resp {
            ComputeResponse::Error { exception, traceback } => {
                assert_eq!(exception, "intentional failure");
                assert!(traceback.contains("'k'"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
