// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Demo binary: spin up an in-process cluster, submit a small task graph,
//! and print the results.

use std::collections::{HashMap, HashSet};
use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use taskmesh::config::{load_config, SchedulerConfig};
use taskmesh::graph::{Key, Task, TaskArg, WorkerAddr};
use taskmesh::messages::Report;
use taskmesh::scheduler::Scheduler;
use taskmesh::worker::local::LocalCluster;
use taskmesh::worker::Connector;

fn demo_graph() -> (HashMap<Key, Task>, HashSet<Key>) {
    // total = (1 + 1) + (10 + 1) + 100
    let dsk = HashMap::from([
        ("one".to_string(), Task::Literal(json!(1))),
        ("ten".to_string(), Task::Literal(json!(10))),
        (
            "one_inc".to_string(),
            Task::apply("inc", vec![TaskArg::KeyRef("one".to_string())]),
        ),
        (
            "ten_inc".to_string(),
            Task::apply("inc", vec![TaskArg::KeyRef("ten".to_string())]),
        ),
        (
            "total".to_string(),
            Task::apply(
                "add",
                vec![
                    TaskArg::KeyRef("one_inc".to_string()),
                    TaskArg::KeyRef("ten_inc".to_string()),
                    TaskArg::Literal(json!(100)),
                ],
            ),
        ),
    ]);
    (dsk, HashSet::from(["total".to_string()]))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match env::args().nth(1) {
        Some(path) => load_config(Path::new(&path))
            .with_context(|| format!("loading config from {path}"))?,
        None => SchedulerConfig::default(),
    };

    let cluster = LocalCluster::new();
    let alice = WorkerAddr::new("alice", 8000);
    let bob = WorkerAddr::new("bob", 8000);
    cluster.add_worker(alice.clone());
    cluster.add_worker(bob.clone());
    let connector: Arc<dyn Connector> = cluster.clone();

    let scheduler = Scheduler::new(config, connector, None);
    let mut reports = scheduler.subscribe();
    scheduler.start().await;
    scheduler
        .add_worker(alice.clone(), HashSet::new(), 2, None)
        .await;
    scheduler
        .add_worker(bob.clone(), HashSet::new(), 2, None)
        .await;

    let (dsk, keys) = demo_graph();
    let outputs: Vec<Key> = keys.iter().cloned().collect();
    scheduler
        .update_graph(dsk, keys, None, None)
        .await
        .context("submitting demo graph")?;

    // wait for every requested output to land in distributed memory
    let mut pending: HashSet<Key> = outputs.iter().cloned().collect();
    while !pending.is_empty() {
        match reports.recv().await {
            Ok(Report::KeyInMemory { key, workers }) => {
                if pending.remove(&key) {
                    println!("{key} computed on {workers:?}");
                }
            }
            Ok(Report::TaskErred { key, exception, .. }) => {
                anyhow::bail!("task {key} failed: {exception}");
            }
            Ok(_) => {}
            Err(err) => anyhow::bail!("report stream ended early: {err}"),
        }
    }

    let data = scheduler.gather(&outputs).await?;
    for (key, value) in &data {
        println!("{key} = {value}");
    }

    scheduler.close().await;
    Ok(())
}
