// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod dependency_graph;
mod task;

pub use dependency_graph::{topological_ranks, DependencyGraph};
pub use task::{cover_aliases, task_dependencies, Key, Task, TaskArg, WorkerAddr, IDENTITY};
