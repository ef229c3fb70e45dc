// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod config;    // config + loader
pub mod errors;    // error handling
pub mod graph;     // task model + dependency graph
pub mod messages;  // typed scheduler/worker/report messages
pub mod observability;
pub mod scheduler; // scheduling state machine + server
pub mod worker;    // collaborator seams + in-process backend
