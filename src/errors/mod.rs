// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

mod config;
mod scheduler;

pub use config::ConfigError;
pub use scheduler::SchedulerError;
