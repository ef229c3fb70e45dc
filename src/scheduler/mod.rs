// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

pub mod heal;
pub mod placement;
pub mod plugin;
pub mod server;
pub mod state;

pub use heal::{heal, heal_missing_data, validate_state, HealResult};
pub use placement::{assign_many_tasks, decide_worker};
pub use plugin::SchedulerPlugin;
pub use server::Scheduler;
pub use state::SchedulerState;
