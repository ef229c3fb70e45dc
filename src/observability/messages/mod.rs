// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Centralized message types for structured logging.
//!
//! Messages are organized by subsystem:
//! * `scheduler` - scheduler lifecycle and cluster membership events
//! * `worker` - dispatcher and worker stream events
//!
//! Each type implements `Display` (human-readable message) and
//! [`StructuredLog`] (structured fields plus span creation), so call sites
//! choose between `tracing::info!("{}", msg)` and `msg.log()`.

pub mod scheduler;
pub mod worker;

use tracing::Span;

/// Trait for messages that support structured logging and tracing.
pub trait StructuredLog {
    /// Emit a log event carrying both the rendered message and the
    /// machine-readable fields. The level is fixed per message type.
    fn log(&self);

    /// Create a span with this message's fields as attributes.
    fn span(&self, name: &str) -> Span;
}
