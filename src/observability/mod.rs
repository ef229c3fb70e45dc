// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Observability module for structured logging and tracing.
//!
//! Message types for the scheduler's operational events live here, one
//! struct per event, each implementing `Display` for human-readable output
//! and [`messages::StructuredLog`] for machine-readable fields.

pub mod messages;
