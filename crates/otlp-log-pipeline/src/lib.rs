// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # OTLP Log Pipeline
//!
//! Receives OpenTelemetry log batches over gRPC and HTTP, runs every record through
//! sampling, allowlist filtering, field transformation and index routing, and persists
//! the processed records as newline-delimited JSON.
//!
//! - [`receiver`]: gRPC and HTTP front-ends, optionally sharing one socket
//! - [`pipeline`]: per-record coordination and counters
//! - [`sampling`], [`allowlist`], [`transform`], [`routing`]: the pipeline stages
//! - [`output`]: buffered, rotating NDJSON writer
//! - [`services`]: startup and ordered shutdown of all of the above

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod allowlist;
pub mod allowlist_watcher;
pub mod config;
pub mod error;
pub mod http_utils;
pub mod output;
pub mod pipeline;
pub mod receiver;
pub mod record;
pub mod routing;
pub mod sampling;
pub mod services;
pub mod transform;

pub use config::Config;
pub use error::ServicesError;
pub use services::{ReceiverServices, ServicesHandle};
