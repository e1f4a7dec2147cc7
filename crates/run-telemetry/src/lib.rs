// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Run Telemetry
//!
//! Store-and-forward delivery of telemetry produced by long-running jobs.
//!
//! - [`dispatcher`]: per-run background batcher producers write into.
//!   Online runs go straight to the server, offline runs (and online runs
//!   whose delivery failed) go to the cache.
//! - [`cache`]: crash-safe on-disk holding area, one directory per run.
//! - [`sender`]: lock-coordinated drain cycle that replays the cache.
//! - [`lock`]: machine-wide single-sender lock with liveness detection.
//! - [`transport`]: retrying HTTP delivery with failure classification.

#![deny(clippy::all)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod http;
pub mod lock;
pub mod logger;
pub mod record;
pub mod sender;
pub mod transport;

pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use record::{RunIdentity, RunMode, RunStatus, TelemetryRecord};
pub use sender::{DrainOutcome, Sender};
