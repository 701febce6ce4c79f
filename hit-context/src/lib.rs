// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runtime side of coverage: counts probe hits and saves them to the hits store.

#[macro_use]
extern crate log;

pub mod ambient;
pub mod config;
pub mod context;
pub mod counters;
pub mod shutdown;

pub use ambient::{current, flush, hit, install, with_context};
pub use config::RecorderConfig;
pub use context::{HitContext, PeriodicFlush};
pub use counters::HitCounters;

use coverage::HitId;

/// Probe entry point called by instrumented code.
#[no_mangle]
pub extern "C" fn minicov_hit(id: u32) {
    hit(HitId(id));
}

/// Flush every installed context. Called by the host when the process exits.
#[no_mangle]
pub extern "C" fn minicov_shutdown() {
    shutdown::execute();
}
