// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate log;

pub mod allocator;
pub mod config;
pub mod engine;
pub mod relink;
pub mod rewrite;
pub mod sequence;
pub mod stack;


pub use allocator::HitIdAllocator;
pub use config::{Config, ConfigOption};
pub use engine::{
    AssemblyOutcome, AssemblyTarget, BatchOutcome, DocumentSequence, InstrumentError, Instrumenter, MethodOutcome,
    SkipReason,
};
