// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(clippy::new_without_default)]

#[macro_use]
extern crate log;

pub mod allowlist;
pub mod hits;
pub mod map;
pub mod store;
pub mod summary;

pub use allowlist::AllowList;
pub use hits::HitsInfo;
pub use map::{
    Branch, Condition, HitId, InstrumentationResult, InstrumentedAssembly, MethodInfo, Sequence,
    SourceFile,
};
