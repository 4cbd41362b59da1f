// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Low-allocation collection primitives for the reactor hot paths.
//!
//! All four collections avoid per-operation allocation once warmed up:
//!
//! - [`SwapSet`]: O(1) add/remove/enumerate, dense backing array
//! - [`StagedSet`]: concurrent producers queue changes, one consumer applies
//! - [`MultiMap`]: key -> value-set with automatic empty-set cleanup
//! - [`OrderedMap`]: hash map + intrusive insertion-order links

pub mod multimap;
pub mod ordmap;
pub mod staged;
pub mod swapset;

pub use multimap::MultiMap;
pub use ordmap::OrderedMap;
pub use staged::StagedSet;
pub use swapset::{Shared, SwapSet};
