// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delayed-mutation set: concurrent producers, one lock-free consumer.
//!
//! Structural changes (add/remove) are queued under a mutex and only
//! materialized into the backing [`SwapSet`] when the single consumer thread
//! calls [`StagedSet::apply_pending`]. The consumer iterates the backing set
//! without any synchronization.
//!
//! Protocol:
//! - Producers: any number of threads may call `queue_add()`/`queue_remove()`
//! - Consumer: exactly ONE thread may call `apply_pending()`/`for_each()`,
//!   and must not interleave `apply_pending()` with its own iteration pass
//!
//! The mutex guards exclusively the pending-change list and the logical
//! membership set, never the backing array.

use super::swapset::SwapSet;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::hash::Hash;

enum PendingOp<T> {
    Add(T),
    Remove(T),
}

struct PendingState<T> {
    /// Queued structural changes in arrival order.
    ops: Vec<PendingOp<T>>,
    /// Membership after all queued changes apply. Rejects duplicate
    /// adds/removes at enqueue time, before they are materialized.
    members: HashSet<T>,
}

/// Set whose mutations are staged by producers and applied by one consumer.
pub struct StagedSet<T> {
    /// Backing array + index. Touched only by the consumer thread.
    backing: UnsafeCell<SwapSet<T>>,
    pending: Mutex<PendingState<T>>,
}

// SAFETY: StagedSet is Send + Sync because:
// - `pending` is mutex-guarded and safe from any thread
// - `backing` is touched only by the single consumer thread (documented
//   protocol above); producers never reach it
// - queued T values cross from producer to consumer threads (T: Send), and
//   the consumer hands out &T during iteration (T: Sync)
unsafe impl<T: Send> Send for StagedSet<T> {}
unsafe impl<T: Send + Sync> Sync for StagedSet<T> {}

impl<T: Clone + Eq + Hash> StagedSet<T> {
    pub fn new() -> Self {
        Self {
            backing: UnsafeCell::new(SwapSet::new()),
            pending: Mutex::new(PendingState {
                ops: Vec::new(),
                members: HashSet::new(),
            }),
        }
    }

    /// Queue an add. Returns `false` if the element is already a logical
    /// member (present in the backing set or queued for add).
    pub fn queue_add(&self, item: T) -> bool {
        let mut pending = self.pending.lock();
        if !pending.members.insert(item.clone()) {
            return false;
        }
        pending.ops.push(PendingOp::Add(item));
        true
    }

    /// Queue a remove. Returns `false` if the element is not a logical
    /// member.
    pub fn queue_remove(&self, item: &T) -> bool {
        let mut pending = self.pending.lock();
        if !pending.members.remove(item) {
            return false;
        }
        pending.ops.push(PendingOp::Remove(item.clone()));
        true
    }

    /// Materialize all queued changes into the backing set.
    ///
    /// Consumer thread only. Must run strictly before or strictly after an
    /// iteration pass, never interleaved with it.
    pub fn apply_pending(&self) {
        let drained: Vec<PendingOp<T>> = {
            let mut pending = self.pending.lock();
            if pending.ops.is_empty() {
                return;
            }
            std::mem::take(&mut pending.ops)
        };
        // SAFETY: single-consumer protocol ensures no other thread reads or
        // writes the backing set while we mutate it.
        let backing = unsafe { &mut *self.backing.get() };
        for op in drained {
            match op {
                PendingOp::Add(item) => {
                    backing.insert(item);
                }
                PendingOp::Remove(item) => {
                    backing.remove(&item);
                }
            }
        }
    }

    /// Visit every element of the backing set. Consumer thread only.
    #[inline]
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        // SAFETY: single-consumer protocol; producers never touch the
        // backing set, and apply_pending() is never interleaved with this.
        let backing = unsafe { &*self.backing.get() };
        for item in backing.iter() {
            f(item);
        }
    }

    /// Number of materialized elements. Consumer thread only.
    #[must_use]
    pub fn len(&self) -> usize {
        // SAFETY: see for_each().
        unsafe { &*self.backing.get() }.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Eq + Hash> Default for StagedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
