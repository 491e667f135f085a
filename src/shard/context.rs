//! Shard context tracking
//!
//! Each proxy owns a [`ContextSlot`]; the slot resolves to a separate
//! [`ShardContext`] on every thread, so one thread can pin shard A while
//! another works against shard B. Overrides are applied through
//! [`ShardScope`] guards that restore the previous context on drop, including
//! during unwinding.

use std::cell::RefCell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    static CONTEXTS: RefCell<HashMap<u64, ShardContext>> = RefCell::new(HashMap::new());
}

static NEXT_SLOT: AtomicU64 = AtomicU64::new(1);

/// Routing selection for the current thread
///
/// The initial state selects nothing, which resolves to the master shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardContext {
    current_shard: Vec<String>,
    current_group: Vec<String>,
    group_explicitly_set: bool,
    block: bool,
}

impl ShardContext {
    /// Select one or more shards
    ///
    /// The group-explicit flag is cleared only when no group is selected.
    pub fn set_shard(&mut self, names: Vec<String>) {
        self.current_shard = names;
        if self.current_group.is_empty() {
            self.group_explicitly_set = false;
        }
    }

    /// Select one or more groups
    pub fn set_group(&mut self, names: Vec<String>) {
        self.current_group = names;
        self.group_explicitly_set = true;
    }

    /// Selected shards; empty when none
    pub fn current_shard(&self) -> &[String] {
        &self.current_shard
    }

    /// Active shard of the selection (the head of the list)
    pub fn head(&self) -> Option<&str> {
        self.current_shard.first().map(String::as_str)
    }

    /// Selected groups; empty when none
    pub fn current_group(&self) -> &[String] {
        &self.current_group
    }

    /// Whether a group selection was made, even an empty one
    pub fn group_explicitly_set(&self) -> bool {
        self.group_explicitly_set
    }

    /// Whether the thread is inside a block-form override
    pub fn in_block(&self) -> bool {
        self.block
    }

    /// Whether any explicit selection is active
    pub fn is_overridden(&self) -> bool {
        !self.current_shard.is_empty() || self.group_explicitly_set || self.block
    }
}

/// Handle to one proxy's per-thread contexts
///
/// A thread holds an entry only while its context differs from the initial
/// state. Dropping the slot clears the entry of the dropping thread only, so
/// long-lived worker threads call [`reset`](Self::reset) (or leave every
/// override through a scope) at the end of each unit of work.
#[derive(Debug)]
pub struct ContextSlot {
    id: u64,
}

impl ContextSlot {
    /// Allocate a fresh slot
    pub fn new() -> Self {
        Self {
            id: NEXT_SLOT.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Copy of the calling thread's context
    pub fn get(&self) -> ShardContext {
        CONTEXTS.with(|contexts| contexts.borrow().get(&self.id).cloned().unwrap_or_default())
    }

    /// Mutate the calling thread's context in place
    pub fn update<R>(&self, f: impl FnOnce(&mut ShardContext) -> R) -> R {
        CONTEXTS.with(|contexts| f(contexts.borrow_mut().entry(self.id).or_default()))
    }

    /// Apply `f` and return a guard that restores the prior context on drop
    pub fn scope(&self, f: impl FnOnce(&mut ShardContext)) -> ShardScope<'_> {
        let saved = self.update(|ctx| {
            let saved = ctx.clone();
            f(ctx);
            saved
        });
        ShardScope {
            slot: self,
            saved: Some(saved),
            _not_send: PhantomData,
        }
    }

    /// Run `body` with the context pinned to `names`
    pub fn with_shard<R>(&self, names: Vec<String>, body: impl FnOnce() -> R) -> R {
        let _scope = self.scope(|ctx| {
            ctx.set_shard(names);
            ctx.block = true;
        });
        body()
    }

    /// Return the calling thread's context to its initial state
    pub fn reset(&self) {
        self.restore(ShardContext::default());
    }

    #[cfg(test)]
    fn tracked_on_current_thread(&self) -> bool {
        CONTEXTS.with(|contexts| contexts.borrow().contains_key(&self.id))
    }

    fn restore(&self, context: ShardContext) {
        // Thread-local may already be gone during thread teardown.
        let _ = CONTEXTS.try_with(|contexts| {
            let mut contexts = contexts.borrow_mut();
            if context == ShardContext::default() {
                contexts.remove(&self.id);
            } else {
                contexts.insert(self.id, context);
            }
        });
    }
}

impl Default for ContextSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ContextSlot {
    fn drop(&mut self) {
        self.restore(ShardContext::default());
    }
}

/// Restores the saved context when dropped
///
/// Tied to the thread that created it.
#[must_use = "the override ends when the scope is dropped"]
pub struct ShardScope<'a> {
    slot: &'a ContextSlot,
    saved: Option<ShardContext>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ShardScope<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.slot.restore(saved);
        }
    }
}
