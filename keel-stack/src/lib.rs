//! # keel-stack
//!
//! A lock-free multi-producer/multi-consumer LIFO stack whose nodes live
//! in a [`keel_pool::Pool`].
//!
//! The stack is bounded by the capacity of the pool it draws nodes from
//! and fails fast when that pool drains. The pool can be shared with
//! other containers ([`Stack::new`]) or owned by the stack itself
//! ([`Stack::with_capacity`]); either way nothing allocates after
//! construction.
//!
//! # Example
//!
//! ```
//! use keel_stack::Stack;
//!
//! let stack = Stack::<u64>::with_capacity(3);
//!
//! stack.push(42).unwrap();
//! stack.push(666).unwrap();
//!
//! assert_eq!(stack.pop(), Some(666));
//! assert_eq!(stack.pop(), Some(42));
//! assert_eq!(stack.pop(), None);
//! ```
//!
//! # ABA protection
//!
//! The top-of-stack word is a [`TaggedIndex`]: pops bump the generation
//! tag, pushes publish with whatever tag they observed. Only a pop
//! detaches the top node, so only a pop has to invalidate stale
//! observers; a push's compare-and-swap already fails whenever the top
//! word changed underneath it.
//!
//! # Requirements on `T`
//!
//! Move construction and `Drop` must be lock-free and must not block;
//! they run inside push and pop on the hot path.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

use std::fmt;
use std::mem::ManuallyDrop;
use std::sync::atomic;

use crossbeam_utils::CachePadded;
use keel_pool::sync::{AtomicU64, Ordering};
use keel_pool::{Pool, TaggedIndex};

/// A pool of stack nodes, shareable between several stacks (and sized
/// with [`keel_pool::PoolBudget`] when it is).
pub type StackPool<T> = Pool<StackNode<T>>;

// =============================================================================
// Errors
// =============================================================================

/// Returned when pushing onto a stack whose node pool is drained.
///
/// Contains the value that could not be pushed, returning ownership to the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(
    /// The value that could not be pushed.
    pub T,
);

impl<T> Full<T> {
    /// Returns the value that could not be pushed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack is full")
    }
}

impl<T: fmt::Debug> std::error::Error for Full<T> {}

// =============================================================================
// StackNode
// =============================================================================

/// One stack element as stored in the pool: the payload plus the link to
/// the node below it.
///
/// Opaque; it exists in the public API only so callers can construct a
/// [`StackPool`] of the right element type.
pub struct StackNode<T> {
    data: ManuallyDrop<T>,
    // Tagged index of the node below; NULL at the bottom. A plain (non
    // loom-shimmed) atomic: nodes live in recycled pool slots, and pops
    // read this field from slots that may already be mid-reuse.
    prev: atomic::AtomicU64,
}

impl<T> StackNode<T> {
    fn new(value: T) -> Self {
        Self {
            data: ManuallyDrop::new(value),
            prev: atomic::AtomicU64::new(TaggedIndex::NULL.into_raw()),
        }
    }

    fn into_value(self) -> T {
        ManuallyDrop::into_inner(self.data)
    }

    #[inline]
    fn prev(&self) -> TaggedIndex {
        TaggedIndex::from_raw(self.prev.load(atomic::Ordering::Relaxed))
    }

    #[inline]
    fn set_prev(&self, word: TaggedIndex) {
        self.prev.store(word.into_raw(), atomic::Ordering::Relaxed);
    }
}

impl<T> fmt::Debug for StackNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackNode")
            .field("prev", &self.prev())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Stack
// =============================================================================

enum NodePool<'p, T> {
    Shared(&'p StackPool<T>),
    Local(Box<StackPool<T>>),
}

/// A lock-free MPMC LIFO stack over pool-allocated nodes.
///
/// All operations are finite compare-and-swap loops: no blocking, no
/// waiting, no allocation. `push` fails fast with [`Full`] when the node
/// pool drains; `pop` returns `None` on an empty stack.
pub struct Stack<'p, T> {
    pool: NodePool<'p, T>,
    top: CachePadded<AtomicU64>,
}

impl<'p, T> Stack<'p, T> {
    /// Creates a stack drawing nodes from a shared pool.
    ///
    /// The stack's capacity is whatever the pool has to spare; size the
    /// pool for the combined needs of everything using it.
    pub fn new(pool: &'p StackPool<T>) -> Self {
        Self {
            pool: NodePool::Shared(pool),
            top: CachePadded::new(AtomicU64::new(TaggedIndex::NULL.into_raw())),
        }
    }
}

impl<T> Stack<'static, T> {
    /// Creates a stack with an internal pool of `capacity` nodes.
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            pool: NodePool::Local(Box::new(Pool::new(capacity))),
            top: CachePadded::new(AtomicU64::new(TaggedIndex::NULL.into_raw())),
        }
    }
}

impl<T> Stack<'_, T> {
    #[inline]
    fn pool(&self) -> &StackPool<T> {
        match &self.pool {
            NodePool::Shared(pool) => pool,
            NodePool::Local(pool) => pool,
        }
    }

    /// Pushes a value onto the stack.
    ///
    /// Returns [`Full`] handing the value back when the node pool is
    /// drained. Pushes always complete under contention; each retry
    /// re-reads the current top.
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        let node = match self.pool().acquire(StackNode::new(value)) {
            Ok(node) => node,
            Err(keel_pool::Full(node)) => return Err(Full(node.into_value())),
        };
        let index = self.pool().index_of(node);
        let node = unsafe { node.as_ref() };

        let mut observed = TaggedIndex::from_raw(self.top.load(Ordering::Relaxed));
        loop {
            node.set_prev(observed);

            // A push keeps the observed tag; see the crate docs.
            let new_top = TaggedIndex::new(index, observed.tag());
            match self.top.compare_exchange_weak(
                observed.into_raw(),
                new_top.into_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => observed = TaggedIndex::from_raw(current),
            }
        }
    }

    /// Pops the most recently pushed value.
    ///
    /// Returns `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let mut observed = TaggedIndex::from_raw(self.top.load(Ordering::Acquire));

        while !observed.is_null() {
            let node = unsafe { self.pool().get(observed.index()) };

            // Critical read: the observed top may already have been popped,
            // released, and re-acquired by a concurrent push, so `prev` may
            // be arbitrary bytes. The slot itself stays allocated, and the
            // tag bump below fails the CAS whenever the top moved.
            let prev = unsafe { node.as_ref() }.prev();

            let new_top = TaggedIndex::new(prev.index(), observed.tag().wrapping_add(1));
            match self.top.compare_exchange_weak(
                observed.into_raw(),
                new_top.into_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let value = unsafe { ManuallyDrop::take(&mut (*node.as_ptr()).data) };
                    unsafe { self.pool().release_raw(node) };
                    return Some(value);
                }
                Err(current) => observed = TaggedIndex::from_raw(current),
            }
        }

        None
    }

    /// Pushes without atomic synchronization.
    ///
    /// Algorithmically identical to [`push`](Self::push) with the CAS loop
    /// collapsed to a plain store. The exclusive borrow is what makes this
    /// sound: use it during setup and teardown phases, or under an outer
    /// lock.
    pub fn push_unsync(&mut self, value: T) -> Result<(), Full<T>> {
        let node = match self.pool().acquire(StackNode::new(value)) {
            Ok(node) => node,
            Err(keel_pool::Full(node)) => return Err(Full(node.into_value())),
        };
        let index = self.pool().index_of(node);

        let observed = TaggedIndex::from_raw(self.top.load(Ordering::Relaxed));
        unsafe { node.as_ref() }.set_prev(observed);
        self.top.store(
            TaggedIndex::new(index, observed.tag()).into_raw(),
            Ordering::Relaxed,
        );
        Ok(())
    }

    /// Pops without atomic synchronization.
    ///
    /// See [`push_unsync`](Self::push_unsync) for the usage contract.
    pub fn pop_unsync(&mut self) -> Option<T> {
        let observed = TaggedIndex::from_raw(self.top.load(Ordering::Relaxed));
        if observed.is_null() {
            return None;
        }

        let node = unsafe { self.pool().get(observed.index()) };
        let prev = unsafe { node.as_ref() }.prev();
        self.top.store(
            TaggedIndex::new(prev.index(), observed.tag().wrapping_add(1)).into_raw(),
            Ordering::Relaxed,
        );

        let value = unsafe { ManuallyDrop::take(&mut (*node.as_ptr()).data) };
        unsafe { self.pool().release_raw(node) };
        Some(value)
    }

    /// Returns `true` if the stack has no elements.
    ///
    /// A quiescent check: by the time a caller acts on the answer, a
    /// concurrent push or pop may have changed it.
    pub fn is_empty(&self) -> bool {
        TaggedIndex::from_raw(self.top.load(Ordering::Relaxed)).is_null()
    }
}

impl<T> Drop for Stack<'_, T> {
    fn drop(&mut self) {
        while self.pop_unsync().is_some() {}
    }
}

impl<T> fmt::Debug for Stack<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}


// =============================================================================
// Tests
// =============================================================================
