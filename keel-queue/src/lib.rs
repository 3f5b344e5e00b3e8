//! # keel-queue
//!
//! Lock-free FIFO queues whose nodes live in a [`keel_pool::Pool`].
//!
//! Two flavors with the same surface and different producer/consumer
//! contracts:
//!
//! - [`mpmc`]: multi-producer/multi-consumer. Producers are wait-free
//!   (one swap and one store); consumers loop on a single CAS.
//! - [`mpsc`]: multi-producer/single-consumer. Producers pay one swap;
//!   the consumer's fast path is atomic-free except for one acquire load.
//!
//! Both are bounded by the pool they draw nodes from and fail fast with
//! [`Full`] when it drains. Both keep one **sentinel** node checked out of
//! the pool for their whole lifetime: when sizing a shared pool, budget
//! one extra slot per queue instance ([`keel_pool::PoolBudget`] does this
//! arithmetic).
//!
//! # Example
//!
//! ```
//! use keel_queue::mpmc::Queue;
//!
//! let queue = Queue::<u64>::with_capacity(3);
//!
//! queue.push(42).unwrap();
//! queue.push(666).unwrap();
//!
//! assert_eq!(queue.pop(), Some(42));
//! assert_eq!(queue.pop(), Some(666));
//! assert_eq!(queue.pop(), None);
//! ```
//!
//! # The producer-stall window
//!
//! A producer that is preempted between claiming the back node and
//! publishing its link leaves the queue in a state where later pushes
//! keep succeeding but consumers cannot advance past the unpublished
//! node until that producer resumes. The window is two instructions
//! wide. This is a documented property of the algorithm, traded for
//! wait-free producers; callers that cannot tolerate it need a different
//! queue.
//!
//! # Requirements on `T`
//!
//! Move construction and `Drop` must be lock-free and must not block;
//! they run inside push and pop on the hot path.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

use std::fmt;

use keel_pool::Pool;

pub mod mpmc;
pub mod mpsc;

/// Returned when pushing into a queue whose node pool is drained.
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
        write!(f, "queue is full")
    }
}

impl<T: fmt::Debug> std::error::Error for Full<T> {}

/// A node pool that is either borrowed (shared with other containers) or
/// owned by the container itself.
enum PoolRef<'p, N> {
    Shared(&'p Pool<N>),
    Local(Box<Pool<N>>),
}

impl<N> PoolRef<'_, N> {
    #[inline]
    fn get(&self) -> &Pool<N> {
        match self {
            PoolRef::Shared(pool) => pool,
            PoolRef::Local(pool) => pool,
        }
    }
}
