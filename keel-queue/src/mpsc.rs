//! Multi-producer/single-consumer FIFO queue.
//!
//! The single-consumer restriction buys a cheaper protocol than the MPMC
//! queue's: nodes carry a plain (untagged) link, producers pay exactly
//! one swap, and the consumer's fast path performs no read-modify-write
//! at all — one relaxed read of its own front cursor and one acquire
//! load of the front node's link. With no CAS anywhere there is nothing
//! for ABA to subvert.
//!
//! The consumer side takes `&mut self`, which is what enforces the
//! single consumer; use [`Queue::split`] to hand producers a cloneable
//! handle while one thread keeps the consumer half.
//!
//! # Example
//!
//! ```
//! use keel_queue::mpsc::Queue;
//! use std::thread;
//!
//! let mut queue = Queue::<u64>::with_capacity(64);
//! let (producer, mut consumer) = queue.split();
//!
//! thread::scope(|s| {
//!     for base in [0u64, 100] {
//!         let producer = producer.clone();
//!         s.spawn(move || {
//!             for i in 0..10 {
//!                 while producer.push(base + i).is_err() {
//!                     std::hint::spin_loop();
//!                 }
//!             }
//!         });
//!     }
//!
//!     let mut received = 0;
//!     while received < 20 {
//!         if consumer.pop().is_some() {
//!             received += 1;
//!         }
//!     }
//! });
//! ```
//!
//! The producer-stall window described in the crate docs applies here
//! too: a producer preempted between its swap and its link store hides
//! the elements queued behind it until it resumes.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic;

use crossbeam_utils::CachePadded;
use keel_pool::sync::{AtomicU32, Ordering};
use keel_pool::{Pool, TaggedIndex};

use crate::{Full, PoolRef};

/// A pool of MPSC queue nodes, shareable between several queues (and
/// sized with [`keel_pool::PoolBudget`] when it is).
pub type QueuePool<T> = Pool<Node<T>>;

/// One queue element as stored in the pool.
///
/// Opaque; it exists in the public API only so callers can construct a
/// [`QueuePool`] of the right element type. Unlike the MPMC node the
/// payload is written *before* the node is linked in, so only the
/// sentinel's payload is ever uninitialized.
pub struct Node<T> {
    data: UnsafeCell<MaybeUninit<T>>,
    // Index of the next-newer node; NULL_INDEX until published. Untagged:
    // with a single consumer and no CAS there is no ABA to defend against.
    prev: atomic::AtomicU32,
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

/// A lock-free MPSC FIFO queue over pool-allocated nodes.
///
/// Producers push through `&self` (or a cloned [`Producer`]); the
/// consumer pops through `&mut self` (or the unique [`Consumer`]), which
/// is what makes the single-consumer contract a compile-time fact rather
/// than a runtime one.
pub struct Queue<'p, T> {
    pool: PoolRef<'p, Node<T>>,
    back: CachePadded<AtomicU32>,
    // The consumer's cursor. Relaxed plain loads and stores: only the
    // single consumer writes it, and nothing synchronizes through it.
    front: atomic::AtomicU32,
}

// Safety: `front` is only written by pop, which requires `&mut Queue` or
// the unique `Consumer` handle, and every cross-thread edge goes through
// `back` and the node links. `T: Send` because push and pop move values
// between threads.
unsafe impl<T: Send> Sync for Queue<'_, T> {}

impl<'p, T> Queue<'p, T> {
    /// Creates a queue drawing nodes from a shared pool.
    ///
    /// Acquires the sentinel node immediately: size the pool for one slot
    /// per queue on top of the expected live elements.
    ///
    /// # Panics
    ///
    /// Panics if the pool cannot supply the sentinel slot.
    pub fn new(pool: &'p QueuePool<T>) -> Self {
        Self::with_pool_ref(PoolRef::Shared(pool))
    }

    fn with_pool_ref(pool: PoolRef<'p, Node<T>>) -> Self {
        let sentinel = acquire_sentinel(pool.get())
            .expect("queue node pool has no free slot for the sentinel");

        Queue {
            pool,
            back: CachePadded::new(AtomicU32::new(sentinel)),
            front: atomic::AtomicU32::new(sentinel),
        }
    }
}

impl<T> Queue<'static, T> {
    /// Creates a queue with an internal pool sized for `capacity` elements
    /// plus the sentinel.
    pub fn with_capacity(capacity: u32) -> Self {
        Self::with_pool_ref(PoolRef::Local(Box::new(Pool::new(
            capacity.saturating_add(1),
        ))))
    }
}

impl<T> Queue<'_, T> {
    #[inline]
    fn pool(&self) -> &QueuePool<T> {
        self.pool.get()
    }

    #[inline]
    fn node(&self, index: u32) -> NonNull<Node<T>> {
        unsafe { self.pool().get(index) }
    }

    /// Pushes a value at the back of the queue.
    ///
    /// Wait-free: one swap and one store. Returns [`Full`] handing the
    /// value back when the node pool is drained. Safe to call from any
    /// number of threads concurrently.
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        self.push_inner(value, Ordering::AcqRel, atomic::Ordering::Release)
    }

    /// Pops the oldest value in the queue.
    ///
    /// Returns `None` if the queue is empty or the oldest push has not
    /// been published yet. One acquire load on the fast path, nothing
    /// else atomic.
    pub fn pop(&mut self) -> Option<T> {
        self.pop_inner(atomic::Ordering::Acquire)
    }

    /// Splits the queue into a cloneable producer handle and the unique
    /// consumer handle.
    pub fn split(&mut self) -> (Producer<'_, T>, Consumer<'_, T>) {
        let queue = &*self;
        (Producer { queue }, Consumer { queue })
    }

    /// Pushes without atomic synchronization.
    ///
    /// Algorithmically identical to [`push`](Self::push) with relaxed
    /// ordering throughout. The exclusive borrow is what makes this sound:
    /// use it during setup and teardown phases, or under an outer lock.
    pub fn push_unsync(&mut self, value: T) -> Result<(), Full<T>> {
        self.push_inner(value, Ordering::Relaxed, atomic::Ordering::Relaxed)
    }

    /// Pops without atomic synchronization.
    ///
    /// See [`push_unsync`](Self::push_unsync) for the usage contract.
    pub fn pop_unsync(&mut self) -> Option<T> {
        self.pop_inner(atomic::Ordering::Relaxed)
    }

    /// Returns `true` if the queue has no poppable elements.
    ///
    /// A quiescent check: by the time a caller acts on the answer, a
    /// concurrent push or pop may have changed it.
    pub fn is_empty(&self) -> bool {
        let front = self.front.load(atomic::Ordering::Relaxed);
        let node = self.node(front);
        unsafe { node.as_ref() }.prev.load(atomic::Ordering::Relaxed) == TaggedIndex::NULL_INDEX
    }

    fn push_inner(
        &self,
        value: T,
        claim: Ordering,
        publish: atomic::Ordering,
    ) -> Result<(), Full<T>> {
        // The node is fully constructed before it becomes visible.
        let new_index = match acquire_node(self.pool(), value) {
            Ok(index) => index,
            Err(value) => return Err(Full(value)),
        };

        let old_back = self.back.swap(new_index, claim);
        unsafe { self.node(old_back).as_ref() }.prev.store(new_index, publish);

        Ok(())
    }

    fn pop_inner(&self, order: atomic::Ordering) -> Option<T> {
        let front = self.front.load(atomic::Ordering::Relaxed);
        let front_node = self.node(front);

        // Pairs with the producer's publishing store; the payload write to
        // the published node happens-before the read below.
        let published = unsafe { front_node.as_ref() }.prev.load(order);
        if published == TaggedIndex::NULL_INDEX {
            return None;
        }

        self.front.store(published, atomic::Ordering::Relaxed);

        // The published node's payload moves out; that node stays behind
        // as the new sentinel while the old one goes back to the pool.
        let popped = self.node(published);
        let value = unsafe { (*popped.as_ptr()).data.get().read().assume_init() };
        unsafe { self.pool().release_raw(front_node) };

        Some(value)
    }
}

/// Acquires a pool slot and initializes it as an unlinked node holding
/// `value`, or hands `value` back if the pool is drained.
fn acquire_node<T>(pool: &QueuePool<T>, value: T) -> Result<u32, T> {
    match pool.acquire_raw() {
        Some(slot) => {
            let node = slot.cast::<Node<T>>();
            unsafe {
                ptr::addr_of_mut!((*node.as_ptr()).data)
                    .write(UnsafeCell::new(MaybeUninit::new(value)));
                ptr::addr_of_mut!((*node.as_ptr()).prev)
                    .write(atomic::AtomicU32::new(TaggedIndex::NULL_INDEX));
            }
            Ok(pool.index_of(node))
        }
        None => Err(value),
    }
}

/// Acquires a pool slot as a sentinel: unlinked, payload unwritten.
fn acquire_sentinel<T>(pool: &QueuePool<T>) -> Option<u32> {
    let slot = pool.acquire_raw()?;
    let node = slot.cast::<Node<T>>();
    unsafe {
        ptr::addr_of_mut!((*node.as_ptr()).prev)
            .write(atomic::AtomicU32::new(TaggedIndex::NULL_INDEX));
    }
    Some(pool.index_of(node))
}

impl<T> Drop for Queue<'_, T> {
    fn drop(&mut self) {
        while self.pop_unsync().is_some() {}

        // What remains at the front is the sentinel; its payload was moved
        // out (or never written), so the slot goes back without a drop.
        let sentinel = self.front.load(atomic::Ordering::Relaxed);
        let node = self.node(sentinel);
        unsafe { self.pool().release_raw(node) };
    }
}

impl<T> fmt::Debug for Queue<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Producer / Consumer handles
// =============================================================================

/// The producing half of a split MPSC queue.
///
/// Cloneable and shareable; all clones push into the same queue.
pub struct Producer<'q, T> {
    queue: &'q Queue<'q, T>,
}

impl<T> Producer<'_, T> {
    /// Pushes a value at the back of the queue. See [`Queue::push`].
    #[inline]
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        self.queue.push(value)
    }

    /// Returns `true` if the queue has no poppable elements. See
    /// [`Queue::is_empty`].
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> Clone for Producer<'_, T> {
    fn clone(&self) -> Self {
        Self { queue: self.queue }
    }
}

impl<T> fmt::Debug for Producer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").finish_non_exhaustive()
    }
}

/// The consuming half of a split MPSC queue.
///
/// Not cloneable: there is exactly one consumer, and this handle is it.
pub struct Consumer<'q, T> {
    queue: &'q Queue<'q, T>,
}

impl<T> Consumer<'_, T> {
    /// Pops the oldest value in the queue. See [`Queue::pop`].
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop_inner(atomic::Ordering::Acquire)
    }

    /// Returns `true` if the queue has no poppable elements. See
    /// [`Queue::is_empty`].
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T> fmt::Debug for Consumer<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn fifo_walkthrough(queue: &mut Queue<'_, i32>) {
        assert!(queue.is_empty());

        queue.push_unsync(42).unwrap();
        queue.push_unsync(666).unwrap();
        queue.push_unsync(1337).unwrap();

        assert_eq!(queue.push_unsync(1138), Err(Full(1138)));

        assert_eq!(queue.pop_unsync(), Some(42));
        assert_eq!(queue.pop_unsync(), Some(666));
        assert_eq!(queue.pop_unsync(), Some(1337));
        assert_eq!(queue.pop_unsync(), None);
    }

    #[test]
    fn single_thread_shared_pool() {
        // Three elements plus the sentinel.
        let pool = QueuePool::<i32>::new(3 + 1);
        let mut queue = Queue::new(&pool);
        fifo_walkthrough(&mut queue);
    }

    #[test]
    fn single_thread_local_pool() {
        let mut queue = Queue::<i32>::with_capacity(3);
        fifo_walkthrough(&mut queue);
    }

    #[test]
    fn atomic_interface_is_fifo() {
        let mut queue = Queue::<i32>::with_capacity(3);

        queue.push(42).unwrap();
        queue.push(666).unwrap();
        queue.push(1337).unwrap();
        assert_eq!(queue.push(1138), Err(Full(1138)));

        assert_eq!(queue.pop(), Some(42));
        assert_eq!(queue.pop(), Some(666));
        assert_eq!(queue.pop(), Some(1337));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn full_hands_the_value_back() {
        let queue = Queue::<u64>::with_capacity(1);
        queue.push(1).unwrap();
        assert_eq!(queue.push(2).unwrap_err().into_inner(), 2);
    }

    #[test]
    fn sixteen_producers_one_consumer() {
        const VALUES: usize = 300;
        const PRODUCERS: usize = 16;

        let mut queue = Queue::<u64>::with_capacity(VALUES as u32);
        let (producer, mut consumer) = queue.split();
        let next = AtomicUsize::new(0);

        let seen = thread::scope(|s| {
            for _ in 0..PRODUCERS {
                let producer = producer.clone();
                let next = &next;
                s.spawn(move || loop {
                    let value = next.fetch_add(1, Ordering::AcqRel);
                    if value >= VALUES {
                        break;
                    }
                    while producer.push(value as u64).is_err() {
                        thread::yield_now();
                    }
                });
            }

            let mut seen = HashSet::new();
            while seen.len() < VALUES {
                match consumer.pop() {
                    Some(value) => {
                        assert!(seen.insert(value), "value {value} popped twice");
                    }
                    None => thread::yield_now(),
                }
            }
            seen
        });

        assert_eq!(seen.len(), VALUES);
        assert!(consumer.pop().is_none());
        drop((producer, consumer));
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_drains_remaining_elements() {
        use std::sync::Arc;

        #[derive(Debug)]
        struct DropCounter(Arc<AtomicUsize>);
        impl Drop for DropCounter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drop_count = Arc::new(AtomicUsize::new(0));
        {
            let mut queue = Queue::<DropCounter>::with_capacity(8);
            for _ in 0..3 {
                queue.push(DropCounter(Arc::clone(&drop_count))).unwrap();
            }
            assert_eq!(queue.pop().map(|_| ()), Some(()));
            assert_eq!(drop_count.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drop_count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn sentinel_returns_to_shared_pool_on_drop() {
        let pool = QueuePool::<u64>::new(2);
        {
            let queue = Queue::new(&pool);
            queue.push(9).unwrap();
            assert!(pool.is_empty());
        }
        assert!(pool.is_full());
    }
}
