//! Multi-producer/multi-consumer FIFO queue.
//!
//! The queue is a singly-linked list of pool nodes threaded front to
//! back: each node's link points at the next-newer node. The back always
//! holds a sentinel whose payload is not yet written; a push claims the
//! current sentinel with one swap, writes its payload, and publishes the
//! link to a freshly acquired replacement sentinel. That publish is the
//! only synchronizing edge consumers need: its release store pairs with
//! the consumer's acquire load, so the payload write happens-before the
//! consumer's read and the front CAS itself can stay relaxed.
//!
//! Producers are wait-free: one swap, one store, no loops. Consumers
//! retry a single CAS on the front. See the crate docs for the
//! producer-stall window this design trades for.
//!
//! # Example
//!
//! ```
//! use keel_queue::mpmc::{Queue, QueuePool};
//!
//! // One pool shared by two queues: budget one sentinel slot each.
//! let pool = QueuePool::<u64>::new(4 + 2);
//! let orders = Queue::new(&pool);
//! let fills = Queue::new(&pool);
//!
//! orders.push(1).unwrap();
//! fills.push(2).unwrap();
//! assert_eq!(orders.pop(), Some(1));
//! assert_eq!(fills.pop(), Some(2));
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic;

use crossbeam_utils::CachePadded;
use keel_pool::sync::{AtomicU64, Ordering};
use keel_pool::{Pool, TaggedIndex};

use crate::{Full, PoolRef};

/// A pool of MPMC queue nodes, shareable between several queues (and
/// sized with [`keel_pool::PoolBudget`] when it is).
pub type QueuePool<T> = Pool<Node<T>>;

/// One queue element as stored in the pool: payload storage plus the link
/// to the next-newer node.
///
/// Opaque; it exists in the public API only so callers can construct a
/// [`QueuePool`] of the right element type. The payload is uninitialized
/// from the moment a node becomes the back sentinel until the push that
/// claims it publishes the link.
pub struct Node<T> {
    data: UnsafeCell<MaybeUninit<T>>,
    // Tagged index of the next-newer node; NULL until published. A plain
    // (non loom-shimmed) atomic: nodes live in recycled pool slots.
    prev: atomic::AtomicU64,
}

impl<T> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node").finish_non_exhaustive()
    }
}

/// A lock-free MPMC FIFO queue over pool-allocated nodes.
///
/// Bounded by its node pool; one pool slot is permanently held as the
/// sentinel. `push` fails fast with [`Full`] when the pool drains, `pop`
/// returns `None` on an empty queue, and neither ever blocks or
/// allocates.
pub struct Queue<'p, T> {
    pool: PoolRef<'p, Node<T>>,
    front: CachePadded<AtomicU64>,
    back: CachePadded<AtomicU64>,
}

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
        let sentinel =
            acquire_node(pool.get()).expect("queue node pool has no free slot for the sentinel");
        let word = TaggedIndex::new(sentinel, 0).into_raw();

        Queue {
            pool,
            front: CachePadded::new(AtomicU64::new(word)),
            back: CachePadded::new(AtomicU64::new(word)),
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
    /// Wait-free: one swap claims the current sentinel, one store
    /// publishes it. Returns [`Full`] handing the value back when the
    /// node pool is drained.
    pub fn push(&self, value: T) -> Result<(), Full<T>> {
        self.push_inner(value, Ordering::AcqRel, atomic::Ordering::Release)
    }

    /// Pops the oldest value in the queue.
    ///
    /// Returns `None` if the queue is empty, or while the push of the
    /// oldest unpublished element is still in flight (see the crate docs
    /// on the producer-stall window).
    pub fn pop(&self) -> Option<T> {
        let mut observed = TaggedIndex::from_raw(self.front.load(Ordering::Relaxed));
        let mut node = self.node(observed.index());
        // The acquire pairs with the producer's release publish, making the
        // payload write visible before the read below.
        let mut published =
            TaggedIndex::from_raw(unsafe { node.as_ref() }.prev.load(atomic::Ordering::Acquire));

        while !published.is_null() {
            // Only the link carries data synchronization, so the front CAS
            // itself can stay relaxed; the tag bump keeps stale observers
            // (and garbage read from recycled front slots) from winning.
            let new_front = TaggedIndex::new(published.index(), observed.tag().wrapping_add(1));
            match self.front.compare_exchange_weak(
                observed.into_raw(),
                new_front.into_raw(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let value = unsafe { (*node.as_ptr()).data.get().read().assume_init() };
                    unsafe { self.pool().release_raw(node) };
                    return Some(value);
                }
                Err(current) => {
                    observed = TaggedIndex::from_raw(current);
                    node = self.node(observed.index());
                    published = TaggedIndex::from_raw(
                        unsafe { node.as_ref() }.prev.load(atomic::Ordering::Acquire),
                    );
                }
            }
        }

        None
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
        let observed = TaggedIndex::from_raw(self.front.load(Ordering::Relaxed));
        let node = self.node(observed.index());
        let published =
            TaggedIndex::from_raw(unsafe { node.as_ref() }.prev.load(atomic::Ordering::Relaxed));
        if published.is_null() {
            return None;
        }

        self.front.store(
            TaggedIndex::new(published.index(), observed.tag().wrapping_add(1)).into_raw(),
            Ordering::Relaxed,
        );
        let value = unsafe { (*node.as_ptr()).data.get().read().assume_init() };
        unsafe { self.pool().release_raw(node) };
        Some(value)
    }

    /// Returns `true` if the queue has no poppable elements.
    ///
    /// A quiescent check: by the time a caller acts on the answer, a
    /// concurrent push or pop may have changed it.
    pub fn is_empty(&self) -> bool {
        let front = TaggedIndex::from_raw(self.front.load(Ordering::Relaxed));
        let node = self.node(front.index());
        TaggedIndex::from_raw(unsafe { node.as_ref() }.prev.load(atomic::Ordering::Relaxed))
            .is_null()
    }

    fn push_inner(
        &self,
        value: T,
        claim: Ordering,
        publish: atomic::Ordering,
    ) -> Result<(), Full<T>> {
        let new_index = match acquire_node(self.pool()) {
            Some(index) => index,
            None => return Err(Full(value)),
        };
        let new_back = TaggedIndex::new(new_index, 0);

        // 1. The new node becomes the sentinel.
        let old_back = TaggedIndex::from_raw(self.back.swap(new_back.into_raw(), claim));

        // 2. The claimed node is ours until the publish below: write the
        //    payload into it.
        let claimed = self.node(old_back.index());
        unsafe { (*claimed.as_ptr()).data.get().write(MaybeUninit::new(value)) };

        // 3. Publish the link; consumers may pop the node from here on.
        unsafe { claimed.as_ref() }.prev.store(new_back.into_raw(), publish);

        Ok(())
    }
}

/// Acquires a pool slot and initializes it as an unlinked node with an
/// unwritten payload.
fn acquire_node<T>(pool: &QueuePool<T>) -> Option<u32> {
    let slot = pool.acquire_raw()?;
    let node = slot.cast::<Node<T>>();
    unsafe {
        ptr::addr_of_mut!((*node.as_ptr()).prev)
            .write(atomic::AtomicU64::new(TaggedIndex::NULL.into_raw()));
    }
    Some(pool.index_of(node))
}

impl<T> Drop for Queue<'_, T> {
    fn drop(&mut self) {
        while self.pop_unsync().is_some() {}

        // What remains at the front is the sentinel; its payload was never
        // written, so the slot goes back without a drop.
        let sentinel = TaggedIndex::from_raw(self.front.load(Ordering::Relaxed));
        let node = self.node(sentinel.index());
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
// Tests
// =============================================================================

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
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
        let queue = Queue::<i32>::with_capacity(3);

        queue.push(42).unwrap();
        queue.push(666).unwrap();
        queue.push(1337).unwrap();
        assert_eq!(queue.push(1138), Err(Full(1138)));

        assert_eq!(queue.pop(), Some(42));
        assert_eq!(queue.pop(), Some(666));
        assert_eq!(queue.pop(), Some(1337));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn sentinel_is_budgeted_per_queue() {
        use keel_pool::PoolBudget;

        let pool = QueuePool::<u64>::new(PoolBudget::new().live_elements(2).queues(2).capacity());
        let first = Queue::new(&pool);
        let second = Queue::new(&pool);

        first.push(1).unwrap();
        second.push(2).unwrap();

        // Both sentinels and both elements are out: the pool is drained.
        assert!(first.push(3).is_err());
        assert!(second.push(3).is_err());

        assert_eq!(first.pop(), Some(1));
        assert_eq!(second.pop(), Some(2));
    }

    #[test]
    fn full_hands_the_value_back() {
        let queue = Queue::<u64>::with_capacity(1);
        queue.push(1).unwrap();
        assert_eq!(queue.push(2).unwrap_err().into_inner(), 2);
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
            let queue = Queue::<DropCounter>::with_capacity(8);
            for _ in 0..5 {
                queue.push(DropCounter(Arc::clone(&drop_count))).unwrap();
            }
            assert_eq!(drop_count.load(Ordering::SeqCst), 0);
        }
        assert_eq!(drop_count.load(Ordering::SeqCst), 5);
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

    #[test]
    fn single_producer_pops_in_push_order() {
        const COUNT: u64 = 1000;

        let queue = Queue::<u64>::with_capacity(64);

        thread::scope(|s| {
            let producer = {
                let queue = &queue;
                s.spawn(move || {
                    for value in 0..COUNT {
                        loop {
                            match queue.push(value) {
                                Ok(()) => break,
                                Err(Full(_)) => thread::yield_now(),
                            }
                        }
                    }
                })
            };

            let mut received = Vec::with_capacity(COUNT as usize);
            while received.len() < COUNT as usize {
                match queue.pop() {
                    Some(value) => received.push(value),
                    None => thread::yield_now(),
                }
            }
            producer.join().unwrap();

            let expected: Vec<u64> = (0..COUNT).collect();
            assert_eq!(received, expected);
        });

        assert!(queue.is_empty());
    }

    #[test]
    fn concurrent_mixed_push_pop() {
        use rand::Rng;

        const CAPACITY: u32 = 300;
        const THREADS: usize = 12;
        const OPS_PER_THREAD: usize = 50;

        let queue = Queue::<u64>::with_capacity(CAPACITY);

        // Push-first alternation: whenever a thread spins in pop, the queue
        // holds at least one element per spinning thread.
        let (pushed, popped): (u64, u64) = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let queue = &queue;
                    s.spawn(move || {
                        let mut rng = rand::thread_rng();
                        let mut pushed_sum = 0u64;
                        let mut popped_sum = 0u64;

                        for _ in 0..OPS_PER_THREAD / 2 {
                            let value = rng.gen_range(0..1_000_000u64);
                            loop {
                                match queue.push(value) {
                                    Ok(()) => break,
                                    Err(Full(_)) => thread::yield_now(),
                                }
                            }
                            pushed_sum += value;

                            loop {
                                if let Some(value) = queue.pop() {
                                    popped_sum += value;
                                    break;
                                }
                                thread::yield_now();
                            }
                        }

                        (pushed_sum, popped_sum)
                    })
                })
                .collect();

            handles.into_iter().fold((0, 0), |(p, q), h| {
                let (a, b) = h.join().unwrap();
                (p + a, q + b)
            })
        });

        assert_eq!(pushed, popped);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }
}
