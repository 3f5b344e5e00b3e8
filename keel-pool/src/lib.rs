//! # keel-pool
//!
//! A bounded lock-free object pool for latency-critical applications.
//!
//! The pool allocates one contiguous slab of fixed-size slots at
//! construction and never touches the allocator again. Slots are handed
//! out and reclaimed through a lock-free free list threaded through the
//! vacant slots themselves: a vacant slot stores the index of the next
//! free slot, an occupied slot stores a live `T`, and a slot is never
//! both at once.
//!
//! ## ABA protection
//!
//! The free-list head packs a 32-bit slot index and a 32-bit generation
//! tag into a single `u64`, updated with one compare-and-swap. Every
//! successful acquire bumps the tag, so a thread holding a stale head
//! observes a different word after any acquire/release round-trip and its
//! CAS fails. Releases reuse the tag they observed: only the operation
//! that detaches a slot needs to invalidate stale observers.
//!
//! ## Sharing
//!
//! Several containers (see `keel-stack` and `keel-queue`) can draw nodes
//! from one pool. Use [`PoolBudget`] to size a shared pool; each queue
//! instance keeps one sentinel slot checked out for its whole lifetime.
//!
//! # Example
//!
//! ```
//! use keel_pool::Pool;
//!
//! let pool = Pool::<u64>::new(3);
//!
//! let a = pool.acquire(42).unwrap();
//! let b = pool.acquire(666).unwrap();
//! unsafe {
//!     assert_eq!(*a.as_ref(), 42);
//!     pool.release(a);
//!     pool.release(b);
//! }
//! assert!(pool.is_full());
//! ```
//!
//! # Requirements on `T`
//!
//! `size_of::<T>()` must be at least 4 bytes so a vacant slot can hold its
//! free-list link; this is checked at compile time when the pool is
//! constructed. Move construction and `Drop` must not block.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, missing_debug_implementations)]

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::fmt;
use std::mem::{size_of, ManuallyDrop, MaybeUninit};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use crossbeam_utils::CachePadded;

mod budget;
pub mod sync;
mod tag;

pub use budget::PoolBudget;
pub use tag::TaggedIndex;

use sync::{spin_loop, AtomicU64, Ordering};

/// Maximum number of slots a pool can manage.
///
/// One index value below the slot-index range is reserved as the
/// end-of-list marker, so capacity tops out one short of `u32::MAX`.
pub const MAX_CAPACITY: u32 = u32::MAX - 1;

// =============================================================================
// Errors
// =============================================================================

/// Returned when acquiring from a drained pool.
///
/// Contains the value that could not be stored, returning ownership to the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full<T>(
    /// The value that could not be stored.
    pub T,
);

impl<T> Full<T> {
    /// Returns the value that could not be stored.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for Full<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool has no free slots")
    }
}

impl<T: fmt::Debug> std::error::Error for Full<T> {}

// =============================================================================
// Slot
// =============================================================================

/// A single storage cell.
///
/// Vacant slots hold the free-list link, occupied slots hold a live `T`.
/// The union keeps every slot aligned for both, so the link can be read
/// through an `AtomicU32` while the slot's former occupant is being
/// replaced by another thread (the "critical read" in `acquire_index`).
#[repr(C)]
union Slot<T> {
    next: u32,
    value: ManuallyDrop<T>,
}

// =============================================================================
// Pool
// =============================================================================

/// A bounded lock-free object pool.
///
/// Hands out pointers to `T`-sized slots from a fixed slab and reclaims
/// them by index, multi-producer/multi-consumer safe. Acquiring from a
/// drained pool is not an error: it reports [`Full`] (or `None` for the
/// raw variant) and the caller decides whether to retry, shed load, or
/// back off.
///
/// Dropping the pool deallocates the slab **without** running destructors
/// on any occupant; callers release everything they acquired first.
/// Containers built on the pool borrow it, so the borrow checker enforces
/// that ordering statically.
pub struct Pool<T> {
    head: CachePadded<AtomicU64>,
    storage: NonNull<Slot<T>>,
    capacity: u32,
    layout: Layout,
}

// Safety: the pool moves `T` values across threads through acquire and
// release but never shares references to them, so `T: Send` suffices for
// both.
unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T> Pool<T> {
    const ELEMENT_HOLDS_LINK: () = assert!(
        size_of::<T>() >= size_of::<u32>(),
        "pool elements must be at least 4 bytes"
    );

    /// Creates a pool with `capacity` slots, all vacant.
    ///
    /// Requests above [`MAX_CAPACITY`] are clamped to it. The whole slab
    /// is allocated here; no allocation happens after construction.
    pub fn new(capacity: u32) -> Self {
        let _ = Self::ELEMENT_HOLDS_LINK;

        let capacity = capacity.min(MAX_CAPACITY);
        let layout = Layout::array::<Slot<T>>(capacity as usize).expect("pool slab layout overflow");

        let storage = if layout.size() == 0 {
            NonNull::dangling()
        } else {
            let ptr = unsafe { alloc(layout) };
            match NonNull::new(ptr.cast::<Slot<T>>()) {
                Some(ptr) => ptr,
                None => handle_alloc_error(layout),
            }
        };

        let pool = Self {
            head: CachePadded::new(AtomicU64::new(TaggedIndex::NULL.into_raw())),
            storage,
            capacity,
            layout,
        };

        // Thread the free list through the vacant slots in index order.
        for index in 0..capacity {
            let next = if index + 1 == capacity {
                TaggedIndex::NULL_INDEX
            } else {
                index + 1
            };
            unsafe { (*pool.slot_ptr(index)).next = next };
        }

        if capacity > 0 {
            pool.head
                .store(TaggedIndex::new(0, 0).into_raw(), Ordering::Release);
        }

        pool
    }

    /// Acquires a slot and moves `value` into it.
    ///
    /// Returns the slot pointer, or [`Full`] handing `value` back when the
    /// pool is drained.
    pub fn acquire(&self, value: T) -> Result<NonNull<T>, Full<T>> {
        match self.acquire_raw() {
            Some(slot) => {
                let ptr = slot.cast::<T>();
                unsafe { ptr.as_ptr().write(value) };
                Ok(ptr)
            }
            None => Err(Full(value)),
        }
    }

    /// Acquires a slot without constructing anything in it.
    ///
    /// Returns `None` when the pool is drained. The caller owns the slot
    /// and may initialize it in place before handing the pointer to
    /// [`release`](Self::release), or return it untouched through
    /// [`release_raw`](Self::release_raw).
    pub fn acquire_raw(&self) -> Option<NonNull<MaybeUninit<T>>> {
        let index = self.acquire_index()?;
        Some(unsafe { self.get(index) }.cast())
    }

    /// Drops the occupant in place, then returns the slot to the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this pool's acquire methods, hold a
    /// live `T`, and not have been released since.
    pub unsafe fn release(&self, ptr: NonNull<T>) {
        if std::mem::needs_drop::<T>() {
            let slot = ptr.as_ptr().cast::<Slot<T>>();
            unsafe { ManuallyDrop::drop(&mut (*slot).value) };
        }
        unsafe { self.release_raw(ptr) };
    }

    /// Returns the slot to the free list without touching its contents.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this pool's acquire methods and not
    /// have been released since. Any occupant is forgotten, not dropped.
    pub unsafe fn release_raw(&self, ptr: NonNull<T>) {
        debug_assert!(
            self.manages(ptr),
            "releasing a pointer this pool does not manage"
        );
        self.release_index(self.index_of(ptr));
    }

    /// Returns `true` if `ptr` points into this pool's slab.
    pub fn manages(&self, ptr: NonNull<T>) -> bool {
        let base = self.storage.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= base && addr < base + self.capacity as usize * size_of::<Slot<T>>()
    }

    /// Returns the slot index behind a pointer obtained from this pool.
    pub fn index_of(&self, ptr: NonNull<T>) -> u32 {
        debug_assert!(self.manages(ptr));
        let offset = ptr.as_ptr() as usize - self.storage.as_ptr() as usize;
        debug_assert!(offset % size_of::<Slot<T>>() == 0);
        (offset / size_of::<Slot<T>>()) as u32
    }

    /// Returns the pointer to the slot at `index`.
    ///
    /// # Safety
    ///
    /// `index` must be below the pool's capacity.
    #[inline]
    pub unsafe fn get(&self, index: u32) -> NonNull<T> {
        debug_assert!(!self.is_null(index));
        unsafe { NonNull::new_unchecked(self.storage.as_ptr().add(index as usize)).cast() }
    }

    /// Returns `true` if the pool has no slots left to hand out.
    ///
    /// A quiescent check: under concurrent mutation the answer may be stale
    /// by the time the caller acts on it.
    pub fn is_empty(&self) -> bool {
        self.is_null(TaggedIndex::from_raw(self.head.load(Ordering::Relaxed)).index())
    }

    /// Returns `true` if every slot is on the free list.
    ///
    /// O(capacity): walks the free list. Only meaningful while no other
    /// thread is mutating the pool.
    pub fn is_full(&self) -> bool {
        let mut index = TaggedIndex::from_raw(self.head.load(Ordering::Relaxed)).index();
        for _ in 0..self.capacity {
            if self.is_null(index) {
                return false;
            }
            index = unsafe { (*self.slot_ptr(index)).next };
        }
        true
    }

    /// Returns the number of slots the pool manages.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    // -------------------------------------------------------------------------
    // Internal: free list
    // -------------------------------------------------------------------------

    #[inline]
    fn is_null(&self, index: u32) -> bool {
        index >= self.capacity
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut Slot<T> {
        debug_assert!(!self.is_null(index));
        unsafe { self.storage.as_ptr().add(index as usize) }
    }

    /// Free-list link of a slot, viewed atomically.
    ///
    /// `acquire_index` reads the link of a slot another thread may already
    /// have re-acquired and overwritten, so the access must be atomic even
    /// though the value read may be garbage; the head CAS rejects it.
    #[inline]
    fn link(&self, index: u32) -> &AtomicU32 {
        unsafe { &*(self.slot_ptr(index) as *const AtomicU32) }
    }

    fn acquire_index(&self) -> Option<u32> {
        let mut head = TaggedIndex::from_raw(self.head.load(Ordering::Relaxed));

        loop {
            if self.is_null(head.index()) {
                return None;
            }

            // Critical read: the slot may be mid-reuse and `next` may be
            // arbitrary bytes. The memory itself stays allocated, and the
            // tag bump below fails the CAS whenever the head moved.
            let next = self.link(head.index()).load(Ordering::Relaxed);

            let replacement = TaggedIndex::new(next, head.tag().wrapping_add(1));
            match self.head.compare_exchange_weak(
                head.into_raw(),
                replacement.into_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(head.index()),
                Err(current) => {
                    head = TaggedIndex::from_raw(current);
                    spin_loop();
                }
            }
        }
    }

    fn release_index(&self, index: u32) {
        debug_assert!(!self.is_null(index));
        let mut head = TaggedIndex::from_raw(self.head.load(Ordering::Relaxed));

        loop {
            self.link(index).store(head.index(), Ordering::Relaxed);

            // Releases keep the observed tag; only acquires bump it.
            let replacement = TaggedIndex::new(index, head.tag());
            match self.head.compare_exchange_weak(
                head.into_raw(),
                replacement.into_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => head = TaggedIndex::from_raw(current),
            }
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        // Occupants are the callers' responsibility; only the slab goes.
        if self.layout.size() != 0 {
            unsafe { dealloc(self.storage.as_ptr().cast(), self.layout) };
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("drained", &self.is_empty())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "loom"))]
mod loom_tests;

// =============================================================================
// Tests
// =============================================================================
