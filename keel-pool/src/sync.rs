//! Atomics, switchable to [loom] for model checking.
//!
//! Everything that participates in the cross-thread protocols (the pool
//! head, the container head words) goes through these re-exports so the
//! `loom` feature can swap in the model-checked versions. Links stored
//! inside recycled pool slots stay on the plain `core` atomics: loom
//! objects cannot live in memory that is reinterpreted after release.
//!
//! ```text
//! cargo test -p keel-pool --features loom
//! ```
//!
//! [loom]: https://docs.rs/loom

#[cfg(not(feature = "loom"))]
pub use core::hint::spin_loop;
#[cfg(feature = "loom")]
pub use loom::hint::spin_loop;

#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
