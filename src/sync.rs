//! Synchronization primitives with optional loom support.
//!
//! Stripe and segment counters are touched from I/O submission threads,
//! flush completion threads and the GC/rebuild workers at the same time.
//! They use the atomics re-exported here so the races can be model-checked
//! with loom while production builds use plain std atomics.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicBool, AtomicU32, Ordering};
