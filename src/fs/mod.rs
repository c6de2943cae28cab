//! Filesystem utilities.
//!
//! Atomic writes keep the embedded lock table free of torn records.

pub mod atomic;

pub use atomic::atomic_write;
