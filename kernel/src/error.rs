//! Error types for the Ferrite kernel
//!
//! Recoverable failures carry structured context (which pool, which
//! address) instead of string literals. Invariant violations do not get a
//! variant here; they are fatal asserts at the point of detection.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// The selected pool has no free run of the requested length.
    OutOfFrames {
        pool: &'static str,
        requested: usize,
    },
    /// A zero-length allocation yields no address.
    ZeroSizedAllocation,
    /// The faulting address has no page-table entry in the process.
    UnmappedAddress {
        addr: usize,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfFrames { pool, requested } => {
                write!(f, "out of frames: no run of {requested} pages in {pool}")
            }
            KernelError::ZeroSizedAllocation => write!(f, "zero-sized allocation"),
            KernelError::UnmappedAddress { addr } => {
                write!(f, "address {addr:#x} is not mapped")
            }
        }
    }
}
