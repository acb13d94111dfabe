//! Ferrite kernel library
//!
//! Core of the Ferrite teaching kernel: the paged frame allocator with
//! demand-paging eviction, together with the page-table, supplemental
//! page-table, swap and backing-file collaborators it coordinates with.
//!
//! The subsystem is constructed once at boot as a [`mm::PageSubsystem`]
//! value and passed by reference to callers; see the `mm` module for the
//! allocation and eviction entry points.

#![no_std]

extern crate alloc;

// Host target: link std and use the system allocator so that unit and
// integration tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod error;
pub mod fs;
pub mod mm;
pub mod process;
pub mod sync;
