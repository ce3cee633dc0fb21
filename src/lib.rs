#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]

//! rseq-slab: a restartable-sequence per-CPU slab cache.
//!
//! Each CPU owns an array of LIFO pointer stacks, one per size class, in a
//! single contiguous memory bank. Threads push and pop objects on their
//! current CPU's stacks with **no atomic read-modify-write operations**: the
//! kernel's restartable sequences (rseq) abort the critical section on
//! preemption or migration, so a plain 16-bit store commits each operation.
//!
//! ```text
//!   push(class, ptr)                     pop(class)
//!     |                                    |
//!     v                                    v
//!  [per-CPU stack: 1 asm critical      [per-CPU stack: pop + prefetch
//!   section, 16-bit commit]             of the next object]
//!     |  false? (full/migrated)           |  None? (empty/migrated)
//!     v                                   v
//!  caller's overflow handler           caller's underflow handler
//! ```
//!
//! The slow path (per-CPU init, capacity grow/shrink, drain, live resize of
//! the whole bank) runs under one caller-held mutex and quiesces a CPU's
//! fast paths by setting a `stopped` flag and broadcasting an rseq-aware
//! membarrier. See [`slab::PerCpuSlab`] for the full protocol.
//!
//! On kernels or targets without rseq (or without the expedited rseq
//! membarrier) every fast-path operation reports a miss and the caller's
//! handlers serve all traffic; x86_64 Linux is currently the only fast-path
//! implementation.
//!
//! # Features
//!
//! - `std` (default): per-thread state in `std::thread_local!`.
//! - `nightly`: per-thread state in a `#[thread_local]` static instead,
//!   usable without `std`.
//!
//! With neither feature the crate is fallback-only.

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod abi;
pub mod header;
pub mod ops;
pub mod slab;
pub mod sys;
pub mod syscall;
pub mod thread;

// Re-export key types at crate root.
pub use slab::{BEGIN_MARK, MetadataMemoryUsage, PerCpuSlab, ResizeInfo, VirtualCpuMode};
pub use thread::{current_cpu, rseq_available, uncache_current_cpu};
