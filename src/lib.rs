//! A self-checking memory allocator for embedded targets.
//!
//! Most allocators try hard to *avoid* corrupting memory. This crate starts
//! from the opposite assumption: on a small target without an MMU, something
//! (a runaway task, an out-of-bound write, a double free) eventually *will*
//! scribble over the heap, and the difference between a five-minute fix and a
//! week of debugging is whether the allocator notices at the point of use.
//! Every heap block therefore carries redundant, checksummed metadata that is
//! re-validated on every operation that touches it.
//!
//! # Usage
//! To use this crate you can add `sentry_malloc` as a dependency in your
//! project's `Cargo.toml`.
//! ```toml
//! [dependencies]
//! sentry_malloc = "0.1"
//! ```
//!
//! ```
//! use sentry_malloc::SentryMalloc;
//!
//! static ALLOCATOR: SentryMalloc = SentryMalloc::new();
//!
//! fn main() {
//!     ALLOCATOR.init(4096).unwrap();
//!
//!     let p = ALLOCATOR.allocate(128, 0x1001).unwrap();
//!     // ... hand the 128 bytes to whoever asked for them ...
//!     ALLOCATOR.free(p.as_ptr(), 0x1002).unwrap();
//!
//!     assert_eq!(ALLOCATOR.allocated_bytes(), 0);
//! }
//! ```
//!
//! # Allocators
//! Two allocators are exported by this crate - [`RawSentry`] and
//! [`SentryMalloc`]. Use [`RawSentry`] if all heap access happens from a
//! single context; [`SentryMalloc`] wraps it in a mutex with a bounded
//! acquisition wait, which is what you want under a preemptive RTOS. A
//! failed acquisition is an ordinary [`Fault`], not a panic: the operation
//! is aborted before any heap state is touched.
//!
//! # Mode of operation
//! The heap is a single fixed-size arena established by `init` and never
//! resized. It is divided into blocks laid out back to back:
//!
//! ```text
//! +--------------+---------+-----------------------+--------------+---------+
//! | aligned size | align.  |        PAYLOAD        | aligned size | align.  |
//! | + alloc flag | offset  |       USER DATA       | + alloc flag | offset  |
//! | + origin id  | + CRC16 |                       | + origin id  | + CRC16 |
//! +--------------+---------+-----------------------+--------------+---------+
//! ^-- header               ^-- aligned size bytes  ^-- boundary tag
//! ```
//!
//! Each block starts with a *header* and ends with a *boundary tag* carrying
//! the identical record: payload size with the allocated flag tagged into
//! its lowest bit, the offset between the requested and the aligned size,
//! optionally the caller's origin id, and a CRC-16 over all of it. The
//! duplication is what makes corruption detectable from either side: a
//! write running off the end of a payload lands in the boundary tag first,
//! and a free of that block fails with [`Fault::FreeInvalidBoundary`]
//! instead of quietly merging garbage.
//!
//! Allocation walks the blocks in address order (first fit), validating
//! every visited block before trusting its size to step to the next one.
//! The chosen block is split, with the remainder becoming a new free block,
//! unless the remainder would be too small to ever satisfy an allocation,
//! in which case the whole block is consumed. Freeing validates the block,
//! checks the alignment padding for the overwrite sentinel (a write of even
//! one byte past the requested size is reported as
//! [`Fault::OutOfBoundWrite`]), detects double frees, scrubs the payload,
//! and coalesces with whichever neighbors are free and independently valid.
//!
//! # Why store both the aligned size and the alignment offset?
//! Requested sizes are rounded up to a 4-byte granularity, so a 5-byte
//! allocation owns 8 payload bytes. If only the aligned size were stored, a
//! 7-byte write into that block could only ever be caught after it altered
//! a neighbor. With the offset stored as well, the original request can be
//! reconstructed and the padding checked for its sentinel on free, which
//! catches the overflow while it is still contained.
//!
//! # What this cannot catch
//! A block whose metadata is rewritten *consistently* - fields altered and
//! both checksums recomputed to match - is indistinguishable from a genuine
//! block. The checks target the overwhelmingly common case of unintentional
//! scribbles, not an adversary with full knowledge of the layout.
//!
//! # Caller tracking
//! Every allocate and free can be tagged with an opaque nonzero origin id -
//! a task id, a call-site constant, whatever identifies the caller in your
//! system. The last few ids are kept in a small ring buffer
//! ([`SentryMalloc::latest_caller_ids`]) and, with the `extended-header`
//! feature (on by default), the id travels inside each block's metadata, so
//! a corrupted heap can still tell you who touched a block last
//! ([`SentryMalloc::allocation_origin`]).
//!
//! # Stack guarding
//! Heap checks do nothing against a task overflowing its *stack*, so the
//! [`stackguard`] module covers that flank: it maps task stacks onto the
//! regions of a memory protection unit behind the small
//! [`MemoryProtection`](stackguard::MemoryProtection) trait, keeping only
//! the running task's stack writable. A software implementation is included
//! for host-side testing; on real hardware you implement the trait over
//! your MPU driver.
//!
//! [`RawSentry`]: allocators::RawSentry
//! [`SentryMalloc`]: allocators::SentryMalloc

pub use crate::allocators::raw_sentry::{MAX_HEAP_SIZE, OVERWRITE_VALUE};
pub use crate::allocators::RawSentry;
pub use crate::allocators::SentryMalloc;
pub use crate::block::{BLOCK_OVERHEAD, META_SIZE, MIN_ALLOC_SIZE};
pub use crate::calllog::CALLER_LOG_SIZE;
pub use crate::checksum::{Checksum, Crc16};
pub use crate::error::{Fault, FaultHandler};
pub use crate::stats::HeapStats;
pub use crate::util::align;

pub mod allocators;
mod block;
mod calllog;
pub mod checksum;
mod error;
pub mod stackguard;
mod stats;
mod util;
