//! A singlethreaded self-checking allocator.
//!
//! For a general view of the allocator's operational semantics see the
//! [`crate`] level documentation.
//
// # Additional implementation notes
// The heap is a single owned arena established by `init` and never resized.
// Every block reference is a byte offset into it; navigation between blocks
// is offset arithmetic bounds-checked against the arena length, and any
// metadata read that would leave the arena decodes as "invalid" instead of
// being performed.
//
// The free-block scan walks blocks in address order from offset 0 and fully
// validates every block it visits before trusting its metadata to step
// further. The scan therefore never continues past corruption.

use crate::block::{
    self, BlockMeta, AUTO_BLOCK_ORIGIN, BLOCK_OVERHEAD, META_SIZE, MIN_ALLOC_SIZE, MIN_BLOCK_SIZE,
};
use crate::calllog::CallerLog;
use crate::checksum::{Checksum, Crc16};
use crate::error::{report, Fault, FaultHandler};
use crate::stats::HeapStats;
use crate::util::checked_align;

use core::ptr::NonNull;
use std::fmt::{self, Debug};

use static_assertions::const_assert;
use tracing::{debug, instrument, Level};

/// Byte written over virgin heap memory, freed payloads and consumed block
/// metadata. The free-time bounds check relies on alignment padding still
/// holding this value.
pub const OVERWRITE_VALUE: u8 = 0xFF;

/// Largest heap size `init` accepts; block sizes are stored in 31 bits.
pub const MAX_HEAP_SIZE: usize = (u32::MAX >> 1) as usize;

// The initial whole-heap block must be expressible.
const_assert!(MIN_BLOCK_SIZE > BLOCK_OVERHEAD);

/// A singlethreaded self-checking allocator.
///
/// Construction does not establish a heap; [`init`](RawSentry::init) must be
/// called first, and every operation before that fails with
/// [`Fault::NotInitialized`]. Construction is `const`, so the allocator can
/// live in a `static` and be initialized during startup.
pub struct RawSentry<C: Checksum = Crc16> {
    heap: Option<Heap>,
    log: CallerLog,
    checksum: C,
    fault_handler: Option<FaultHandler>,
}

impl<C: Checksum> Debug for RawSentry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSentry")
            .field("initialized", &self.heap.is_some())
            .field("stats", &self.statistics())
            .finish()
    }
}

impl RawSentry<Crc16> {
    /// Creates an uninitialized allocator with the default CRC-16 checksum.
    pub const fn new() -> Self {
        Self::with_checksum(Crc16)
    }
}

impl Default for RawSentry<Crc16> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Checksum> RawSentry<C> {
    /// Creates an uninitialized allocator with the provided checksum
    /// implementation.
    pub const fn with_checksum(checksum: C) -> Self {
        RawSentry {
            heap: None,
            log: CallerLog::new(),
            checksum,
            fault_handler: None,
        }
    }

    /// Installs a callback invoked synchronously for every reported fault.
    pub fn set_fault_handler(&mut self, handler: FaultHandler) {
        self.fault_handler = Some(handler);
    }

    /// Establishes the heap as one free block spanning `size` bytes (minus
    /// metadata overhead) and resets statistics and the caller log.
    ///
    /// `size` must be nonzero, a multiple of the allocation granularity and
    /// large enough to hold one minimum-size block. Reinitializing discards
    /// the previous heap entirely; any outstanding payload pointer becomes
    /// dangling.
    #[instrument(level = "info", err(Debug, level = Level::ERROR))]
    pub fn init(&mut self, size: usize) -> Result<(), Fault> {
        let handler = self.fault_handler;
        if size == 0 || size % MIN_ALLOC_SIZE != 0 || size < MIN_BLOCK_SIZE || size > MAX_HEAP_SIZE
        {
            return Err(report(handler, Fault::InvalidSize));
        }
        self.log.clear();

        let arena = vec![OVERWRITE_VALUE; size].into_boxed_slice();
        let heap_min = arena.as_ptr() as usize;
        let mut heap = Heap {
            arena,
            stats: HeapStats {
                heap_min,
                heap_max: heap_min + size,
                size,
                ..HeapStats::default()
            },
        };
        let start = BlockMeta::new(size - BLOCK_OVERHEAD, 0, false, AUTO_BLOCK_ORIGIN, &self.checksum);
        heap.write_block(0, &start);
        self.heap = Some(heap);
        debug!(size, "Heap initialized.");
        Ok(())
    }

    /// Allocates `size` bytes and returns a pointer to the payload.
    ///
    /// `origin` is an opaque caller identification recorded in the block
    /// metadata and the diagnostic log; pass 0 for "no identifier".
    ///
    /// The payload stays valid until it is freed or the heap is
    /// reinitialized, even if the allocator value itself is moved.
    #[instrument(level = "info", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    pub fn allocate(&mut self, size: usize, origin: u32) -> Result<NonNull<u8>, Fault> {
        self.alloc_impl(size, origin, false)
    }

    /// Allocates `count * size` bytes with the payload's requested bytes
    /// zero-initialized.
    #[instrument(level = "info", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    pub fn allocate_zeroed(&mut self, count: usize, size: usize, origin: u32) -> Result<NonNull<u8>, Fault> {
        let handler = self.fault_handler;
        let Some(total) = count.checked_mul(size) else {
            return Err(report(handler, Fault::OutOfMemory));
        };
        self.alloc_impl(total, origin, true)
    }

    fn alloc_impl(&mut self, size: usize, origin: u32, zero_payload: bool) -> Result<NonNull<u8>, Fault> {
        let handler = self.fault_handler;
        let checksum = &self.checksum;
        let Some(heap) = self.heap.as_mut() else {
            return Err(report(handler, Fault::NotInitialized));
        };
        if origin != 0 {
            self.log.record(origin);
        }
        if size == 0 {
            return Err(report(handler, Fault::ZeroSizeAlloc));
        }

        let payload_off = heap
            .allocate_block(size, origin, checksum)
            .map_err(|fault| report(handler, fault))?;
        if zero_payload {
            heap.arena[payload_off..payload_off + size].fill(0);
        }
        // The pointer is derived from the arena base so that writes anywhere
        // in the handed-out block, including the alignment padding the
        // free-time bounds check inspects, stay within its provenance.
        // SAFETY: `payload_off` is in bounds and the arena is never null.
        Ok(unsafe { NonNull::new_unchecked(heap.arena.as_mut_ptr().add(payload_off)) })
    }

    /// Frees the payload pointed to by `ptr`.
    ///
    /// The owning block is recovered from the payload address and fully
    /// validated before any mutation; adjacent free blocks are coalesced and
    /// the surviving block is stamped with the freeing caller's `origin`.
    #[instrument(level = "info", err(Debug, level = Level::ERROR))]
    pub fn free(&mut self, ptr: *mut u8, origin: u32) -> Result<(), Fault> {
        let handler = self.fault_handler;
        let checksum = &self.checksum;
        let Some(heap) = self.heap.as_mut() else {
            return Err(report(handler, Fault::NotInitialized));
        };
        if origin != 0 {
            self.log.record(origin);
        }
        if ptr.is_null() {
            return Err(report(handler, Fault::NullFree));
        }
        let base = heap.arena.as_ptr() as usize;
        let payload_off = match (ptr as usize).checked_sub(base) {
            Some(offset) if offset <= heap.arena.len() => offset,
            _ => return Err(report(handler, Fault::FreeOutsideHeap)),
        };
        heap.free_block(payload_off, origin, checksum, handler)
            .map_err(|fault| report(handler, fault))
    }

    /// Returns the origin id recorded when the block holding `ptr` was
    /// allocated.
    ///
    /// Unlike [`free`](RawSentry::free), validation failures here are
    /// returned without being reported through the fault sink; the lookup is
    /// purely diagnostic.
    #[cfg(feature = "extended-header")]
    pub fn allocation_origin(&self, ptr: *const u8) -> Result<u32, Fault> {
        let Some(heap) = self.heap.as_ref() else {
            return Err(Fault::NotInitialized);
        };
        if ptr.is_null() {
            return Err(Fault::NullFree);
        }
        let base = heap.arena.as_ptr() as usize;
        let payload_off = match (ptr as usize).checked_sub(base) {
            Some(offset) if offset <= heap.arena.len() => offset,
            _ => return Err(Fault::FreeOutsideHeap),
        };
        let Some(header_off) = block::header_offset(payload_off) else {
            return Err(Fault::FreeInvalidHeader);
        };
        let Some(header) = heap.read_meta(header_off) else {
            return Err(Fault::FreeInvalidHeader);
        };
        if !header.crc_valid(&self.checksum) {
            return Err(Fault::FreeInvalidHeader);
        }
        match heap.read_meta(block::boundary_offset(header_off, header.size())) {
            Some(boundary) if boundary.crc_valid(&self.checksum) && boundary.crc == header.crc => {
                Ok(header.origin)
            }
            _ => Err(Fault::FreeInvalidBoundary),
        }
    }

    /// Total heap size in bytes; 0 before initialization.
    pub fn heap_size(&self) -> usize {
        self.heap.as_ref().map_or(0, |heap| heap.stats.size)
    }

    /// User-requested bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.heap.as_ref().map_or(0, |heap| heap.stats.user_bytes_allocated)
    }

    /// Granularity-aligned bytes currently allocated.
    pub fn allocated_bytes_aligned(&self) -> usize {
        self.heap
            .as_ref()
            .map_or(0, |heap| heap.stats.user_bytes_allocated_aligned)
    }

    /// Snapshot of the aggregate heap statistics; zeroed before
    /// initialization.
    pub fn statistics(&self) -> HeapStats {
        self.heap.as_ref().map_or_else(HeapStats::default, |heap| heap.stats)
    }

    /// Up to `max` of the most recently recorded caller ids, most recent
    /// first.
    pub fn latest_caller_ids(&self, max: usize) -> Vec<u32> {
        self.log.latest(max)
    }
}

/// The owned arena plus its statistics. All offsets are relative to the
/// arena start.
struct Heap {
    arena: Box<[u8]>,
    stats: HeapStats,
}

impl Heap {
    /// Decodes the metadata record at `offset`, or `None` if the record does
    /// not lie fully within the arena.
    fn read_meta(&self, offset: usize) -> Option<BlockMeta> {
        let end = offset.checked_add(META_SIZE)?;
        let bytes: &[u8; META_SIZE] = self.arena.get(offset..end)?.try_into().ok()?;
        Some(BlockMeta::decode(bytes))
    }

    fn write_meta(&mut self, offset: usize, meta: &BlockMeta) {
        self.arena[offset..offset + META_SIZE].copy_from_slice(&meta.encode());
    }

    /// Writes `meta` as both the header at `offset` and the matching
    /// boundary tag.
    fn write_block(&mut self, offset: usize, meta: &BlockMeta) {
        self.write_meta(offset, meta);
        self.write_meta(block::boundary_offset(offset, meta.size()), meta);
    }

    /// Fills a consumed metadata record with the sentinel value.
    fn clear_meta(&mut self, offset: usize) {
        self.arena[offset..offset + META_SIZE].fill(OVERWRITE_VALUE);
    }

    /// Whether a complete minimum-size block starting at `offset` would lie
    /// within the arena. This is the boundary condition for both the scan
    /// and next-neighbor coalescing.
    fn block_fits(&self, offset: usize) -> bool {
        offset
            .checked_add(MIN_BLOCK_SIZE)
            .is_some_and(|end| end <= self.arena.len())
    }

    /// Three-way integrity check: header checksum, boundary checksum, and
    /// agreement between the two copies.
    fn block_valid<C: Checksum>(&self, offset: usize, checksum: &C) -> bool {
        let Some(header) = self.read_meta(offset) else {
            return false;
        };
        let Some(boundary) = self.read_meta(block::boundary_offset(offset, header.size())) else {
            return false;
        };
        header.crc_valid(checksum) && boundary.crc_valid(checksum) && header.crc == boundary.crc
    }

    /// First-fit scan for a free block of at least `size` bytes, walking
    /// from the heap start. Every visited block is validated before its
    /// metadata is used to continue.
    fn find_free_block<C: Checksum>(&self, size: usize, checksum: &C) -> Result<usize, Fault> {
        let mut offset = 0;
        while self.block_fits(offset) {
            if !self.block_valid(offset, checksum) {
                return Err(Fault::InvalidBlock);
            }
            let Some(meta) = self.read_meta(offset) else {
                return Err(Fault::InvalidBlock);
            };
            if !meta.is_allocated && meta.size() >= size {
                debug!(offset, block_size = meta.size(), "Found free block.");
                return Ok(offset);
            }
            offset = block::next_offset(offset, meta.size());
        }
        Err(Fault::OutOfMemory)
    }

    /// Carves an allocation of `size` bytes out of the first fitting free
    /// block and returns the payload offset.
    fn allocate_block<C: Checksum>(&mut self, size: usize, origin: u32, checksum: &C) -> Result<usize, Fault> {
        let Some(mut size_aligned) = checked_align(size) else {
            return Err(Fault::OutOfMemory);
        };
        let offset = self.find_free_block(size_aligned, checksum)?;
        let Some(found) = self.read_meta(offset) else {
            return Err(Fault::InvalidBlock);
        };
        let pre_alloc_size = found.size();

        if pre_alloc_size < size_aligned + BLOCK_OVERHEAD + MIN_BLOCK_SIZE {
            // No block of minimum size can be carved out of the remainder;
            // consume all available memory to keep the heap tiling intact.
            size_aligned = pre_alloc_size;
        }

        let allocated = BlockMeta::new(size_aligned, size, true, origin, checksum);
        self.write_block(offset, &allocated);
        self.stats.record_alloc(size_aligned, size, size_aligned + BLOCK_OVERHEAD);

        if size_aligned < pre_alloc_size {
            let remainder_off = block::next_offset(offset, size_aligned);
            let remainder = BlockMeta::new(
                pre_alloc_size - size_aligned - BLOCK_OVERHEAD,
                0,
                false,
                AUTO_BLOCK_ORIGIN,
                checksum,
            );
            self.write_block(remainder_off, &remainder);
            debug!(
                remainder_off,
                remainder_size = remainder.size(),
                "Split remainder into a new free block."
            );
        }

        debug!(offset, size_aligned, "Allocated block.");
        Ok(block::payload_offset(offset))
    }

    /// Validates and frees the block owning the payload at `payload_off`.
    fn free_block<C: Checksum>(
        &mut self,
        payload_off: usize,
        origin: u32,
        checksum: &C,
        handler: Option<FaultHandler>,
    ) -> Result<(), Fault> {
        let Some(header_off) = block::header_offset(payload_off) else {
            return Err(Fault::FreeInvalidHeader);
        };
        let Some(header) = self.read_meta(header_off) else {
            return Err(Fault::FreeInvalidHeader);
        };
        if !header.crc_valid(checksum) {
            return Err(Fault::FreeInvalidHeader);
        }
        let boundary_off = block::boundary_offset(header_off, header.size());
        let Some(boundary) = self.read_meta(boundary_off) else {
            return Err(Fault::FreeInvalidBoundary);
        };
        if !boundary.crc_valid(checksum) || boundary.crc != header.crc {
            return Err(Fault::FreeInvalidBoundary);
        }

        #[cfg(feature = "free-bounds-check")]
        if self.padding_altered(header_off, &header) {
            return Err(Fault::OutOfBoundWrite);
        }

        if !header.is_allocated {
            return Err(Fault::DoubleFree);
        }

        self.stats
            .record_free(header.size(), header.requested_size(), header.size() + BLOCK_OVERHEAD);
        #[cfg(feature = "overwrite-on-free")]
        self.arena[payload_off..payload_off + header.size()].fill(OVERWRITE_VALUE);

        let (start, merged) = self.coalesce(header_off, header.size(), checksum, handler);
        let freed = BlockMeta::new(merged, 0, false, origin, checksum);
        self.write_block(start, &freed);
        debug!(offset = start, size = merged, "Freed block.");
        Ok(())
    }

    /// Merges the freed block at `header_off` with its free and
    /// independently valid neighbors. An invalid free neighbor is reported
    /// and excluded from the merge; the free itself still succeeds.
    ///
    /// Returns the surviving block's header offset and merged size. Consumed
    /// metadata records are overwritten with the sentinel so they read as
    /// payload padding afterwards.
    fn coalesce<C: Checksum>(
        &mut self,
        header_off: usize,
        size: usize,
        checksum: &C,
        handler: Option<FaultHandler>,
    ) -> (usize, usize) {
        let mut start = header_off;
        let mut merged = size;

        let next_off = block::next_offset(header_off, size);
        if self.block_fits(next_off) {
            if let Some(next) = self.read_meta(next_off) {
                if !next.is_allocated {
                    if self.block_valid(next_off, checksum) {
                        merged += next.size() + BLOCK_OVERHEAD;
                        self.clear_meta(next_off);
                        self.clear_meta(block::boundary_offset(header_off, size));
                        debug!(next_off, "Merged with the next free block.");
                    } else {
                        report(handler, Fault::CoalesceNextInvalid);
                    }
                }
            }
        }

        if header_off >= MIN_BLOCK_SIZE {
            let prev_boundary_off = header_off - META_SIZE;
            if let Some(prev_boundary) = self.read_meta(prev_boundary_off) {
                if !prev_boundary.is_allocated {
                    match block::prev_offset(header_off, prev_boundary.size()) {
                        Some(prev_off) if self.block_valid(prev_off, checksum) => {
                            merged += prev_boundary.size() + BLOCK_OVERHEAD;
                            self.clear_meta(header_off);
                            self.clear_meta(prev_boundary_off);
                            start = prev_off;
                            debug!(prev_off, "Merged with the previous free block.");
                        }
                        _ => {
                            report(handler, Fault::CoalescePrevInvalid);
                        }
                    }
                }
            }
        }

        (start, merged)
    }

    /// Whether any alignment-padding byte between the requested and the
    /// aligned payload size lost the sentinel value.
    #[cfg(feature = "free-bounds-check")]
    fn padding_altered(&self, header_off: usize, header: &BlockMeta) -> bool {
        let payload = block::payload_offset(header_off);
        let from = payload + header.requested_size();
        let to = payload + header.size();
        self.arena[from..to].iter().any(|&byte| byte != OVERWRITE_VALUE)
    }
}
