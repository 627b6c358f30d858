//! A multithreaded self-checking allocator.

use crate::allocators::RawSentry;
use crate::checksum::{Checksum, Crc16};
use crate::error::{report, Fault, FaultHandler};
use crate::stats::HeapStats;

use core::ptr::NonNull;
use core::time::Duration;

use parking_lot::{Mutex, MutexGuard};

/// Default bounded wait for acquiring the heap mutex.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// A multithreaded self-checking allocator.
///
/// This allocator serializes every heap operation of an inner [`RawSentry`]
/// behind a mutex. Acquisition waits at most the configured timeout; on
/// expiry the operation fails with [`Fault::MutexAcquireFailed`] without
/// touching the heap, so a blocked caller never mutates shared state.
///
/// Construction is `const`, so the allocator can live in a `static`:
///
/// ```
/// use sentry_malloc::SentryMalloc;
///
/// static ALLOCATOR: SentryMalloc = SentryMalloc::new();
///
/// ALLOCATOR.init(1024).unwrap();
/// let p = ALLOCATOR.allocate(64, 1).unwrap();
/// ALLOCATOR.free(p.as_ptr(), 2).unwrap();
/// ```
///
/// `init` must complete before concurrent callers start using the heap; the
/// allocator does not arbitrate initialization races. Re-entrant use from a
/// fault or interrupt handler while the mutex is held is not supported and
/// must be avoided by the caller.
pub struct SentryMalloc<C: Checksum = Crc16> {
    inner: Mutex<RawSentry<C>>,
    acquire_timeout: Duration,
    // Kept alongside the inner copy so acquisition failures can be reported
    // without holding the lock.
    fault_handler: Option<FaultHandler>,
}

impl SentryMalloc<Crc16> {
    /// Creates an uninitialized allocator with the default CRC-16 checksum.
    pub const fn new() -> Self {
        Self::with_checksum(Crc16)
    }
}

impl Default for SentryMalloc<Crc16> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Checksum> SentryMalloc<C> {
    /// Creates an uninitialized allocator with the provided checksum
    /// implementation.
    pub const fn with_checksum(checksum: C) -> Self {
        SentryMalloc {
            inner: Mutex::new(RawSentry::with_checksum(checksum)),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            fault_handler: None,
        }
    }

    /// Replaces the bounded wait used when acquiring the heap mutex.
    pub fn set_acquire_timeout(&mut self, timeout: Duration) {
        self.acquire_timeout = timeout;
    }

    /// Installs a callback invoked synchronously for every reported fault.
    pub fn set_fault_handler(&mut self, handler: FaultHandler) {
        self.fault_handler = Some(handler);
        self.inner.get_mut().set_fault_handler(handler);
    }

    fn lock(&self) -> Result<MutexGuard<'_, RawSentry<C>>, Fault> {
        self.inner
            .try_lock_for(self.acquire_timeout)
            .ok_or_else(|| report(self.fault_handler, Fault::MutexAcquireFailed))
    }

    /// Establishes the heap; see [`RawSentry::init`].
    ///
    /// Must complete before any concurrent task calls
    /// [`allocate`](SentryMalloc::allocate) or [`free`](SentryMalloc::free).
    pub fn init(&self, size: usize) -> Result<(), Fault> {
        self.lock()?.init(size)
    }

    /// Allocates `size` bytes; see [`RawSentry::allocate`].
    pub fn allocate(&self, size: usize, origin: u32) -> Result<NonNull<u8>, Fault> {
        self.lock()?.allocate(size, origin)
    }

    /// Allocates zero-initialized memory; see [`RawSentry::allocate_zeroed`].
    pub fn allocate_zeroed(&self, count: usize, size: usize, origin: u32) -> Result<NonNull<u8>, Fault> {
        self.lock()?.allocate_zeroed(count, size, origin)
    }

    /// Frees a payload pointer; see [`RawSentry::free`].
    pub fn free(&self, ptr: *mut u8, origin: u32) -> Result<(), Fault> {
        self.lock()?.free(ptr, origin)
    }

    /// Returns the origin recorded for an allocation; see
    /// [`RawSentry::allocation_origin`].
    #[cfg(feature = "extended-header")]
    pub fn allocation_origin(&self, ptr: *const u8) -> Result<u32, Fault> {
        self.lock()?.allocation_origin(ptr)
    }

    /// Total heap size in bytes; 0 before initialization or if the lock
    /// cannot be acquired within the bounded wait.
    pub fn heap_size(&self) -> usize {
        self.lock().map_or(0, |sentry| sentry.heap_size())
    }

    /// User-requested bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.lock().map_or(0, |sentry| sentry.allocated_bytes())
    }

    /// Granularity-aligned bytes currently allocated.
    pub fn allocated_bytes_aligned(&self) -> usize {
        self.lock().map_or(0, |sentry| sentry.allocated_bytes_aligned())
    }

    /// Snapshot of the aggregate heap statistics.
    pub fn statistics(&self) -> HeapStats {
        self.lock()
            .map_or_else(|_| HeapStats::default(), |sentry| sentry.statistics())
    }

    /// Up to `max` of the most recently recorded caller ids, most recent
    /// first.
    pub fn latest_caller_ids(&self, max: usize) -> Vec<u32> {
        self.lock()
            .map_or_else(|_| Vec::new(), |sentry| sentry.latest_caller_ids(max))
    }
}
