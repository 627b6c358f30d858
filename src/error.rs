//! The [`Fault`] taxonomy and the assertion sink plumbing.

use thiserror::Error;
use tracing::error;

/// Failure kinds detected by the allocator.
///
/// Every fault is reported synchronously through the configured
/// [`FaultHandler`] before the failing call returns. There are no retries;
/// the caller decides what to do with a failed allocation or free.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Fault {
    /// Heap initialization was requested with an unusable size.
    #[error("heap init failed due to an invalid size")]
    InvalidSize,
    /// The allocator was used before `init`.
    #[error("the allocator must not be used before initialization")]
    NotInitialized,
    /// An allocation of zero bytes was requested.
    #[error("cannot allocate a size of 0, is this call intentional?")]
    ZeroSizeAlloc,
    /// No free block large enough was found before the heap boundary.
    #[error("no memory available")]
    OutOfMemory,
    /// A block visited during the free-block scan failed validation.
    #[error("found an invalid block, it may have been altered")]
    InvalidBlock,
    /// `free` was called with a null pointer.
    #[error("free operation is not valid for a null pointer")]
    NullFree,
    /// `free` was called with a pointer outside the heap region.
    #[error("cannot free a pointer outside of the heap")]
    FreeOutsideHeap,
    /// The header checksum of the block being freed is invalid.
    #[error("free aborted as the block header is not valid")]
    FreeInvalidHeader,
    /// The boundary tag of the block being freed is invalid while its header
    /// is valid, a likely symptom of an out-of-bound write.
    #[error("free aborted as the block boundary is not valid, it may have been altered")]
    FreeInvalidBoundary,
    /// The alignment padding no longer holds the sentinel value.
    #[error("out of bound write detected, free operation aborted")]
    OutOfBoundWrite,
    /// The block being freed is already marked free.
    #[error("double free detected")]
    DoubleFree,
    /// The next block is free but failed validation; it is excluded from the
    /// merge. Reported through the sink, never returned as an error.
    #[error("cannot coalesce with the next block as it is not valid")]
    CoalesceNextInvalid,
    /// The previous block is free but failed validation; it is excluded from
    /// the merge. Reported through the sink, never returned as an error.
    #[error("cannot coalesce with the previous block as it is not valid")]
    CoalescePrevInvalid,
    /// Reserved for ports whose lock primitive can fail to be created.
    #[error("mutex creation failed")]
    MutexCreateFailed,
    /// The heap mutex could not be acquired within the bounded wait.
    #[error("could not acquire the heap mutex")]
    MutexAcquireFailed,
    /// Reserved for ports whose lock primitive can fail to be released.
    #[error("could not release the heap mutex")]
    MutexReleaseFailed,
}

/// Callback sink invoked synchronously for every reported fault.
///
/// The message is the human-readable description of the fault kind.
pub type FaultHandler = fn(fault: Fault, message: &str);

/// Logs `fault` and forwards it to `handler` if one is configured.
///
/// Returns the fault so failure paths can `return Err(report(..))`.
pub(crate) fn report(handler: Option<FaultHandler>, fault: Fault) -> Fault {
    error!(kind = ?fault, "{}", fault);
    if let Some(handler) = handler {
        handler(fault, &fault.to_string());
    }
    fault
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    static SEEN: Mutex<Vec<Fault>> = Mutex::new(Vec::new());

    fn capture(fault: Fault, _message: &str) {
        SEEN.lock().push(fault);
    }

    #[test]
    fn test_report_forwards_to_handler() {
        SEEN.lock().clear();
        let returned = report(Some(capture), Fault::DoubleFree);
        assert_eq!(returned, Fault::DoubleFree);
        assert_eq!(*SEEN.lock(), vec![Fault::DoubleFree]);
    }

    #[test]
    fn test_report_without_handler() {
        assert_eq!(report(None, Fault::OutOfMemory), Fault::OutOfMemory);
    }

    #[test]
    fn test_messages_are_specific() {
        assert_ne!(Fault::DoubleFree.to_string(), Fault::NullFree.to_string());
        assert!(Fault::OutOfBoundWrite.to_string().contains("out of bound"));
    }
}
