//! The [`RawSentry`] and [`SentryMalloc`] allocators.

pub mod raw_sentry;
pub mod sentry_malloc;

pub use raw_sentry::RawSentry;
pub use sentry_malloc::SentryMalloc;
