//! Ports - trait definitions for external dependencies.
//! These are the "interfaces" that infrastructure must implement.

mod bucket_store;
mod rate_limit;

pub use bucket_store::{BucketStore, SaveOutcome, StoreError};
pub use rate_limit::{RateLimiter, Verdict};
