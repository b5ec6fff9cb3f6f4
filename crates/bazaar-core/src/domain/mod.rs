//! Domain entities - bucket state and the token bucket algorithm.

mod bucket;

pub use bucket::{BucketAnomaly, BucketRecord, BucketStep, TokenBucket};
