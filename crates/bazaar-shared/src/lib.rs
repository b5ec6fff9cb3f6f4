//! # Bazaar Shared
//!
//! Wire types returned by the HTTP layer.

pub mod response;

pub use response::{ApiResponse, ErrorResponse};
