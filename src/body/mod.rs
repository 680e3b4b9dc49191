//! Request-body buffering under a process-wide memory budget.

pub mod budget;
pub mod reader;

pub use budget::{BodyBudget, Reservation};
pub use reader::{BoxBody, BufferedBodyReader};

/// Bytes to reserve for a request body: the declared content length when
/// known, capped at the per-request maximum.
pub fn body_upper_bound(content_length: Option<u64>, max_body_bytes: u64) -> u64 {
    match content_length {
        Some(len) => len.min(max_body_bytes),
        None => max_body_bytes,
    }
}
