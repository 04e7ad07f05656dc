//! Networking

mod transport;

// Re-export.
pub use transport::*;
