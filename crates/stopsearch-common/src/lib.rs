//! Shared building blocks for the stop-and-search pipeline
//!
//! Holds the pieces every other crate needs: the common error type, logging
//! initialization, and the fixed set of upstream police force identifiers.

pub mod error;
pub mod forces;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, StopSearchError};
