//! Room membership module
//!
//! Tracks which connections are in which room and fans text frames out to
//! them.

mod member;
mod registry;

pub use member::*;
pub use registry::*;
