//! Credential verification module
//!
//! Checks the bearer tokens presented on the upgrade request and resolves
//! them to a user identity.

mod token;

pub use token::*;

#[cfg(test)]
pub(crate) use token::testing;
