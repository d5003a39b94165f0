//! Shared test utilities for the dataspace crates.
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`strategies`] - Proptest generators for names, labels and payloads

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::TestDir;

pub mod strategies;
