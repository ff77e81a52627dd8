//! Shared fixtures and helpers for the VEIL integration tests.

pub mod fixtures;
pub mod test_helpers;

pub use fixtures::MeshFixture;
pub use test_helpers::{ci_timeout, init_tracing, wait_until};
