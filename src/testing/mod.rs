//! Testing utilities and mock implementations
//!
//! [`MockTransport`] stands in for a broker session so connection lifecycle,
//! pipeline timing and send behavior can be exercised without a network.

pub mod mocks;

pub use mocks::*;
