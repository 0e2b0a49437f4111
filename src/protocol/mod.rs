//! Device protocol: identity, message types and topic routing
//!
//! Everything in this module is pure. Nothing here performs I/O.

pub mod identity;
pub mod messages;
pub mod topics;

pub use identity::*;
pub use messages::*;
pub use topics::*;
