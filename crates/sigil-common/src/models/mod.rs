//! Domain models shared across all Sigil crates.
//!
//! These are the types the stores persist and the replication wire carries.

pub mod association;
pub mod invite;

pub use association::*;
pub use invite::*;
