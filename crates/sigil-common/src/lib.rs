//! # sigil-common
//!
//! Shared types, configuration, error handling, and identifier utilities used
//! across all Sigil crates. No storage or network logic lives here.

pub mod config;
pub mod duration;
pub mod error;
pub mod models;
pub mod redact;
pub mod validation;

pub use error::{SigilError, SigilResult};
pub use models::{
    Association, BindingAttestation, Change, InviteToken, Medium, NewAssociation, NewTombstone,
    Tombstone, UnbindingAttestation,
};
