//! Repository layer. The association and invite-token stores implement the
//! traits in [`crate::store`]; cursors and signing keys are plain functions
//! over the pool.

pub mod associations;
pub mod cursors;
pub mod invite_tokens;
pub mod replicated;
pub mod signing_keys;
