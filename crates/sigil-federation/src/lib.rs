//! # sigil-federation
//!
//! Everything Sigil needs to talk to, and trust, other servers.
//!
//! ## Key concepts
//!
//! - **Server keys** (`keys.rs`): this server holds one or more Ed25519 signing
//!   keys identified as `ed25519:<version>`. Public keys are served as a key
//!   document so peers can verify our attestations.
//! - **Key manager** (`key_manager.rs`): persists keys in SQLite, signs with the
//!   current one, verifies with any, and supports rotation.
//! - **Signed JSON** (`signatures.rs`): canonical JSON plus a detached
//!   `signatures.<server>.<key_id>` block, and the `X-Matrix` request
//!   authorization scheme.
//! - **Verifier** (`verifier.rs`): checks that a request signature really comes
//!   from the homeserver owning an account, using cached remote keys.
//! - **Client** (`client.rs`): outbound HTTP, i.e. key fetches, onBind
//!   notifications, and replication pushes.
//! - **Discovery** (`discovery.rs`): resolves a server name via
//!   `/.well-known/matrix/server`, falling back to port 8448.

pub mod client;
pub mod discovery;
pub mod error;
pub mod key_manager;
pub mod keys;
pub mod signatures;
pub mod transport;
pub mod types;
pub mod verifier;

pub use client::FederationClient;
pub use error::FederationError;
pub use key_manager::{DbKeyManager, KeyManager, KeySignature};
pub use keys::ServerKeyPair;
pub use signatures::ClaimedSignature;
pub use transport::{KeyFetcher, NotificationTransport, PeerTransport};
pub use types::{OnBind, ReplicatedRecord, ReplicationAck, ReplicationBatch, ServerKeys};
pub use verifier::{FederationVerifier, RemoteKeyVerifier};
