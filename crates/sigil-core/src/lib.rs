//! # sigil-core
//!
//! The binding workflow and everything it sets in motion:
//! - [`binder::ThreepidBinder`]: bind and unbind, signing and persisting records
//! - [`invites::InviteDelivery`]: background onBind delivery of pending invites
//! - [`pusher::ReplicationPusher`]: one loop per peer shipping the change log
//! - [`receiver::ReplicationReceiver`]: applying batches pushed to us by peers

pub mod binder;
pub mod invites;
pub mod pusher;
pub mod receiver;
pub mod signal;

#[cfg(test)]
pub(crate) mod testing;

pub use binder::{BinderSettings, ThreepidBinder, UnbindOutcome};
pub use invites::{InviteDelivery, RetryReport};
pub use pusher::{Backoff, PushOutcome, PusherSettings, ReplicationPusher};
pub use receiver::ReplicationReceiver;
pub use signal::ReplicationSignal;
