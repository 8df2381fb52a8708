//! Wake-ups from the binder to the replication pushers.
//!
//! Each pusher subscribes once and gets its own [`Notify`]. `notify_one`
//! stores a permit when the pusher is busy, so a signal raised mid-push is
//! picked up as soon as it goes idle.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct ReplicationSignal {
    subscribers: Arc<Mutex<Vec<Arc<Notify>>>>,
}

impl ReplicationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notify.clone());
        notify
    }

    /// Wake every subscribed pusher.
    pub fn notify(&self) {
        for subscriber in self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).iter() {
            subscriber.notify_one();
        }
    }
}
