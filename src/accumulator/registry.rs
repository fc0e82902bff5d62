use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::container::ContainerID;
use crate::trace::{LiveEvent, TraceEvent};

/// Identifies one registration of a live subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    container_id: ContainerID,
    token: u64,
}

impl SubscriptionHandle {
    pub fn container_id(&self) -> &ContainerID {
        &self.container_id
    }
}

/// Receiving side of a live subscription.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    rx: mpsc::UnboundedReceiver<LiveEvent>,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Waits for the next event. Returns `None` once the registration is gone
    /// and all buffered events were received.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
struct Subscriber {
    token: u64,
    tx: mpsc::UnboundedSender<LiveEvent>,
}

/// Per-container live subscribers.
///
/// Registration, removal, forwarding and overflow broadcast all go through the
/// same lock. Sends never block, so the lock is only held for the duration of
/// a map operation.
#[derive(Debug, Default)]
pub struct Registry {
    next_token: AtomicU64,
    subscribers: Mutex<HashMap<ContainerID, Subscriber>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ContainerID, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber for the container, replacing any previous one.
    pub fn register(&self, container_id: ContainerID) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .lock()
            .insert(container_id.clone(), Subscriber { token, tx })
            .is_some()
        {
            log::warn!("replaced live subscriber of container `{container_id}`");
        }

        Subscription {
            handle: SubscriptionHandle {
                container_id,
                token,
            },
            rx,
        }
    }

    /// Removes the registration identified by `handle`.
    ///
    /// Returns `false` if the registration was already removed or replaced.
    pub fn unregister(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscribers = self.lock();
        match subscribers.get(&handle.container_id) {
            Some(subscriber) if subscriber.token == handle.token => {
                subscribers.remove(&handle.container_id);
                true
            }
            _ => false,
        }
    }

    /// Forwards an event to the subscriber of its container, if any.
    pub fn forward(&self, event: &TraceEvent) -> bool {
        let mut subscribers = self.lock();
        let Some(subscriber) = subscribers.get(&event.container_id) else {
            return false;
        };
        if subscriber
            .tx
            .send(LiveEvent::Event(event.clone()))
            .is_err()
        {
            log::debug!(
                "dropping closed live subscriber of container `{}`",
                event.container_id
            );
            subscribers.remove(&event.container_id);
            return false;
        }
        true
    }

    /// Sends an overflow notice to every subscriber. Returns the number of
    /// subscribers reached.
    pub fn broadcast_overflow(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|_, subscriber| subscriber.tx.send(LiveEvent::Overflow).is_ok());
        subscribers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
