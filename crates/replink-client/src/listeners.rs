//! Broadcast listener registry.
//!
//! Handlers are stored in a copy-on-write list: registration and removal swap
//! in a new `Arc<Vec<..>>`, while notification clones the current snapshot and
//! iterates it without holding the lock. A handler may therefore register or
//! unregister listeners (including itself) from inside a callback.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use replink_protocol::Message;
use tokio::sync::mpsc;
use tracing::{error, trace};

type Handler = Arc<dyn Fn(&Message) + Send + Sync>;

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Arc<Vec<(u64, Handler)>>,
}

/// Set of handlers notified of every inbound frame.
#[derive(Default)]
pub struct Listeners {
    registry: Mutex<Registry>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `handler`; it stays registered until the returned
    /// [`Subscription`] is dropped.
    pub fn add<F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;

        let mut handlers = registry.handlers.as_ref().clone();
        handlers.push((id, Arc::new(handler)));
        registry.handlers = Arc::new(handlers);

        trace!(listener_id = id, "Listener registered");
        Subscription {
            listeners: Arc::downgrade(self),
            id,
        }
    }

    /// Registers a channel-backed listener.
    pub fn subscribe(self: &Arc<Self>) -> MessageReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.add(move |message| {
            let _ = tx.send(message.clone());
        });
        MessageReceiver {
            rx,
            _subscription: subscription,
        }
    }

    fn remove(&self, id: u64) {
        let mut registry = self.lock();
        if registry.handlers.iter().any(|(hid, _)| *hid == id) {
            let handlers: Vec<_> = registry
                .handlers
                .iter()
                .filter(|(hid, _)| *hid != id)
                .cloned()
                .collect();
            registry.handlers = Arc::new(handlers);
            trace!(listener_id = id, "Listener removed");
        }
    }

    /// Delivers `message` to every handler registered at the time of the call.
    ///
    /// A panicking handler is logged and skipped; the remaining handlers still
    /// run and the caller (the connection's reader) keeps going.
    pub fn notify(&self, message: &Message) {
        let snapshot = Arc::clone(&self.lock().handlers);
        for (id, handler) in snapshot.iter() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
                error!(
                    listener_id = *id,
                    panic = panic_message(payload.as_ref()),
                    "Listener panicked"
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.len())
            .finish()
    }
}

/// Registration token. Dropping it removes the handler.
#[must_use = "dropping a Subscription unregisters the listener immediately"]
#[derive(Debug)]
pub struct Subscription {
    listeners: Weak<Listeners>,
    id: u64,
}

impl Subscription {
    /// Removes the handler now.
    pub fn unsubscribe(self) {}

    /// Keeps the handler registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.listeners = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

/// Channel end of [`Listeners::subscribe`]. Unregisters on drop.
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::UnboundedReceiver<Message>,
    _subscription: Subscription,
}

impl MessageReceiver {
    /// Waits for the next broadcast frame.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(listeners: &Arc<Listeners>) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let sub = listeners.add(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, sub)
    }

    #[test]
    fn test_notify_reaches_every_listener() {
        let listeners = Arc::new(Listeners::new());
        let (a, _sa) = counter(&listeners);
        let (b, _sb) = counter(&listeners);

        listeners.notify(&Message::new().with("out", "hi"));

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let listeners = Arc::new(Listeners::new());
        let _bad = listeners.add(|message| {
            if message.out().is_some() {
                panic!("listener failure");
            }
        });
        let (count, _sub) = counter(&listeners);

        listeners.notify(&Message::new().with("out", "printed"));
        listeners.notify(&Message::new().with("value", "1"));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(listeners.len(), 2);
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let listeners = Arc::new(Listeners::new());
        let (count, sub) = counter(&listeners);
        assert_eq!(listeners.len(), 1);

        sub.unsubscribe();
        listeners.notify(&Message::new());

        assert!(listeners.is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_detached_subscription_stays_registered() {
        let listeners = Arc::new(Listeners::new());
        let (count, sub) = counter(&listeners);

        sub.detach();
        listeners.notify(&Message::new());

        assert_eq!(listeners.len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_can_register_during_notify() {
        let listeners = Arc::new(Listeners::new());
        let registry = Arc::clone(&listeners);
        let _sub = listeners.add(move |_| {
            registry.add(|_| {}).detach();
        });

        // the new listener is not part of the snapshot being iterated
        listeners.notify(&Message::new());
        assert_eq!(listeners.len(), 2);
    }

    #[tokio::test]
    async fn test_subscribe_receives_messages() {
        let listeners = Arc::new(Listeners::new());
        let mut rx = listeners.subscribe();

        listeners.notify(&Message::new().with("value", "1"));

        let message = rx.recv().await.unwrap();
        assert_eq!(message.value(), Some("1"));
        drop(rx);
        assert!(listeners.is_empty());
    }
}
