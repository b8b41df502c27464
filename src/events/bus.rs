//! Publish/subscribe bus.
//!
//! `emit` only enqueues; a dedicated dispatcher task invokes handlers, so the
//! emitting state transition never waits on an observer.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc, oneshot};

use super::types::{CrisisNotification, EventKind, EventPayload};
use crate::clock::Clock;

/// Capacity of the broadcast fan-out. Slow receivers see `Lagged`.
const BROADCAST_CAPACITY: usize = 1024;

/// Callback invoked for a subscribed event kind.
pub type EventHandler = Arc<dyn Fn(&CrisisNotification) + Send + Sync>;

/// Returned by [`EventBus::on`]; pass to [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    kind: EventKind,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

type HandlerTable = Arc<RwLock<HashMap<EventKind, Vec<(u64, EventHandler)>>>>;

enum Dispatch {
    Event(CrisisNotification),
    Flush(oneshot::Sender<()>),
}

/// Typed publish/subscribe channel between the orchestrator and observers.
///
/// Must be created inside a Tokio runtime; the dispatcher task lives until
/// the bus is dropped.
pub struct EventBus {
    handlers: HandlerTable,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<Dispatch>,
    fanout: broadcast::Sender<CrisisNotification>,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let handlers: HandlerTable = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let (fanout, _) = broadcast::channel(BROADCAST_CAPACITY);

        tokio::spawn(dispatch_loop(rx, Arc::clone(&handlers)));

        Self {
            handlers,
            next_id: AtomicU64::new(1),
            tx,
            fanout,
            clock,
        }
    }

    /// Register a handler. Handlers for one kind run in registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&CrisisNotification) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionHandle { id, kind }
    }

    /// Remove a handler. Returns `false` if it was already removed.
    pub fn off(&self, handle: SubscriptionHandle) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = handlers.get_mut(&handle.kind) {
            let len_before = entry.len();
            entry.retain(|(id, _)| *id != handle.id);
            return entry.len() < len_before;
        }
        false
    }

    /// Publish an event. Never blocks.
    pub fn emit(&self, kind: EventKind, payload: EventPayload) {
        let notification = CrisisNotification {
            kind,
            payload,
            emitted_at: self.clock.now(),
        };

        tracing::trace!(event = %kind, "Emitting event");

        // No broadcast receivers is fine.
        let _ = self.fanout.send(notification.clone());
        if self.tx.send(Dispatch::Event(notification)).is_err() {
            tracing::warn!(event = %kind, "Event dispatcher stopped; event dropped");
        }
    }

    /// Receive every notification on a channel instead of a callback.
    pub fn subscribe(&self) -> broadcast::Receiver<CrisisNotification> {
        self.fanout.subscribe()
    }

    /// Wait until every event emitted before this call has been dispatched.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Number of handlers registered for a kind.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>, handlers: HandlerTable) {
    while let Some(message) = rx.recv().await {
        match message {
            Dispatch::Event(notification) => {
                // Snapshot so handlers may call on/off without deadlocking.
                let entries: Vec<EventHandler> = handlers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&notification.kind)
                    .map(|v| v.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default();

                for handler in entries {
                    let result =
                        std::panic::catch_unwind(AssertUnwindSafe(|| handler(&notification)));
                    if result.is_err() {
                        tracing::error!(event = %notification.kind, "Event handler panicked");
                    }
                }
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::clock::SystemClock;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(SystemClock))
    }

    fn initialized() -> EventPayload {
        EventPayload::Initialized {
            gateway: "test".to_string(),
            auto_connect: true,
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let bus = bus();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            bus.on(EventKind::Initialized, move |_| {
                order.lock().unwrap().push(n);
            });
        }

        bus.emit(EventKind::Initialized, initialized());
        bus.flush().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_handlers_only_see_their_kind() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on(EventKind::SessionEnded, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(EventKind::Initialized, initialized());
        bus.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_off_removes_handler() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = bus.on(EventKind::Initialized, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.off(handle));
        assert!(!bus.off(handle));
        assert_eq!(bus.handler_count(EventKind::Initialized), 0);

        bus.emit(EventKind::Initialized, initialized());
        bus.flush().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_others() {
        let bus = bus();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::Initialized, |_| panic!("observer bug"));
        let c = Arc::clone(&count);
        bus.on(EventKind::Initialized, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(EventKind::Initialized, initialized());
        bus.emit(EventKind::Initialized, initialized());
        bus.flush().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_emit_does_not_wait_for_slow_handler() {
        let bus = bus();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        bus.on(EventKind::Initialized, move |_| {
            let _ = release_rx
                .lock()
                .unwrap()
                .recv_timeout(std::time::Duration::from_secs(5));
        });

        // Returns immediately even though the handler is parked.
        bus.emit(EventKind::Initialized, initialized());
        bus.emit(EventKind::Initialized, initialized());

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
        bus.flush().await;
    }

    #[tokio::test]
    async fn test_broadcast_subscription_receives_all_kinds() {
        let bus = bus();
        let mut rx = bus.subscribe();

        bus.emit(EventKind::Initialized, initialized());
        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.kind, EventKind::Initialized);
    }
}
