//! Event fan-out to subscribers.
//!
//! [`EventHub::publish`] never suspends and never runs subscriber code on
//! the publisher's stack: each subscriber owns an [`ActionChannel`] and a
//! delivery task on the scheduler, so a slow or panicking subscriber cannot
//! delay or break delivery to the others, and every subscriber observes
//! events in publication order.
//!
//! [`ActionChannel`]: crate::channel

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::channel::{ActionSender, action_channel};
use crate::event::Event;
use crate::scheduler::{Scheduler, panic_message};

/// Shared event filter.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Stream of events returned by [`EventHub::subscribe_stream`].
pub type EventStream = UnboundedReceiverStream<Event>;

/// Broadcasts events to subscribers and one-shot waiters.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    scheduler: Scheduler,
    // Held for the whole of `publish`, which serializes publishers and keeps
    // the relative order of any two events identical for every subscriber.
    subscribers: Mutex<Vec<Subscriber>>,
    waiters: Mutex<Vec<Waiter>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

struct Subscriber {
    id: u64,
    predicate: EventPredicate,
    sink: ActionSender<Event>,
}

struct Waiter {
    predicate: EventPredicate,
    reply: oneshot::Sender<Event>,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscriber_count())
            .field("published", &self.published())
            .finish()
    }
}

impl EventHub {
    /// Create a hub whose delivery tasks run on `scheduler`.
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            inner: Arc::new(HubInner {
                scheduler,
                subscribers: Mutex::new(Vec::new()),
                waiters: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Broadcast `event`.
    ///
    /// Waiters whose predicate matches are resolved first (and removed), then
    /// the event is queued for every matching subscriber.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.inner.subscribers.lock();
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            event_type = %event.event_type,
            correlation_id = event.correlation_id.as_deref().unwrap_or(""),
            "event published"
        );

        {
            let mut waiters = self.inner.waiters.lock();
            let pending = std::mem::take(&mut *waiters);
            for waiter in pending {
                if waiter.reply.is_closed() {
                    continue;
                }
                if matches(&waiter.predicate, &event) {
                    let _ = waiter.reply.send(event.clone());
                } else {
                    waiters.push(waiter);
                }
            }
        }

        // Subscribers whose receiving side is gone are pruned here.
        subscribers.retain(|sub| {
            if !matches(&sub.predicate, &event) {
                return !sub.sink.is_closed();
            }
            sub.sink.send(event.clone()).is_ok()
        });
    }

    /// Invoke `callback` for every event satisfying `predicate`, in order.
    ///
    /// A panic inside `callback` is caught and logged; delivery continues
    /// with the next event. The subscription stays active until
    /// [`Subscription::unsubscribe`] is called.
    pub fn subscribe<P, F>(&self, predicate: P, callback: F) -> Subscription
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let (sink, mut rx) = action_channel::<Event>();
        let id = self.register(Arc::new(predicate), sink);
        let active = Arc::new(AtomicBool::new(true));

        let live = Arc::clone(&active);
        self.inner.scheduler.spawn(async move {
            while let Some(event) = rx.recv().await {
                if !live.load(Ordering::Acquire) {
                    break;
                }
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                    tracing::warn!(
                        subscriber = id,
                        event_type = %event.event_type,
                        panic = %panic_message(panic.as_ref()),
                        "subscriber panicked; continuing delivery"
                    );
                }
            }
            tracing::trace!(subscriber = id, "delivery loop finished");
        });

        Subscription {
            id,
            active,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Receive matching events as a `Stream`. Dropping the stream unsubscribes.
    pub fn subscribe_stream<P>(&self, predicate: P) -> EventStream
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (sink, rx) = action_channel::<Event>();
        self.register(Arc::new(predicate), sink);
        rx.into_stream()
    }

    /// Register a one-shot waiter resolved by the next matching event.
    pub(crate) fn wait_for(&self, predicate: EventPredicate) -> oneshot::Receiver<Event> {
        let (reply, rx) = oneshot::channel();
        self.inner.waiters.lock().push(Waiter { predicate, reply });
        rx
    }

    /// Number of registered subscribers (callbacks and streams).
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Number of events published so far.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    fn register(&self, predicate: EventPredicate, sink: ActionSender<Event>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push(Subscriber {
            id,
            predicate,
            sink,
        });
        id
    }
}

fn matches(predicate: &EventPredicate, event: &Event) -> bool {
    match catch_unwind(AssertUnwindSafe(|| predicate(event))) {
        Ok(hit) => hit,
        Err(panic) => {
            tracing::warn!(
                event_type = %event.event_type,
                panic = %panic_message(panic.as_ref()),
                "event predicate panicked; treating as no match"
            );
            false
        }
    }
}

/// Handle returned by [`EventHub::subscribe`].
///
/// Dropping the handle does **not** unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Subscriber id, as it appears in log fields.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `false` after [`unsubscribe`](Subscription::unsubscribe).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. Events already queued for this subscriber are dropped.
    pub fn unsubscribe(self) {
        self.active.store(false, Ordering::Release);
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers.lock().retain(|sub| sub.id != self.id);
        }
        tracing::trace!(subscriber = self.id, "unsubscribed");
    }
}
