//! Ordered in-process delivery of actions, commands and events.
//!
//! An action channel is an unbounded FIFO: sending never suspends, so a
//! synchronous step can enqueue work without yielding to the scheduler, and
//! the receiver observes items in exactly the order they were sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Returned by [`ActionSender::send`] when the receiving side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("action channel closed")]
pub struct ChannelClosed;

/// Counters shared by both ends of a channel.
#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
}

/// Point-in-time delivery statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Items accepted by `send`.
    pub sent: u64,
    /// Items handed out by `recv`.
    pub delivered: u64,
}

impl ChannelStats {
    /// Items sent but not yet received.
    pub fn pending(&self) -> u64 {
        self.sent.saturating_sub(self.delivered)
    }
}

/// Create a new action channel.
pub fn action_channel<T>() -> (ActionSender<T>, ActionReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let counters = Arc::new(Counters::default());
    (
        ActionSender {
            tx,
            counters: Arc::clone(&counters),
        },
        ActionReceiver { rx, counters },
    )
}

/// Sending half. Cloneable; ordering holds per sender and across clones
/// for sends that happen-before one another.
#[derive(Debug)]
pub struct ActionSender<T> {
    tx: mpsc::UnboundedSender<T>,
    counters: Arc<Counters>,
}

impl<T> Clone for ActionSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<T> ActionSender<T> {
    /// Enqueue an item without suspending.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelClosed`] if the receiver was dropped or closed; the
    /// item is discarded.
    pub fn send(&self, item: T) -> Result<(), ChannelClosed> {
        self.tx.send(item).map_err(|_| ChannelClosed)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `true` once the receiver is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Delivery statistics.
    pub fn stats(&self) -> ChannelStats {
        load(&self.counters)
    }
}

/// Receiving half.
#[derive(Debug)]
pub struct ActionReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    counters: Arc<Counters>,
}

impl<T> ActionReceiver<T> {
    /// Wait for the next item. `None` once every sender is dropped and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Take the next item if one is queued.
    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.rx.try_recv().ok()?;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Stop accepting new items. Already queued items can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Delivery statistics.
    pub fn stats(&self) -> ChannelStats {
        load(&self.counters)
    }

    /// Convert into a `Stream`. Items taken through the stream are not
    /// counted as delivered.
    pub fn into_stream(self) -> UnboundedReceiverStream<T> {
        UnboundedReceiverStream::new(self.rx)
    }
}

fn load(counters: &Counters) -> ChannelStats {
    ChannelStats {
        sent: counters.sent.load(Ordering::Relaxed),
        delivered: counters.delivered.load(Ordering::Relaxed),
    }
}
