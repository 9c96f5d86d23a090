//! One producer side, many independently paced subscribers.
//!
//! Every item pushed after a subscription was created is delivered to it,
//! in push order. Each subscriber has its own bounded output buffer of
//! `capacity` items. When that buffer is full, items pile up in the
//! subscriber's backlog instead of blocking the producer or other
//! subscribers. Backlogs are retried every `repoll_interval` until flushed.
//!
//! The queue never owns a subscriber. Dropping a [Subscription] removes it
//! from the registry.
//!
//! # Close
//!
//! After [BroadcastQueue::close] already admitted items are still replicated.
//! Then, after an optional [close_grace] for backlogged subscribers, every
//! subscriber output is closed and the registry is emptied. Items already in
//! an output buffer stay readable, backlog that did not fit is dropped.
//! From then on [BroadcastQueue::subscribe] returns already closed
//! subscriptions.
//!
//! [close_grace]: crate::BroadcastConfig::close_grace

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use branch_hints::{likely, unlikely};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tracing::{debug, trace, warn};
use crate::config::{BacklogOverflow, BroadcastConfig};
use crate::error::PushError;
use crate::reader::{Iter, Reader, RecvTimeoutError, TryRecvError};

pub struct BroadcastQueue<T> {
    admission: spin::Mutex<Option<Sender<T>>>,
    /// Only for len() - items are received by the delivery thread.
    distribution: Receiver<T>,
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    registry: spin::Mutex<Registry<T>>,
    capacity: usize,
    backlog_limit: Option<usize>,
    overflow: BacklogOverflow,
    /// Disconnected from the start. Handed out after close.
    closed_sentinel: Receiver<T>,
}

struct Registry<T> {
    closed: bool,
    next_id: u64,
    subscribers: HashMap<u64, Subscriber<T>>,
}

impl<T: Clone + Send + 'static> BroadcastQueue<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_config(BroadcastConfig::with_capacity(capacity))
    }

    /// Spawns intake and delivery threads.
    #[must_use]
    pub fn with_config(config: BroadcastConfig) -> Self {
        let (admission_tx, admission_rx) = channel::bounded(0);
        let (distribution_tx, distribution_rx) = channel::bounded(config.capacity);
        let closed_sentinel = channel::bounded(0).1;

        let shared = Arc::new(Shared {
            registry: spin::Mutex::new(Registry {
                closed: false,
                next_id: 0,
                subscribers: HashMap::new(),
            }),
            capacity: config.capacity,
            backlog_limit: config.backlog_limit,
            overflow: config.overflow,
            closed_sentinel,
        });

        thread::spawn(move || {
            for item in admission_rx.iter() {
                if distribution_tx.send(item).is_err() {
                    return;
                }
            }
            trace!("admission closed, broadcast intake finished");
        });

        let delivery = Delivery {
            distribution: distribution_rx.clone(),
            shared: shared.clone(),
            repoll_interval: config.repoll_interval,
            close_grace: config.close_grace,
        };
        thread::spawn(move || delivery.run());

        Self {
            admission: spin::Mutex::new(Some(admission_tx)),
            distribution: distribution_rx,
            shared,
        }
    }
}

impl<T> BroadcastQueue<T> {
    /// Blocks until the intake thread accepts `item`.
    ///
    /// Fails only after [close()](Self::close).
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let admission = self.admission.lock().clone();
        match admission {
            Some(admission) => admission
                .send(item)
                .map_err(|err| PushError(err.into_inner())),
            None => Err(PushError(item)),
        }
    }

    /// Closes admission point. Everything admitted before is still
    /// replicated, then every subscriber is closed and unregistered.
    /// Backlog that did not reach an output buffer within
    /// [close_grace](BroadcastConfig::close_grace) is dropped.
    /// Closing twice does nothing.
    pub fn close(&self) {
        let admission = self.admission.lock().take();
        if admission.is_none() {
            debug!("close() on already closed broadcast queue");
        }
    }

    /// Admission point is closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.admission.lock().is_none()
    }

    /// Never fails. After the queue closed, returns already closed
    /// subscription - see [Subscription::is_closed_sentinel].
    pub fn subscribe(&self) -> Subscription<T> {
        let mut registry = self.shared.registry.lock();
        if unlikely(registry.closed) {
            return Subscription {
                output: self.shared.closed_sentinel.clone(),
                id: None,
                shared: Weak::new(),
            };
        }

        let (output_tx, output_rx) = channel::bounded(self.shared.capacity);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, Subscriber::new(output_tx));
        drop(registry);

        trace!(id, "subscribed");
        Subscription {
            output: output_rx,
            id: Some(id),
            shared: Arc::downgrade(&self.shared),
        }
    }

    #[inline]
    pub fn subscriber_count(&self) -> usize {
        self.shared.registry.lock().subscribers.len()
    }

    /// Items waiting in the internal distribution queue.
    #[inline]
    pub fn len(&self) -> usize {
        self.distribution.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.distribution.is_empty()
    }

    /// Depth of the distribution queue and of every subscriber buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Drop for BroadcastQueue<T> {
    fn drop(&mut self) {
        self.admission.get_mut().take();
    }
}

/// Subscriber output stream. Created by [BroadcastQueue::subscribe].
///
/// Dropping it unsubscribes.
pub struct Subscription<T> {
    output: Receiver<T>,
    /// `None` for closed sentinel.
    id: Option<u64>,
    shared: Weak<Shared<T>>,
}

impl<T> Subscription<T> {
    /// Returned by `subscribe()` after close. Never receives anything.
    #[inline]
    pub fn is_closed_sentinel(&self) -> bool {
        self.id.is_none()
    }

    /// Same as drop.
    #[inline]
    pub fn unsubscribe(self) {}

    /// Items in the output buffer. Does not count the backlog.
    #[inline]
    pub fn len(&self) -> usize {
        self.output.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }
}

impl<T> Reader for Subscription<T> {
    type Item = T;

    #[inline]
    fn recv(&self) -> Option<T> {
        self.output.recv().ok()
    }

    #[inline]
    fn try_recv(&self) -> Result<T, TryRecvError> {
        self.output.try_recv()
    }

    #[inline]
    fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.output.recv_timeout(timeout)
    }
}

impl<'a, T> IntoIterator for &'a Subscription<T> {
    type Item = T;
    type IntoIter = Iter<'a, Subscription<T>>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(id) = self.id else { return };
        let Some(shared) = self.shared.upgrade() else { return };
        // Drop backlog outside the lock.
        let removed = shared.registry.lock().subscribers.remove(&id);
        if removed.is_some() {
            trace!(id, "unsubscribed");
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Flush {
    /// Backlog is empty.
    Drained,
    /// Output buffer is full, backlog is not.
    Pending,
    /// Subscription dropped.
    Disconnected,
}

struct Subscriber<T> {
    output: Sender<T>,
    backlog: VecDeque<T>,
    dropped: u64,
}

impl<T> Subscriber<T> {
    fn new(output: Sender<T>) -> Self {
        Self {
            output,
            backlog: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Moves as much of the backlog into the output buffer as fits.
    fn flush(&mut self) -> Flush {
        while let Some(item) = self.backlog.pop_front() {
            match self.output.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    self.backlog.push_front(item);
                    return Flush::Pending;
                }
                Err(TrySendError::Disconnected(_)) => return Flush::Disconnected,
            }
        }
        Flush::Drained
    }

    /// `item` is `None` for re-poll.
    fn offer(&mut self, item: Option<T>, limit: Option<usize>, overflow: BacklogOverflow) -> Flush {
        let state = self.flush();
        let Some(item) = item else { return state };
        match state {
            Flush::Disconnected => Flush::Disconnected,
            Flush::Drained => match self.output.try_send(item) {
                Ok(()) => Flush::Drained,
                Err(TrySendError::Full(item)) => {
                    self.push_backlog(item, limit, overflow);
                    if self.backlog.is_empty() { Flush::Drained } else { Flush::Pending }
                }
                Err(TrySendError::Disconnected(_)) => Flush::Disconnected,
            },
            Flush::Pending => {
                self.push_backlog(item, limit, overflow);
                Flush::Pending
            }
        }
    }

    fn push_backlog(&mut self, item: T, limit: Option<usize>, overflow: BacklogOverflow) {
        let limit = match limit {
            Some(limit) if unlikely(self.backlog.len() >= limit) => limit,
            _ => {
                self.backlog.push_back(item);
                return;
            }
        };

        if self.dropped == 0 {
            warn!(limit, ?overflow, "subscriber backlog full, dropping items");
        }
        self.dropped += 1;
        // With zero limit the incoming item is also the oldest one.
        if overflow == BacklogOverflow::DropOldest && limit > 0 {
            self.backlog.pop_front();
            self.backlog.push_back(item);
        }
    }
}

struct Delivery<T> {
    distribution: Receiver<T>,
    shared: Arc<Shared<T>>,
    repoll_interval: Duration,
    close_grace: Duration,
}

impl<T: Clone> Delivery<T> {
    fn run(self) {
        let mut backlogged = false;
        loop {
            let item = if likely(!backlogged) {
                match self.distribution.recv() {
                    Ok(item) => Some(item),
                    Err(_) => break,
                }
            } else {
                match self.distribution.recv_timeout(self.repoll_interval) {
                    Ok(item) => Some(item),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };
            backlogged = self.deliver(item);
        }

        // Optional grace period for backlogged subscribers to catch up.
        let deadline = Instant::now() + self.close_grace;
        while backlogged {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.repoll_interval.min(deadline - now));
            backlogged = self.deliver(None);
        }
        self.close_registry();
        trace!("broadcast delivery finished");
    }

    /// Replicates `item` to every subscriber, retries backlogs and prunes
    /// dropped subscriptions. Returns true if some subscriber is still
    /// backlogged.
    fn deliver(&self, item: Option<T>) -> bool {
        let shared = &*self.shared;
        let mut backlogged = false;
        let mut registry = shared.registry.lock();
        registry.subscribers.retain(|&id, subscriber| {
            let item = item.clone();
            match subscriber.offer(item, shared.backlog_limit, shared.overflow) {
                Flush::Drained => true,
                Flush::Pending => {
                    backlogged = true;
                    true
                }
                Flush::Disconnected => {
                    trace!(id, "subscriber unreachable, pruned");
                    false
                }
            }
        });
        backlogged
    }

    /// Marks registry closed, flushes what fits one last time and closes
    /// every subscriber output. Undelivered backlog is dropped.
    fn close_registry(&self) {
        let subscribers = {
            let mut registry = self.shared.registry.lock();
            registry.closed = true;
            for subscriber in registry.subscribers.values_mut() {
                subscriber.flush();
            }
            mem::take(&mut registry.subscribers)
        };

        // Dropping output senders closes the subscriptions.
        let lost: usize = subscribers.values().map(|subscriber| subscriber.backlog.len()).sum();
        if unlikely(lost > 0) {
            warn!(lost, "broadcast closed with undelivered backlog");
        }
        debug!(subscribers = subscribers.len(), "broadcast closed");
    }
}
