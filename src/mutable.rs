//! Queue with live-adjustable capacity.
//!
//! Items pass through three stages:
//! unbuffered admission -> bounded buffer -> unbuffered delivery.
//!
//! Two threads serve each queue. The intake thread receives admitted items,
//! writes them into the active buffer and owns all resize bookkeeping.
//! The delivery thread moves items from the buffer to consumers.
//!
//! # Resize
//!
//! Resize never touches a live buffer. The intake thread creates a new buffer
//! ("generation") with the requested capacity, publishes it to the delivery
//! thread and drops its sender of the old one. The delivery thread drains
//! generations strictly one after another, so nothing is lost, duplicated or
//! reordered. When the retired generation is drained, the delivery thread
//! nudges the intake thread over the control channel, and only then the next
//! resize can start. Requests arriving meanwhile coalesce - the latest wins.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use branch_hints::unlikely;
use crossbeam::channel::{self, Receiver, RecvError, Select, Sender, TrySendError};
use crossbeam::select;
use tracing::{debug, trace};
use crate::config::RESIZE_SLOTS;
use crate::error::{PushError, ResizeError};
use crate::reader::{Reader, RecvTimeoutError, TryRecvError};

/// `Some(capacity)` - caller request.
/// `None` - retired generation drained, re-evaluate pending target.
type Control = Option<usize>;

struct Shared {
    capacity: AtomicUsize,
    /// Admitted, but not yet handed to the delivery point.
    len: AtomicUsize,
}

pub struct MutableQueue<T> {
    admission: spin::Mutex<Option<Sender<T>>>,
    delivery: Receiver<T>,
    control: Sender<Control>,
    shared: Arc<Shared>,
}

impl<T: Send + 'static> MutableQueue<T> {
    /// Spawns intake and delivery threads.
    ///
    /// `capacity` 0 is allowed - the buffer becomes a rendezvous point.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (admission_tx, admission_rx) = channel::bounded(0);
        let (delivery_tx, delivery_rx) = channel::bounded(0);
        let (control_tx, control_rx) = channel::bounded(RESIZE_SLOTS);
        let (generations_tx, generations_rx) = channel::unbounded();
        let (buffer_tx, buffer_rx) = channel::bounded(capacity);

        let shared = Arc::new(Shared {
            capacity: AtomicUsize::new(capacity),
            len: AtomicUsize::new(0),
        });

        let intake = Intake {
            admission: admission_rx,
            control: control_rx,
            buffer: buffer_tx,
            generations: generations_tx,
            shared: shared.clone(),
            capacity,
            target: capacity,
            resizing: false,
        };
        thread::spawn(move || intake.run());

        let delivery = Delivery {
            buffer: buffer_rx,
            generations: generations_rx,
            delivery: delivery_tx,
            control: control_tx.clone(),
            shared: shared.clone(),
        };
        thread::spawn(move || delivery.run());

        Self {
            admission: spin::Mutex::new(Some(admission_tx)),
            delivery: delivery_rx,
            control: control_tx,
            shared,
        }
    }
}

impl<T> MutableQueue<T> {
    /// Blocks until the intake thread accepts `item`.
    ///
    /// Fails only after [close()](Self::close).
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        // Do not hold the lock while blocked on send.
        let admission = self.admission.lock().clone();
        match admission {
            Some(admission) => admission
                .send(item)
                .map_err(|err| PushError(err.into_inner())),
            None => Err(PushError(item)),
        }
    }

    /// Blocks until the next item is delivered.
    ///
    /// Returns `None` once the queue is closed and every buffered item
    /// was delivered.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.delivery.recv().ok()
    }

    /// Closes admission point. Already buffered items are still delivered.
    ///
    /// Pushes that are blocked at the moment of the call still complete.
    /// Closing twice does nothing.
    pub fn close(&self) {
        let admission = self.admission.lock().take();
        if admission.is_none() {
            debug!("close() on already closed queue");
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.admission.lock().is_none()
    }

    /// Requests buffer capacity change. Does not block.
    ///
    /// Takes effect asynchronously - watch [capacity()](Self::capacity).
    /// While a resize is in progress, further requests are queued and
    /// coalesced: only the latest one is applied after the current
    /// transition completes.
    ///
    /// Fails with [ResizeError::Rejected] when [RESIZE_SLOTS] requests are
    /// already waiting for the intake thread.
    pub fn resize(&self, capacity: usize) -> Result<(), ResizeError> {
        if self.is_closed() {
            return Err(ResizeError::Closed);
        }
        match self.control.try_send(Some(capacity)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                trace!(capacity, "resize rejected, control channel full");
                Err(ResizeError::Rejected)
            }
            Err(TrySendError::Disconnected(_)) => Err(ResizeError::Closed),
        }
    }

    /// Capacity of the active buffer generation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity.load(Ordering::Acquire)
    }

    /// Number of admitted, but not yet delivered items. Best effort under
    /// concurrent access.
    ///
    /// This is not the length of the active buffer generation: it also
    /// counts items still in retired generations, the item held by the
    /// intake thread while the buffer is full and the one held by the
    /// delivery thread until a consumer takes it. So it can exceed
    /// [capacity()](Self::capacity), especially right after a shrink.
    #[inline]
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Reader for MutableQueue<T> {
    type Item = T;

    #[inline]
    fn recv(&self) -> Option<T> {
        self.pop()
    }

    #[inline]
    fn try_recv(&self) -> Result<T, TryRecvError> {
        self.delivery.try_recv()
    }

    #[inline]
    fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        self.delivery.recv_timeout(timeout)
    }
}

impl<T> Drop for MutableQueue<T> {
    fn drop(&mut self) {
        // Worker threads wind down on their own.
        self.admission.get_mut().take();
    }
}

/// Other side of a worker channel is gone.
struct Shutdown;

enum Event<T> {
    Item(T),
    Control(Result<Control, RecvError>),
    /// Admission closed.
    Closed,
}

struct Intake<T> {
    admission: Receiver<T>,
    control: Receiver<Control>,
    /// Active generation.
    buffer: Sender<T>,
    generations: Sender<Receiver<T>>,
    shared: Arc<Shared>,
    capacity: usize,
    target: usize,
    resizing: bool,
}

impl<T> Intake<T> {
    fn run(mut self) {
        trace!(capacity = self.capacity, "intake started");
        loop {
            let event = select! {
                recv(self.admission) -> msg => match msg {
                    Ok(item) => Event::Item(item),
                    Err(_) => Event::Closed,
                },
                recv(self.control) -> msg => Event::Control(msg),
            };
            let item = match event {
                Event::Item(item) => item,
                Event::Closed => break,
                Event::Control(control) => {
                    if self.on_control(control).is_err() {
                        return;
                    }
                    continue;
                }
            };
            self.shared.len.fetch_add(1, Ordering::AcqRel);
            if self.store(item).is_err() {
                return;
            }
        }
        // Dropping `buffer` and `generations` lets the delivery thread
        // finish the last generation and stop.
        debug!("admission closed, intake finished");
    }

    /// Writes `item` into the active generation. Keeps serving control
    /// messages while the buffer is full.
    fn store(&mut self, mut item: T) -> Result<(), Shutdown> {
        loop {
            match self.buffer.try_send(item) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(value)) => item = value,
                Err(TrySendError::Disconnected(_)) => return Err(Shutdown),
            }

            let control = {
                let mut sel = Select::new();
                let send_index = sel.send(&self.buffer);
                sel.recv(&self.control);
                let oper = sel.select();
                if oper.index() == send_index {
                    return oper.send(&self.buffer, item).map_err(|_| Shutdown);
                }
                oper.recv(&self.control)
            };
            self.on_control(control)?;
        }
    }

    fn on_control(&mut self, msg: Result<Control, RecvError>) -> Result<(), Shutdown> {
        // Delivery thread holds a control sender for its whole life.
        let msg = msg.map_err(|_| Shutdown)?;
        match msg {
            Some(capacity) => self.target = capacity,
            None => self.resizing = false,
        }
        self.apply_target()
    }

    fn apply_target(&mut self) -> Result<(), Shutdown> {
        if self.target == self.capacity {
            return Ok(());
        }
        if self.resizing {
            trace!(requested = self.target, "resize in progress, request coalesced");
            return Ok(());
        }

        let (buffer_tx, buffer_rx) = channel::bounded(self.target);
        self.generations.send(buffer_rx).map_err(|_| Shutdown)?;
        let retired = mem::replace(&mut self.buffer, buffer_tx);
        drop(retired);

        debug!(from = self.capacity, to = self.target, "buffer generation swapped");
        self.capacity = self.target;
        self.shared.capacity.store(self.target, Ordering::Release);
        self.resizing = true;
        Ok(())
    }
}

struct Delivery<T> {
    /// Generation being drained.
    buffer: Receiver<T>,
    generations: Receiver<Receiver<T>>,
    delivery: Sender<T>,
    control: Sender<Control>,
    shared: Arc<Shared>,
}

impl<T> Delivery<T> {
    fn run(mut self) {
        loop {
            // Ends when intake drops its sender of this generation.
            for item in self.buffer.iter() {
                if unlikely(self.delivery.send(item).is_err()) {
                    trace!("queue dropped, delivery finished");
                    return;
                }
                self.shared.len.fetch_sub(1, Ordering::AcqRel);
            }

            match self.generations.recv() {
                Ok(next) => {
                    self.buffer = next;
                    // Error means intake already finished - nothing to resize.
                    let _ = self.control.send(None);
                }
                Err(_) => break,
            }
        }
        // Dropping `delivery` signals end-of-stream to consumers.
        debug!("all generations drained, delivery finished");
    }
}

#[cfg(test)]
mod test {
    use std::time::Instant;
    use itertools::assert_equal;
    use super::*;

    fn wait_capacity<T>(queue: &MutableQueue<T>, capacity: usize) {
        let due = Instant::now() + Duration::from_secs(1);
        while queue.capacity() != capacity {
            assert!(Instant::now() < due, "expected capacity {capacity}, got {}", queue.capacity());
            thread::yield_now();
        }
    }

    #[test]
    fn fifo() {
        let queue = MutableQueue::new(4);
        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..100 {
                    queue.push(i).unwrap();
                }
                queue.close();
            });
            assert_equal(queue.iter(), 0..100);
        });
    }

    #[test]
    fn rendezvous_capacity() {
        let queue = MutableQueue::new(0);
        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..10 {
                    queue.push(i).unwrap();
                }
                queue.close();
            });
            assert_equal(queue.iter(), 0..10);
        });
    }

    #[test]
    fn push_after_close() {
        let queue = MutableQueue::new(2);
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.push(7), Err(PushError(7)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn close_twice() {
        let queue = MutableQueue::<u32>::new(2);
        queue.close();
        queue.close();
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn resize_after_close() {
        let queue = MutableQueue::<u32>::new(2);
        queue.close();
        assert_eq!(queue.resize(4), Err(ResizeError::Closed));
    }

    #[test]
    fn resize_same_capacity() {
        let queue = MutableQueue::<u32>::new(3);
        queue.resize(3).unwrap();
        queue.resize(6).unwrap();
        wait_capacity(&queue, 6);
    }

    #[test]
    fn resize_to_zero_and_back() {
        let queue = MutableQueue::new(3);
        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..50 {
                    queue.push(i).unwrap();
                    if i == 10 {
                        queue.resize(0).unwrap();
                    }
                    if i == 30 {
                        queue.resize(5).unwrap();
                    }
                }
                queue.close();
            });
            assert_equal(queue.iter(), 0..50);
        });
    }

    #[test]
    fn resize_burst_settles_at_latest_accepted() {
        let queue = MutableQueue::<u32>::new(1);
        let mut last = 1;
        for capacity in 2..64 {
            match queue.resize(capacity) {
                Ok(()) => last = capacity,
                Err(ResizeError::Rejected) => {}
                Err(ResizeError::Closed) => panic!("queue is open"),
            }
        }
        wait_capacity(&queue, last);
    }

    fn wait_len<T>(queue: &MutableQueue<T>, len: usize) {
        let due = Instant::now() + Duration::from_secs(1);
        while queue.len() != len {
            assert!(Instant::now() < due, "expected len {len}, got {}", queue.len());
            thread::yield_now();
        }
    }

    #[test]
    fn resize_rejected_when_control_full() {
        // No intake thread - nothing reads the control channel.
        let (control_tx, _control_rx) = channel::bounded(RESIZE_SLOTS);
        let queue = MutableQueue::<u32> {
            admission: spin::Mutex::new(Some(channel::bounded(0).0)),
            delivery: channel::bounded(0).1,
            control: control_tx,
            shared: Arc::new(Shared {
                capacity: AtomicUsize::new(1),
                len: AtomicUsize::new(0),
            }),
        };

        for capacity in 0..RESIZE_SLOTS {
            assert_eq!(queue.resize(capacity), Ok(()));
        }
        assert_eq!(queue.resize(42), Err(ResizeError::Rejected));

        queue.close();
        assert_eq!(queue.resize(42), Err(ResizeError::Closed));
    }

    #[test]
    fn len_counts_undelivered() {
        let queue = MutableQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        wait_len(&queue, 5);

        assert_eq!(queue.pop(), Some(0));
        wait_len(&queue, 4);
        queue.close();
        assert_equal(queue.iter(), 1..5);
        assert!(queue.is_empty());
    }

    #[test]
    fn try_recv_and_timeout() {
        let queue = MutableQueue::<u32>::new(1);
        assert_eq!(queue.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(
            queue.recv_timeout(Duration::from_millis(10)),
            Err(RecvTimeoutError::Timeout)
        );
        queue.push(1).unwrap();
        assert_eq!(queue.recv_timeout(Duration::from_secs(1)), Ok(1));
        queue.close();
        assert_eq!(
            queue.recv_timeout(Duration::from_secs(1)),
            Err(RecvTimeoutError::Disconnected)
        );
    }
}
