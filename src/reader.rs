use std::time::Duration;

pub use crossbeam::channel::{RecvTimeoutError, TryRecvError};

/// Queue consumer trait.
///
/// Implemented by [MutableQueue] and by broadcast [Subscription]s.
/// All methods take `&self`, so one reader can be shared between
/// several consumer threads. Each item is received by exactly one of them.
///
/// We expect it to be mainly used this way:
/// ```
/// # let queue = vino::MutableQueue::<usize>::new(4);
/// # queue.close();
/// use vino::Reader;
/// while let Some(value) = queue.recv() {
///     // Do something
/// }
/// ```
///
/// [MutableQueue]: crate::MutableQueue
/// [Subscription]: crate::broadcast::Subscription
pub trait Reader: Sized {
    type Item;

    /// Blocks until the next item arrives.
    ///
    /// `None` means end-of-stream: the queue is closed and fully drained.
    fn recv(&self) -> Option<Self::Item>;

    fn try_recv(&self) -> Result<Self::Item, TryRecvError>;

    fn recv_timeout(&self, timeout: Duration) -> Result<Self::Item, RecvTimeoutError>;

    #[inline]
    fn iter(&self) -> Iter<'_, Self> {
        Iter { reader: self }
    }
}

/// Blocking iterator over a [Reader].
///
/// Ends at end-of-stream. Constructed by [Reader::iter()].
pub struct Iter<'a, R: Reader> {
    reader: &'a R,
}

impl<'a, R: Reader> Iterator for Iter<'a, R> {
    type Item = R::Item;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.reader.recv()
    }
}
